//! Cycle-driven simulation engine for the PANDO fabric.
//!
//! The engine drives per-core schedulers through an ordered event queue,
//! routes memory requests through bank-interleaved controllers, and
//! aggregates per-thread statistics. Two execution front-ends exist: native
//! state-machine programs ([`core::Program`]) and RISC-V ELF binaries
//! ([`riscv`]); a core is configured with exactly one.

pub mod core;
pub mod event;
pub mod mem;
pub mod riscv;
pub mod sim;
pub mod stats;

pub use crate::core::{Program, Resume, ThreadContext};
pub use crate::sim::{SimOptions, Simulation, Summary};

use pando_api::{AddrError, PAddr, Site};
use thiserror::Error;

/// Fatal simulation errors.
///
/// Every one of these means the simulator or the workload is broken and no
/// meaningful result can come out of continuing; the driver prints the
/// diagnostic and aborts. Delayed requests, idle cores and threads that
/// never terminate are not errors.
#[derive(Debug, Error)]
pub enum SimError {
    /// An address that routes to no controller. Always a bug upstream.
    #[error("no controller owns {paddr} (misrouted request)")]
    InvalidAddress { paddr: PAddr },

    #[error(transparent)]
    UnknownAddressType(#[from] AddrError),

    /// Atomic width outside {1, 2, 4, 8} or a CAS without its expected
    /// operand.
    #[error("invalid atomic: {what} at {paddr}")]
    InvalidAtomic { what: String, paddr: PAddr },

    /// A thread yielded (or completed against) a state the protocol does
    /// not know how to handle.
    #[error("thread {tid} at {site} is in unexpected state `{state}`")]
    UnknownThreadState { site: Site, tid: usize, state: &'static str },

    #[error("cannot load executable {path:?}: {reason}")]
    ExecutableLoad { path: std::path::PathBuf, reason: String },

    /// The RISC-V front-end fetched something it cannot decode.
    #[error("illegal instruction {raw:#010x} at pc {pc:#x}")]
    IllegalInstruction { pc: u64, raw: u32 },

    /// Controller population does not match the configured dimensions.
    #[error("configuration mismatch: {what} (found {found}, expected {expected})")]
    ConfigMismatch { what: String, found: usize, expected: usize },
}
