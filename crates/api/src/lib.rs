//! Client-visible contracts of the PANDO fabric.
//!
//! Everything in this crate is pure data: address encodings, the atomic
//! read-modify-write algebra, the system configuration record and the
//! thread-state variants a hart publishes when it suspends. The simulation
//! engine lives in `pando-sim` and consumes these types; workloads consume
//! them through the runtime surface.

pub mod addr;
pub mod locality;
pub mod rmw;
pub mod state;
pub mod sysconfig;

pub use addr::{AddrError, MemKind, PAddr, VAddr};
pub use locality::Site;
pub use rmw::AtomicOp;
pub use state::{NativeRegion, Stage, ThreadState};
pub use sysconfig::SysConfig;
