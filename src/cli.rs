use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use pando_sim::SimOptions;
use pando_sim::event::PS_PER_NS;
use pando_sim::mem::Backend;
use pando_sim::stats::TraceFlags;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// Zero-latency accesses against in-process backing.
    Simple,
    /// Every access takes a fixed delay on a self-directed event.
    Selflink,
    /// Per-kind service latencies plus a remote-PXN hop penalty.
    Hierarchy,
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Built-in workload name, or a RISC-V ELF path with --riscv
    pub workload: PathBuf,

    /// Run the workload as an RV64 ELF on the RISC-V front-end
    #[arg(long)]
    pub riscv: bool,

    /// System dimensions, as a JSON file of sys_* keys
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = BackendKind::Hierarchy)]
    pub backend: BackendKind,

    /// Self-link backend delay in nanoseconds
    #[arg(long, default_value_t = 100)]
    pub latency: u64,

    /// Directory for tags.csv and stats.csv
    #[arg(long)]
    pub stats_dir: Option<PathBuf>,

    /// Core clock in Hz (defaults: 125 MHz native, 1 GHz riscv)
    #[arg(long)]
    pub clock: Option<u64>,

    /// Idle cycles before a core parks its clock
    #[arg(long, default_value_t = 1_000_000)]
    pub max_idle: u64,

    /// Hold RISC-V harts in reset until this many nanoseconds
    #[arg(long, default_value_t = 0)]
    pub release_reset: u64,

    /// Trace all remote-PXN memory traffic to the log
    #[arg(long)]
    pub trace_remote_pxn: bool,

    /// -v for debug, -vv for trace
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Arguments handed to the native workload
    #[arg(last = true)]
    pub args: Vec<String>,
}

impl Cli {
    pub fn sim_options(&self) -> SimOptions {
        let backend = match self.backend {
            BackendKind::Simple => Backend::Simple,
            BackendKind::Selflink => Backend::SelfLink { latency: self.latency * PS_PER_NS },
            BackendKind::Hierarchy => Backend::default(),
        };
        let clock_hz = self
            .clock
            .unwrap_or(if self.riscv { 1_000_000_000 } else { 125_000_000 });
        SimOptions {
            backend,
            stats_dir: self.stats_dir.clone(),
            clock_hz,
            max_idle: self.max_idle,
            trace: if self.trace_remote_pxn {
                TraceFlags::REMOTE_PXN_MEMORY
            } else {
                TraceFlags::empty()
            },
            release_reset: self.release_reset * PS_PER_NS,
            stack_in_l1sp: true,
        }
    }
}
