//! Driver binary: one invocation runs one simulation.
//!
//! The workload is either a named built-in native program or, with
//! `--riscv`, a path to an RV64 ELF. Exit status is zero iff every thread
//! on every core terminated cleanly.

mod cli;
mod logger;
mod workloads;

use std::fs;
use std::process::ExitCode;

use clap::Parser;
use log::error;

use pando_api::SysConfig;
use pando_sim::{SimError, Simulation, Summary};

use cli::Cli;

fn main() -> ExitCode {
    let cli = Cli::parse();
    logger::init(cli.verbose);
    match run(&cli) {
        Ok(summary) if summary.success => ExitCode::SUCCESS,
        Ok(_) => {
            error!("workload did not terminate cleanly");
            ExitCode::FAILURE
        }
        Err(e) => {
            // all simulator errors are fatal: one diagnostic, then abort
            error!("fatal: {e}");
            ExitCode::from(2)
        }
    }
}

fn run(cli: &Cli) -> Result<Summary, SimError> {
    let cfg = match &cli.config {
        Some(path) => {
            let text = fs::read_to_string(path).map_err(|e| SimError::ExecutableLoad {
                path: path.clone(),
                reason: format!("cannot read configuration: {e}"),
            })?;
            serde_json::from_str::<SysConfig>(&text).map_err(|e| SimError::ExecutableLoad {
                path: path.clone(),
                reason: format!("bad configuration: {e}"),
            })?
        }
        None => SysConfig::default(),
    };
    let opts = cli.sim_options();

    let mut sim = if cli.riscv {
        Simulation::riscv(cfg, opts, cli.workload.as_ref())?
    } else {
        let build = workloads::lookup(&cli.workload)?;
        Simulation::native(cfg, opts, |site, tid| build(site, tid, &cli.args))?
    };
    sim.run()
}
