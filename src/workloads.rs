//! Built-in native workloads.
//!
//! Small state-machine programs exercising the fabric: each is a
//! [`Program`] whose `resume` publishes the next suspension state. They
//! stand in for real applications when driving the simulator without a
//! compiled binary.

use std::path::Path;

use log::info;
use pando_api::{AtomicOp, Stage, ThreadState, VAddr};
use pando_sim::{Program, Resume, SimError, ThreadContext};

pub type Build = fn(pando_api::Site, usize, &[String]) -> Box<dyn Program>;

pub fn lookup(name: &Path) -> Result<Build, SimError> {
    let name = name.to_string_lossy();
    match name.as_ref() {
        "counter" => Ok(|_, _, args| Box::new(Counter::new(parse_iters(args)))),
        "hello" => Ok(|_, _, _| Box::new(Hello { step: 0 })),
        "stream" => Ok(|_, _, args| Box::new(Stream::new(parse_iters(args)))),
        _ => Err(SimError::ExecutableLoad {
            path: name.as_ref().into(),
            reason: "not a built-in workload (counter, hello, stream); \
                     use --riscv for ELF binaries"
                .into(),
        }),
    }
}

fn parse_iters(args: &[String]) -> u64 {
    args.first().and_then(|s| s.parse().ok()).unwrap_or(1000)
}

/// Every thread hammers one shared DRAM word with atomic increments, then
/// thread (0,0,0,0) reads the total back.
struct Counter {
    iters: u64,
    done: u64,
    step: u32,
}

impl Counter {
    fn new(iters: u64) -> Self {
        Self { iters, done: 0, step: 0 }
    }

    fn word() -> u64 {
        VAddr::main_mem_base(0).encode()
    }
}

impl Program for Counter {
    fn resume(&mut self, resume: Resume, ctx: &mut ThreadContext<'_>) -> ThreadState {
        match self.step {
            0 => {
                self.step = 1;
                ThreadState::set_stage(Stage::ExecComp)
            }
            1 => {
                if self.done < self.iters {
                    self.done += 1;
                    ThreadState::atomic(
                        Self::word(),
                        AtomicOp::Add,
                        1u64.to_le_bytes().to_vec(),
                        None,
                    )
                } else if ctx.site.core_id() == 0 && ctx.site.pod == 0 && ctx.tid == 0 {
                    self.step = 2;
                    ThreadState::read(Self::word(), 8)
                } else {
                    ThreadState::Terminated
                }
            }
            _ => {
                if let Resume::Data(data) = resume {
                    let total = u64::from_le_bytes(data.try_into().unwrap_or_default());
                    info!("counter: total = {total}");
                    ctx.output_statistics("counter-done");
                }
                ThreadState::Terminated
            }
        }
    }
}

/// Store a greeting in local L1SP, read it back, log it.
struct Hello {
    step: u32,
}

impl Program for Hello {
    fn resume(&mut self, resume: Resume, ctx: &mut ThreadContext<'_>) -> ThreadState {
        let addr = VAddr::L1sp { home: None, offset: 0x100 + 8 * ctx.tid as u32 }.encode();
        match self.step {
            0 => {
                self.step = 1;
                let greeting = 0x6F6C_6C65_68u64 + ((ctx.tid as u64) << 40);
                ThreadState::write(addr, greeting.to_le_bytes().to_vec())
            }
            1 => {
                self.step = 2;
                ThreadState::read(addr, 8)
            }
            _ => {
                if let Resume::Data(data) = resume {
                    info!(
                        "hello from {} thread {}: {:#018x}",
                        ctx.site,
                        ctx.tid,
                        u64::from_le_bytes(data.try_into().unwrap_or_default())
                    );
                }
                ThreadState::Terminated
            }
        }
    }
}

/// Copy a run of words from DRAM into the pod's L2SP, one load/store pair
/// per word, spread across the threads.
struct Stream {
    words: u64,
    at: u64,
}

impl Stream {
    fn new(words: u64) -> Self {
        Self { words, at: 0 }
    }
}

impl Program for Stream {
    fn resume(&mut self, resume: Resume, ctx: &mut ThreadContext<'_>) -> ThreadState {
        let stride = ctx.config.threads_per_core() as u64;
        if let Resume::Data(data) = resume {
            // loaded a word; store it to the L2SP mirror
            let offset = (self.at * stride + ctx.tid as u64) * 8;
            self.at += 1;
            return ThreadState::write(
                VAddr::L2sp { home: None, offset: offset as u32 }.encode(),
                data,
            );
        }
        if self.at < self.words {
            let offset = (self.at * stride + ctx.tid as u64) * 8;
            ThreadState::read(VAddr::main_mem_base(ctx.site.pxn).encode() + offset, 8)
        } else {
            ThreadState::Terminated
        }
    }
}
