//! Simulation construction and the event loop.
//!
//! One `Simulation` owns the full system: every core the configuration
//! names, the frozen memory map, the event queue and the statistics sink.
//! Cores are homogeneous: all native (each thread running a program from
//! the supplied factory) or all RISC-V (every core executing the same ELF).
//! The run loop drains the event queue until every core has signaled
//! ok-to-end; an empty queue before that means the workload can never make
//! progress again and the run is reported unsuccessful.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use hashbrown::HashMap;
use log::{info, warn};
use pando_api::{Site, SysConfig, VAddr};

use crate::SimError;
use crate::core::{Core, Program};
use crate::event::{Event, EventQueue, PS_PER_SEC, Time};
use crate::mem::{Backend, Memory, MemoryMap};
use crate::riscv::{Image, RiscvCore, schedule_reset_release};
use crate::stats::{CoreStats, StatsWriter, TraceFlags};

#[derive(Debug, Clone)]
pub struct SimOptions {
    pub backend: Backend,
    /// Where tags.csv / stats.csv land; `None` disables the writer.
    pub stats_dir: Option<PathBuf>,
    pub clock_hz: u64,
    pub max_idle: u64,
    pub trace: TraceFlags,
    /// RISC-V cores start in reset and are released at this time; zero
    /// starts them running.
    pub release_reset: Time,
    /// Seed each hart's stack pointer into a private slice of its L1SP.
    pub stack_in_l1sp: bool,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            stats_dir: None,
            clock_hz: 125_000_000,
            max_idle: 1_000_000,
            trace: TraceFlags::empty(),
            release_reset: 0,
            stack_in_l1sp: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub time_ps: Time,
    /// True iff every thread on every core terminated (with exit code 0
    /// for RISC-V harts).
    pub success: bool,
}

enum CoreSlot {
    Native(Core),
    Riscv(RiscvCore),
}

impl CoreSlot {
    fn all_done(&self) -> bool {
        match self {
            CoreSlot::Native(c) => c.all_done(),
            CoreSlot::Riscv(c) => c.all_done(),
        }
    }

    fn site(&self) -> Site {
        match self {
            CoreSlot::Native(c) => c.site(),
            CoreSlot::Riscv(c) => c.site(),
        }
    }

    fn stats(&self) -> &CoreStats {
        match self {
            CoreSlot::Native(c) => &c.stats,
            CoreSlot::Riscv(c) => &c.stats,
        }
    }
}

pub struct Simulation {
    cfg: SysConfig,
    queue: EventQueue,
    cores: Vec<CoreSlot>,
    memory: Memory,
    stats: Option<StatsWriter>,
    site_index: HashMap<Site, usize>,
    period: Time,
}

fn all_sites(cfg: &SysConfig) -> Vec<Site> {
    let mut sites = Vec::new();
    for pxn in 0..cfg.num_pxn() as u16 {
        for pod in 0..cfg.pods_per_pxn() as u8 {
            for core in 0..cfg.cores_per_pod() {
                sites.push(Site::new(pxn, pod, core));
            }
        }
    }
    sites
}

impl Simulation {
    /// Build a system of native cores. The factory is called once per
    /// (site, thread) to produce that thread's program.
    pub fn native<F>(cfg: SysConfig, opts: SimOptions, mut factory: F) -> Result<Self, SimError>
    where
        F: FnMut(Site, usize) -> Box<dyn Program>,
    {
        let memory = Memory::new(MemoryMap::build(&cfg)?, opts.backend);
        let period = PS_PER_SEC / opts.clock_hz;
        let mut cores = Vec::new();
        let mut site_index = HashMap::new();
        for (index, site) in all_sites(&cfg).into_iter().enumerate() {
            let programs = (0..cfg.threads_per_core() as usize)
                .map(|tid| factory(site, tid))
                .collect();
            cores.push(CoreSlot::Native(Core::new(
                index,
                site,
                period,
                opts.max_idle,
                opts.trace,
                programs,
            )));
            site_index.insert(site, index);
        }
        Self::finish_build(cfg, opts, cores, memory, site_index, period)
    }

    /// Build a system of RISC-V cores all executing `executable`.
    pub fn riscv(cfg: SysConfig, opts: SimOptions, executable: &Path) -> Result<Self, SimError> {
        let memory = Memory::new(MemoryMap::build(&cfg)?, opts.backend);
        let period = PS_PER_SEC / opts.clock_hz;
        let image = Arc::new(Image::load(executable)?);
        let start_in_reset = opts.release_reset > 0;
        let mut cores = Vec::new();
        let mut site_index = HashMap::new();
        for (index, site) in all_sites(&cfg).into_iter().enumerate() {
            // one designated core loads the shared segments; every core
            // loads its own L1SP-resident ones
            let loader = index == 0;
            let mut core = RiscvCore::new(
                index,
                site,
                period,
                cfg.threads_per_core(),
                image.clone(),
                loader,
                start_in_reset,
                &cfg,
                opts.trace,
            );
            core.setup(&memory)?;
            if opts.stack_in_l1sp {
                // each hart gets an even slice of the scratchpad; sp starts
                // 16 bytes under its top so the seed stays inside the
                // 17-bit offset field
                let harts = cfg.threads_per_core() as u64;
                let slice = cfg.l1sp_size() / harts;
                for h in 0..harts as usize {
                    let top = slice * (h as u64 + 1) - 16;
                    let sp = VAddr::L1sp { home: None, offset: top as u32 }.encode();
                    core.set_sp(h, sp);
                }
            }
            cores.push(CoreSlot::Riscv(core));
            site_index.insert(site, index);
        }
        Self::finish_build(cfg, opts, cores, memory, site_index, period)
    }

    fn finish_build(
        cfg: SysConfig,
        opts: SimOptions,
        cores: Vec<CoreSlot>,
        memory: Memory,
        site_index: HashMap<Site, usize>,
        period: Time,
    ) -> Result<Self, SimError> {
        let stats = match &opts.stats_dir {
            Some(dir) => Some(StatsWriter::new(dir).map_err(|e| SimError::ExecutableLoad {
                path: dir.clone(),
                reason: format!("cannot create statistics directory: {e}"),
            })?),
            None => None,
        };
        let mut queue = EventQueue::new();
        for index in 0..cores.len() {
            queue.push(period, Event::Tick { core: index });
        }
        if opts.release_reset > 0 {
            let sites: Vec<Site> = cores.iter().map(|c| c.site()).collect();
            schedule_reset_release(&mut queue, &sites, opts.release_reset);
        }
        Ok(Self { cfg, queue, cores, memory, stats, site_index, period })
    }

    pub fn config(&self) -> &SysConfig {
        &self.cfg
    }

    /// Untimed access to simulated memory, for setup and inspection.
    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    fn write_dumps(
        stats: &mut Option<StatsWriter>,
        cores: &[CoreSlot],
        now: Time,
        tags: Vec<String>,
    ) {
        let Some(writer) = stats.as_mut() else { return };
        for tag in tags {
            let rows = cores
                .iter()
                .map(|c| (format!("{}", c.site()), c.stats()));
            if let Err(e) = writer.output(now, &tag, rows) {
                warn!("statistics write failed: {e}");
            }
        }
    }

    /// Drive the event queue to completion.
    pub fn run(&mut self) -> Result<Summary, SimError> {
        let Self { cfg, queue, cores, memory, stats, site_index, period } = self;
        let period = *period;

        while let Some((now, event)) = queue.pop() {
            match event {
                Event::Tick { core } => {
                    match &mut cores[core] {
                        CoreSlot::Native(c) => {
                            c.tick(queue, memory, cfg)?;
                            let dumps = std::mem::take(&mut c.pending_dumps);
                            if c.should_unregister() {
                                c.park(now);
                            } else {
                                queue.push(now + period, Event::Tick { core });
                            }
                            if !dumps.is_empty() {
                                Self::write_dumps(stats, cores, now, dumps);
                            }
                        }
                        CoreSlot::Riscv(c) => {
                            c.tick(queue, memory)?;
                            if !c.all_done() {
                                queue.push(now + period, Event::Tick { core });
                            }
                        }
                    }
                }
                Event::NopDone { core, tid } => match &mut cores[core] {
                    CoreSlot::Native(c) => c.complete_nop(tid, queue)?,
                    CoreSlot::Riscv(c) => {
                        return Err(SimError::UnknownThreadState {
                            site: c.site(),
                            tid,
                            state: "nop completion on a riscv core",
                        });
                    }
                },
                Event::MemAccess(req) => {
                    // the access happens at the controller now; the
                    // response fires as its own event so completions reach
                    // the ready queue in delivery order
                    let resp = memory.perform(&req)?;
                    queue.push(
                        now,
                        Event::MemResponse { core: req.core, tid: req.tid, token: req.token, resp },
                    );
                }
                Event::MemResponse { core, tid, token, resp } => match &mut cores[core] {
                    CoreSlot::Native(c) => c.complete_mem(tid, token, resp, queue)?,
                    CoreSlot::Riscv(c) => c.complete_mem(tid, token, resp)?,
                },
                Event::CtrlWrite { dst, offset, value, origin } => {
                    let Some(&idx) = site_index.get(&dst) else {
                        return Err(SimError::InvalidAddress {
                            paddr: pando_api::PAddr::Ctrl {
                                pxn: dst.pxn,
                                pod: dst.pod,
                                core_y: dst.core_y,
                                core_x: dst.core_x,
                                offset,
                            },
                        });
                    };
                    match &mut cores[idx] {
                        CoreSlot::Native(c) => c.ctrl_write(offset, value),
                        CoreSlot::Riscv(c) => c.ctrl_write(offset, value),
                    }
                    if let Some((core, tid, token)) = origin {
                        match &mut cores[core] {
                            CoreSlot::Native(c) => {
                                c.complete_mem(tid, token, crate::mem::MemResponse::WriteDone, queue)?
                            }
                            CoreSlot::Riscv(c) => {
                                c.complete_mem(tid, token, crate::mem::MemResponse::WriteDone)?
                            }
                        }
                    }
                }
            }

            if cores.iter().all(|c| c.all_done()) {
                break;
            }
        }

        let mut success = self.cores.iter().all(|c| c.all_done());
        for core in &self.cores {
            if let CoreSlot::Riscv(c) = core {
                success &= c.exit_codes().all(|code| code == 0);
            }
        }
        if !success {
            warn!("simulation ended with unfinished or failing threads");
        }
        if let Some(writer) = self.stats.as_mut() {
            let rows = self.cores.iter().map(|c| (format!("{}", c.site()), c.stats()));
            if let Err(e) = writer.finish(self.queue.now(), rows) {
                warn!("final statistics write failed: {e}");
            }
        }
        info!(
            "simulation {} at {} ps",
            if success { "completed" } else { "stopped" },
            self.queue.now()
        );
        Ok(Summary { time_ps: self.queue.now(), success })
    }

    /// Per-core statistics, labeled by site.
    pub fn core_stats(&self) -> impl Iterator<Item = (Site, &CoreStats)> {
        self.cores.iter().map(|c| (c.site(), c.stats()))
    }

    /// RISC-V hart exit codes, if this is a RISC-V system.
    pub fn exit_codes(&self) -> Vec<i64> {
        self.cores
            .iter()
            .flat_map(|c| match c {
                CoreSlot::Riscv(r) => r.exit_codes().collect::<Vec<_>>(),
                CoreSlot::Native(_) => Vec::new(),
            })
            .collect()
    }
}
