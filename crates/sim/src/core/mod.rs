//! The native per-core execution engine.
//!
//! Each core hosts a fixed set of threads scheduled round-robin under the
//! cooperative yield protocol: one thread makes progress per tick, runs
//! exactly one operation, and surrenders the core by publishing a
//! [`ThreadState`]. The scheduler dispatches that state (memory request,
//! nop timer, stage change, termination) and moves on. A thread stays
//! blocked until its state's completion flag flips.
//!
//! Workloads are state machines implementing [`Program`]: every `resume`
//! call receives the completion of the previous request and answers with
//! the next suspension state. This is the explicit-continuation rendering
//! of the stackful-coroutine API the fabric exposes to native code.

mod thread;

pub use thread::{Program, Resume, Thread, ThreadContext};

use log::{debug, log_enabled, trace};
use pando_api::{PAddr, Site, SysConfig, ThreadState, VAddr};

use crate::SimError;
use crate::event::{Event, EventQueue, Time};
use crate::mem::{MemOp, MemRequest, Memory, MemResponse};
use crate::stats::{Access, CoreStats, Dest, TraceFlags, classify};

const NO_THREAD_READY: usize = usize::MAX;

pub struct Core {
    /// Slot of this core in the simulation's core table.
    index: usize,
    site: Site,
    threads: Vec<Thread>,
    last_thread: usize,
    /// Threads that have not reached Terminated yet.
    live: usize,
    idle_cycles: u64,
    max_idle: u64,
    period: Time,
    /// Whether the clock is registered; a parked core stops ticking until
    /// a response arrives.
    on: bool,
    off_since: Time,
    outstanding: u32,
    next_token: u32,
    trace: TraceFlags,
    pub stats: CoreStats,
    /// Statistic dump requests collected from programs this tick.
    pub pending_dumps: Vec<String>,
}

impl Core {
    pub fn new(
        index: usize,
        site: Site,
        period: Time,
        max_idle: u64,
        trace: TraceFlags,
        programs: Vec<Box<dyn Program>>,
    ) -> Self {
        let threads: Vec<Thread> = programs.into_iter().map(Thread::new).collect();
        let live = threads.len();
        Self {
            index,
            site,
            stats: CoreStats::new(live),
            threads,
            last_thread: live.saturating_sub(1),
            live,
            idle_cycles: 0,
            max_idle,
            period,
            on: true,
            off_since: 0,
            outstanding: 0,
            next_token: 0,
            trace,
            pending_dumps: Vec::new(),
        }
    }

    pub fn site(&self) -> Site {
        self.site
    }

    pub fn period(&self) -> Time {
        self.period
    }

    pub fn is_on(&self) -> bool {
        self.on
    }

    /// All threads terminated: the core signals ok-to-end to the driver.
    pub fn all_done(&self) -> bool {
        self.live == 0
    }

    /// Round-robin scan from the thread after the last one scheduled.
    /// Every *other* ready thread bypassed in the scan is charged one
    /// stall-when-ready cycle; those are the contention cycles.
    fn select_ready_thread(&mut self) -> usize {
        let n = self.threads.len();
        let mut selected = NO_THREAD_READY;
        for t in 0..n {
            let tid = (self.last_thread + 1 + t) % n;
            if !self.threads[tid].state.can_resume() {
                continue;
            }
            if selected == NO_THREAD_READY {
                selected = tid;
            } else {
                let stage = self.threads[tid].stage;
                self.stats.threads[tid].stalled_when_ready(stage);
            }
        }
        selected
    }

    /// One clock edge. Resumes at most one thread and dispatches whatever
    /// state it yields.
    pub fn tick(
        &mut self,
        queue: &mut EventQueue,
        memory: &Memory,
        cfg: &SysConfig,
    ) -> Result<(), SimError> {
        let tid = self.select_ready_thread();
        if tid == NO_THREAD_READY {
            self.idle_cycles += 1;
            // charge the stall against the stage of the last running thread
            let stage = self.threads.get(self.last_thread).map(|t| t.stage).unwrap_or_default();
            self.stats.stall(stage, 1);
            self.tag_cycles(1);
            return Ok(());
        }
        self.idle_cycles = 0;

        let cycle = queue.now() / self.period;
        let dump = self.threads[tid].resume(tid, self.site, cfg, cycle);
        if let Some(tag) = dump {
            self.pending_dumps.push(tag);
        }
        self.last_thread = tid;
        let stage = self.threads[tid].stage;
        self.stats.busy(stage, 1);
        self.tag_cycles(1);

        self.dispatch_yield(tid, queue, memory)
    }

    /// Inspect the state the thread yielded back and hand it to whoever
    /// completes it. Unknown shapes are fatal.
    fn dispatch_yield(
        &mut self,
        tid: usize,
        queue: &mut EventQueue,
        memory: &Memory,
    ) -> Result<(), SimError> {
        match &self.threads[tid].state {
            ThreadState::Running => Ok(()),
            ThreadState::Terminated => {
                debug!("core {}: thread {tid} terminated", self.site);
                self.live -= 1;
                Ok(())
            }
            &ThreadState::Nop { cycles, .. } => {
                trace!("core {}: thread {tid} nop for {cycles} cycles", self.site);
                queue.push(
                    queue.now() + cycles * self.period,
                    Event::NopDone { core: self.index, tid },
                );
                Ok(())
            }
            &ThreadState::SetStage { stage, .. } => {
                // applied synchronously; the thread is resumable next tick
                self.threads[tid].stage = stage;
                self.threads[tid].state.complete();
                Ok(())
            }
            ThreadState::MemRead { .. }
            | ThreadState::MemWrite { .. }
            | ThreadState::MemAtomic { .. }
            | ThreadState::ToNative { .. } => self.dispatch_mem(tid, queue, memory),
        }
    }

    fn dispatch_mem(
        &mut self,
        tid: usize,
        queue: &mut EventQueue,
        memory: &Memory,
    ) -> Result<(), SimError> {
        let (vaddr_raw, op, access) = match &self.threads[tid].state {
            ThreadState::MemRead { addr, size, .. } => {
                (*addr, MemOp::Read { size: *size }, Some(Access::Load))
            }
            ThreadState::MemWrite { addr, payload, .. } => {
                (*addr, MemOp::Write { data: payload.clone() }, Some(Access::Store))
            }
            ThreadState::MemAtomic { addr, op, wdata, ext, .. } => (
                *addr,
                MemOp::Atomic { op: *op, wdata: wdata.clone(), ext: ext.clone() },
                Some(Access::Atomic),
            ),
            ThreadState::ToNative { addr, .. } => (*addr, MemOp::ToNative, None),
            other => {
                return Err(SimError::UnknownThreadState {
                    site: self.site,
                    tid,
                    state: other.kind_name(),
                });
            }
        };
        let paddr = VAddr::decode(vaddr_raw).to_physical(self.site);

        if let Some(access) = access {
            self.record_access(tid, access, paddr);
        }

        // control-register writes are delivered to the owning core, not to
        // a memory controller
        if let PAddr::Ctrl { pxn, pod, core_y, core_x, offset } = paddr {
            let MemOp::Write { data } = op else {
                return Err(SimError::InvalidAddress { paddr });
            };
            let value = u64::from_le_bytes(
                data.try_into().map_err(|_| SimError::InvalidAddress { paddr })?,
            );
            let dst = Site { pxn, pod, core_y, core_x };
            let token = self.issue_token(tid);
            queue.push(
                queue.now() + self.period,
                Event::CtrlWrite { dst, offset, value, origin: Some((self.index, tid, token)) },
            );
            self.outstanding += 1;
            return Ok(());
        }

        let token = self.issue_token(tid);
        let req = MemRequest { core: self.index, tid, token, paddr, op };
        match memory.submit(queue, self.site.pxn, req)? {
            Some(resp) => self.apply_response(tid, token, resp),
            None => {
                self.outstanding += 1;
                Ok(())
            }
        }
    }

    fn issue_token(&mut self, tid: usize) -> u32 {
        let token = self.next_token;
        self.next_token = self.next_token.wrapping_add(1);
        self.threads[tid].token = token;
        token
    }

    fn record_access(&mut self, tid: usize, access: Access, paddr: PAddr) {
        let Some(dest) = classify(paddr, self.site.pxn) else { return };
        let stage = self.threads[tid].stage;
        self.stats.threads[tid].record(stage, access, dest);
        if dest == Dest::RemotePxn
            && self.trace.covers(access)
            && log_enabled!(target: "remote_pxn", log::Level::Debug)
        {
            debug!(
                target: "remote_pxn",
                "OP={}:SRC={}:SRC_THREAD={tid}:DST_PXN={}:ADDR={paddr}",
                access.name(),
                self.site,
                paddr.pxn(),
            );
        }
    }

    /// A memory response arrived for `tid`. Writes the payload into the
    /// thread's outstanding state and makes it resumable.
    pub fn complete_mem(
        &mut self,
        tid: usize,
        token: u32,
        resp: MemResponse,
        queue: &mut EventQueue,
    ) -> Result<(), SimError> {
        self.outstanding = self.outstanding.saturating_sub(1);
        self.apply_response(tid, token, resp)?;
        self.assert_on(queue);
        Ok(())
    }

    fn apply_response(
        &mut self,
        tid: usize,
        token: u32,
        resp: MemResponse,
    ) -> Result<(), SimError> {
        let thread = &mut self.threads[tid];
        let stale = thread.token != token;
        let ok = match (&mut thread.state, resp) {
            _ if stale => false,
            (ThreadState::MemRead { result, .. }, MemResponse::Data(data)) => {
                *result = Some(data);
                true
            }
            (ThreadState::MemWrite { .. }, MemResponse::WriteDone) => true,
            (ThreadState::MemAtomic { result, .. }, MemResponse::AtomicData(data)) => {
                *result = Some(data);
                true
            }
            (ThreadState::ToNative { region, .. }, MemResponse::Native(r)) => {
                *region = Some(r);
                true
            }
            _ => false,
        };
        if !ok {
            return Err(SimError::UnknownThreadState {
                site: self.site,
                tid,
                state: thread.state.kind_name(),
            });
        }
        thread.state.complete();
        Ok(())
    }

    /// A nop timer fired.
    pub fn complete_nop(&mut self, tid: usize, queue: &mut EventQueue) -> Result<(), SimError> {
        let thread = &mut self.threads[tid];
        if !matches!(thread.state, ThreadState::Nop { .. }) {
            return Err(SimError::UnknownThreadState {
                site: self.site,
                tid,
                state: thread.state.kind_name(),
            });
        }
        thread.state.complete();
        self.assert_on(queue);
        Ok(())
    }

    /// A write landed in this core's control-register window. Offset 0 is
    /// the reset register, which the native front-end has no harts to apply
    /// to; anything else is logged and ignored.
    pub fn ctrl_write(&mut self, offset: u32, value: u64) {
        debug!(
            "core {}: control register write offset {offset:#x} value {value:#x}",
            self.site
        );
    }

    /// Park the clock once the core has been idle long enough and nothing
    /// is in flight, or when every thread has terminated.
    pub fn should_unregister(&self) -> bool {
        self.all_done() || (self.idle_cycles >= self.max_idle && self.outstanding == 0)
    }

    pub fn park(&mut self, now: Time) {
        if self.on {
            trace!("core {}: unregistering clock", self.site);
            self.on = false;
            self.off_since = now;
        }
    }

    /// Re-register the clock on an incoming response. The parked gap is
    /// accounted as stall and tag cycles.
    pub fn assert_on(&mut self, queue: &mut EventQueue) {
        if self.on || self.all_done() {
            return;
        }
        self.on = true;
        let now = queue.now();
        let gap = (now.saturating_sub(self.off_since)) / self.period;
        let stage = self.threads.get(self.last_thread).map(|t| t.stage).unwrap_or_default();
        self.stats.stall(stage, gap);
        self.tag_cycles(gap);
        let next = (now / self.period + 1) * self.period;
        queue.push(next, Event::Tick { core: self.index });
        trace!("core {}: clock reregistered at {next}", self.site);
    }

    fn tag_cycles(&mut self, n: u64) {
        if n == 0 {
            return;
        }
        for (tid, thread) in self.threads.iter().enumerate() {
            self.stats.threads[tid].tag_cycles(thread.stage, thread.tag, n);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pando_api::{Stage, ThreadState};

    /// Yields each state from a fixed script, then terminates.
    struct Scripted {
        script: Vec<ThreadState>,
        pub seen: Vec<Resume>,
    }

    impl Scripted {
        fn new(script: Vec<ThreadState>) -> Self {
            Self { script, seen: Vec::new() }
        }
    }

    impl Program for Scripted {
        fn resume(&mut self, resume: Resume, _ctx: &mut ThreadContext) -> ThreadState {
            self.seen.push(resume);
            if self.script.is_empty() {
                ThreadState::Terminated
            } else {
                self.script.remove(0)
            }
        }
    }

    fn one_core(programs: Vec<Box<dyn Program>>) -> (Core, Memory, EventQueue, SysConfig) {
        let cfg = SysConfig { sys_core_threads: programs.len() as u32, ..SysConfig::default() };
        let map = crate::mem::MemoryMap::build(&cfg).unwrap();
        let memory = Memory::new(map, crate::mem::Backend::Simple);
        let core = Core::new(0, Site::new(0, 0, 0), 8000, 100, TraceFlags::empty(), programs);
        (core, memory, EventQueue::new(), cfg)
    }

    #[test]
    fn threads_advance_round_robin_one_per_tick() {
        let programs: Vec<Box<dyn Program>> = (0..3)
            .map(|_| {
                Box::new(Scripted::new(vec![ThreadState::Running, ThreadState::Running]))
                    as Box<dyn Program>
            })
            .collect();
        let (mut core, memory, mut q, cfg) = one_core(programs);
        // 3 threads x 3 resumes (2 running + terminate) = 9 ticks to drain
        for _ in 0..9 {
            assert!(!core.all_done());
            core.tick(&mut q, &memory, &cfg).unwrap();
        }
        assert!(core.all_done());
    }

    #[test]
    fn store_then_load_roundtrip_through_the_core() {
        let addr = VAddr::L1sp { home: None, offset: 0x100 }.encode();
        let value = 0xDEAD_BEEF_CAFE_BABEu64;
        let script = vec![
            ThreadState::MemWrite { addr, payload: value.to_le_bytes().to_vec(), done: false },
            ThreadState::MemRead { addr, size: 8, result: None, done: false },
        ];
        let (mut core, memory, mut q, cfg) = one_core(vec![Box::new(Scripted::new(script))]);
        for _ in 0..3 {
            core.tick(&mut q, &memory, &cfg).unwrap();
        }
        assert!(core.all_done());
        assert_eq!(core.stats.threads[0].total.get(Access::Store, Dest::L1sp), 1);
        assert_eq!(core.stats.threads[0].total.get(Access::Load, Dest::L1sp), 1);
    }

    #[test]
    fn set_stage_applies_synchronously() {
        let script = vec![ThreadState::SetStage { stage: Stage::ExecComp, done: false }];
        let (mut core, memory, mut q, cfg) = one_core(vec![Box::new(Scripted::new(script))]);
        core.tick(&mut q, &memory, &cfg).unwrap();
        assert_eq!(core.threads[0].stage, Stage::ExecComp);
        assert!(core.threads[0].state.can_resume());
    }

    #[test]
    fn idle_core_parks_after_max_idle() {
        let script = vec![ThreadState::Nop { cycles: 1_000_000, done: false }];
        let (mut core, memory, mut q, cfg) = one_core(vec![Box::new(Scripted::new(script))]);
        core.tick(&mut q, &memory, &cfg).unwrap();
        for _ in 0..=100 {
            core.tick(&mut q, &memory, &cfg).unwrap();
        }
        assert!(core.should_unregister());
        core.park(q.now());
        assert!(!core.is_on());
        // the nop completion wakes it back up
        core.complete_nop(0, &mut q).unwrap();
        assert!(core.is_on());
    }
}
