//! The RISC-V per-core execution engine.
//!
//! Each core hosts a set of harts scheduled round-robin: one ready hart
//! executes one instruction per tick. Instructions are fetched from the
//! loaded ELF image (the i-cache backing, untimed); data traffic goes
//! through the modeled memory subsystem. A memory-touching instruction
//! stalls its hart behind a [`Pending`] record until the response comes
//! back, writes the destination register there, and advances the pc.

mod elf;
mod exec;
mod hart;
mod syscall;

pub use elf::Image;
pub use hart::{Hart, Pending, ReadCont};
pub use syscall::FdTable;

use std::sync::Arc;

use log::{debug, trace, warn};
use pando_api::{MemKind, PAddr, Site, Stage, SysConfig, VAddr};

use crate::SimError;
use crate::event::{Event, EventQueue, Time};
use crate::mem::{MemOp, MemRequest, Memory, MemResponse};
use crate::stats::{Access, CoreStats, Dest, TraceFlags, classify};

/// Debug-print window at the top of the virtual address space. Stores are
/// intercepted before translation and complete in the issuing tick.
pub const MMIO_BASE: u64 = 0xFFFF_FFFF_FFFF_0000;
pub const MMIO_SIZE: u64 = 0x10000;
pub const MMIO_PRINT_INT: u64 = MMIO_BASE;
pub const MMIO_PRINT_HEX: u64 = MMIO_BASE + 0x8;
pub const MMIO_PRINT_CHAR: u64 = MMIO_BASE + 0x10;
pub const MMIO_PRINT_TIME: u64 = MMIO_BASE + 0x18;

pub struct RiscvCore {
    index: usize,
    site: Site,
    harts: Vec<Hart>,
    last_hart: usize,
    image: Arc<Image>,
    period: Time,
    load_program: bool,
    /// Chunk bound for syscall buffer traffic.
    max_req: usize,
    config: SysConfig,
    next_token: u32,
    files: FdTable,
    trace: TraceFlags,
    pub stats: CoreStats,
    /// Retired instructions per hart.
    pub instret: Vec<u64>,
}

impl RiscvCore {
    pub fn new(
        index: usize,
        site: Site,
        period: Time,
        harts: u32,
        image: Arc<Image>,
        load_program: bool,
        start_in_reset: bool,
        cfg: &SysConfig,
        trace: TraceFlags,
    ) -> Self {
        let harts: Vec<Hart> = (0..harts).map(|_| Hart::new(start_in_reset)).collect();
        let n = harts.len();
        Self {
            index,
            site,
            harts,
            last_hart: n.saturating_sub(1),
            image,
            period,
            load_program,
            max_req: cfg.max_request_size(),
            config: cfg.clone(),
            next_token: 0,
            files: FdTable::new(),
            trace,
            stats: CoreStats::new(n),
            instret: vec![0; n],
        }
    }

    pub fn site(&self) -> Site {
        self.site
    }

    pub fn period(&self) -> Time {
        self.period
    }

    pub(crate) fn hart(&mut self, h: usize) -> &mut Hart {
        &mut self.harts[h]
    }

    pub fn harts(&self) -> &[Hart] {
        &self.harts
    }

    /// Exit status: success iff every hart exited with code zero.
    pub fn exit_codes(&self) -> impl Iterator<Item = i64> + '_ {
        self.harts.iter().map(|h| h.exit_code)
    }

    pub fn all_done(&self) -> bool {
        self.harts.iter().all(|h| h.exited)
    }

    /// Point every hart's reset vector at the image entry and copy the
    /// loadable segments into simulated memory. Segments living in this
    /// core's own L1SP are always loaded; everything else only by the
    /// designated loader core.
    pub fn setup(&mut self, memory: &Memory) -> Result<(), SimError> {
        for seg in self.image.segments() {
            let paddr = VAddr::decode(seg.paddr).to_physical(self.site);
            let own_l1 = paddr.memory_type() == Some(MemKind::L1sp)
                && paddr.pxn() == self.site.pxn;
            if !self.load_program && !own_l1 {
                continue;
            }
            debug!(
                "core {}: loading segment vaddr={:#x} -> {paddr} ({} file bytes, {} total)",
                self.site,
                seg.vaddr,
                seg.data.len(),
                seg.memsz
            );
            memory.write_blob(paddr, &seg.data)?;
            let bss = seg.memsz as usize - seg.data.len();
            if bss > 0 {
                memory.write_blob(paddr.add_offset(seg.data.len() as u64), &vec![0u8; bss])?;
            }
        }
        for hart in &mut self.harts {
            hart.reset_pc = self.image.entry;
            hart.pc = self.image.entry;
        }
        Ok(())
    }

    /// Seed a hart's stack pointer (x2).
    pub fn set_sp(&mut self, h: usize, sp: u64) {
        self.harts[h].set_x(2, sp);
    }

    fn select_next_hart(&mut self) -> Option<usize> {
        let n = self.harts.len();
        for i in 0..n {
            let h = (self.last_hart + 1 + i) % n;
            if self.harts[h].ready() {
                self.last_hart = h;
                return Some(h);
            }
        }
        None
    }

    /// One clock edge: at most one instruction on one ready hart.
    pub fn tick(&mut self, queue: &mut EventQueue, memory: &Memory) -> Result<(), SimError> {
        let Some(h) = self.select_next_hart() else {
            self.stats.stall(Stage::Other, 1);
            trace!("core {}: no harts ready", self.site);
            return Ok(());
        };
        self.stats.busy(Stage::Other, 1);
        let pc = self.harts[h].pc;
        let raw = self
            .image
            .read_u32(pc)
            .ok_or(SimError::IllegalInstruction { pc, raw: 0 })?;
        trace!("core {}: hart {h} pc={pc:#x} insn={raw:#010x}", self.site);
        self.instret[h] += 1;
        self.exec(h, raw, queue, memory)
    }

    pub(crate) fn cycle(&self, queue: &EventQueue) -> u64 {
        queue.now() / self.period
    }

    fn issue_token(&mut self) -> u32 {
        let t = self.next_token;
        self.next_token = self.next_token.wrapping_add(1);
        t
    }

    /// Stall `h` behind a plain store completion (control-window traffic).
    pub(crate) fn stall_for_ctrl(&mut self, h: usize) -> u32 {
        let token = self.issue_token();
        let hart = &mut self.harts[h];
        hart.stalled = true;
        hart.pending = Some(Pending::Store);
        hart.token = token;
        token
    }

    pub(crate) fn record_access(&mut self, h: usize, access: Access, paddr: PAddr) {
        let Some(dest) = classify(paddr, self.site.pxn) else { return };
        self.stats.threads[h].record(Stage::Other, access, dest);
        if dest == Dest::RemotePxn && self.trace.covers(access) {
            debug!(
                target: "remote_pxn",
                "OP={}:SRC={}:SRC_THREAD={h}:DST_PXN={}:ADDR={paddr}",
                access.name(),
                self.site,
                paddr.pxn(),
            );
        }
    }

    /// Issue one data-memory request on behalf of hart `h`, stalling it
    /// behind `pending`. Synchronous back-ends complete inline.
    pub(crate) fn issue(
        &mut self,
        h: usize,
        paddr: PAddr,
        op: MemOp,
        pending: Pending,
        queue: &mut EventQueue,
        memory: &Memory,
    ) -> Result<(), SimError> {
        let token = self.issue_token();
        {
            let hart = &mut self.harts[h];
            hart.stalled = true;
            hart.token = token;
            hart.pending = Some(pending);
        }
        let req = MemRequest { core: self.index, tid: h, token, paddr, op };
        if let Some(resp) = memory.submit(queue, self.site.pxn, req)? {
            self.complete_mem(h, token, resp)?;
        }
        Ok(())
    }

    /// A memory response arrived for hart `h`: finish the stalled
    /// instruction or account the syscall buffer chunk.
    ///
    /// Responses can outlive their request: a core reset throws away the
    /// hart's pending operation without retiring the tokens still in
    /// flight, and the hart may already be stalled on a fresh request by
    /// the time the old response lands. Anything that does not match an
    /// outstanding token is traffic the hart stopped caring about and is
    /// dropped, never an error.
    pub fn complete_mem(
        &mut self,
        h: usize,
        token: u32,
        resp: MemResponse,
    ) -> Result<(), SimError> {
        let site = self.site;
        let unexpected = || SimError::UnknownThreadState {
            site,
            tid: h,
            state: "riscv response without a matching pending operation",
        };
        let stale = match self.harts[h].pending.as_ref() {
            None => true,
            Some(Pending::BufRead { parts, .. }) => !parts.contains_key(&token),
            Some(Pending::BufWrite { parts }) => !parts.contains(&token),
            Some(_) => self.harts[h].token != token,
        };
        if stale {
            trace!("core {}: hart {h} dropping stale response (token {token})", self.site);
            return Ok(());
        }
        let Some(pending) = self.harts[h].pending.take() else { return Ok(()) };
        match (pending, resp) {
            (Pending::Load { rd, width, signed, float }, MemResponse::Data(data)) => {
                let v = extend(&data, width, signed);
                let hart = &mut self.harts[h];
                if float {
                    hart.set_f_bits(rd, v as u32);
                } else {
                    hart.set_x(rd, v);
                }
                hart.pc += 4;
                hart.stalled = false;
            }
            (Pending::Store, MemResponse::WriteDone) => {
                let hart = &mut self.harts[h];
                hart.pc += 4;
                hart.stalled = false;
            }
            (Pending::Amo { rd, width }, MemResponse::AtomicData(data)) => {
                // AMO*.W sign-extends the read-out into rd
                let v = extend(&data, width, true);
                let hart = &mut self.harts[h];
                hart.set_x(rd, v);
                hart.pc += 4;
                hart.stalled = false;
            }
            (Pending::BufRead { mut buf, mut parts, cont }, MemResponse::Data(data)) => {
                let pos = parts.remove(&token).ok_or_else(unexpected)?;
                buf[pos..pos + data.len()].copy_from_slice(&data);
                if parts.is_empty() {
                    self.finish_buf_read(h, buf, cont);
                } else {
                    self.harts[h].pending = Some(Pending::BufRead { buf, parts, cont });
                }
            }
            (Pending::BufWrite { mut parts }, MemResponse::WriteDone) => {
                parts.remove(&token);
                if parts.is_empty() {
                    self.harts[h].stalled = false;
                } else {
                    self.harts[h].pending = Some(Pending::BufWrite { parts });
                }
            }
            _ => return Err(unexpected()),
        }
        Ok(())
    }

    /// A write landed in this core's control-register window. Offset 0 is
    /// CTRL_CORE_RESET: nonzero asserts reset on every hart, zero releases
    /// them. Unknown offsets are logged and ignored.
    pub fn ctrl_write(&mut self, offset: u32, value: u64) {
        if offset == PAddr::CTRL_CORE_RESET {
            debug!(
                "core {}: {} reset (value {value:#x})",
                self.site,
                if value != 0 { "asserting" } else { "releasing" }
            );
            for hart in &mut self.harts {
                hart.set_reset(value != 0);
            }
        } else {
            warn!("core {}: unhandled control write at offset {offset:#x}", self.site);
        }
    }
}

/// Zero- or sign-extend the first `width` bytes of a little-endian payload.
fn extend(data: &[u8], width: u8, signed: bool) -> u64 {
    let mut buf = [0u8; 8];
    let n = (width as usize).min(data.len());
    buf[..n].copy_from_slice(&data[..n]);
    let v = u64::from_le_bytes(buf);
    if !signed {
        return v;
    }
    let bits = n as u32 * 8;
    if bits >= 64 {
        v
    } else {
        (((v << (64 - bits)) as i64) >> (64 - bits)) as u64
    }
}

/// Deliver a deassert-reset to every core at `release` time; the fabric's
/// reset controller in miniature.
pub fn schedule_reset_release(queue: &mut EventQueue, sites: &[Site], release: Time) {
    for &site in sites {
        queue.push(release, Event::CtrlWrite { dst: site, offset: 0, value: 0, origin: None });
    }
}
