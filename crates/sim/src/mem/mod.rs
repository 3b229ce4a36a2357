//! The memory subsystem: controllers, routing and the request protocol.
//!
//! Three interchangeable back-ends serve the same request interface, chosen
//! at configuration. `Simple` completes against the backing store within the
//! issuing tick; `SelfLink` performs the access when a self-directed event
//! fires after a fixed delay; `Hierarchy` charges a service latency per
//! destination kind plus a hop penalty for remote-PXN traffic. Translate-to-
//! native requests are metadata lookups and complete synchronously on every
//! back-end.

mod controller;
mod map;

pub use controller::{Controller, Interleave};
pub use map::{MemoryMap, MemoryMapBuilder};

use pando_api::{AtomicOp, MemKind, NativeRegion, PAddr};

use crate::event::{Event, EventQueue, PS_PER_NS, Time};
use crate::SimError;

#[derive(Debug)]
pub enum MemOp {
    Read { size: usize },
    Write { data: Vec<u8> },
    Atomic { op: AtomicOp, wdata: Vec<u8>, ext: Option<Vec<u8>> },
    ToNative,
}

/// One in-flight memory access. `(core, tid, token)` is echoed back on the
/// response so the issuer can match it to its outstanding state.
#[derive(Debug)]
pub struct MemRequest {
    pub core: usize,
    pub tid: usize,
    pub token: u32,
    pub paddr: PAddr,
    pub op: MemOp,
}

#[derive(Debug)]
pub enum MemResponse {
    Data(Vec<u8>),
    WriteDone,
    AtomicData(Vec<u8>),
    Native(NativeRegion),
}

/// Memory back-end selection. Closed set; backends are enumerated at
/// configuration time.
#[derive(Debug, Clone, Copy)]
pub enum Backend {
    Simple,
    SelfLink { latency: Time },
    Hierarchy { l1sp: Time, l2sp: Time, dram: Time, remote_pxn: Time },
}

impl Default for Backend {
    fn default() -> Self {
        Backend::Hierarchy {
            l1sp: PS_PER_NS,
            l2sp: 8 * PS_PER_NS,
            dram: 32 * PS_PER_NS,
            remote_pxn: 200 * PS_PER_NS,
        }
    }
}

pub struct Memory {
    map: MemoryMap,
    backend: Backend,
}

impl Memory {
    pub fn new(map: MemoryMap, backend: Backend) -> Self {
        Self { map, backend }
    }

    pub fn map(&self) -> &MemoryMap {
        &self.map
    }

    /// Submit a request. Returns the response right away when the back-end
    /// completes synchronously; otherwise the access is enqueued and the
    /// response will surface as a [`Event::MemResponse`] later.
    pub fn submit(
        &self,
        queue: &mut EventQueue,
        origin_pxn: u16,
        req: MemRequest,
    ) -> Result<Option<MemResponse>, SimError> {
        if matches!(req.op, MemOp::ToNative) {
            return self.perform(&req).map(Some);
        }
        match self.backend {
            Backend::Simple => self.perform(&req).map(Some),
            Backend::SelfLink { latency } => {
                queue.push(queue.now() + latency, Event::MemAccess(req));
                Ok(None)
            }
            Backend::Hierarchy { l1sp, l2sp, dram, remote_pxn } => {
                let mut delay = match req.paddr.memory_type() {
                    Some(MemKind::L1sp) => l1sp,
                    Some(MemKind::L2sp) => l2sp,
                    Some(MemKind::Dram) => dram,
                    None => return Err(SimError::InvalidAddress { paddr: req.paddr }),
                };
                if req.paddr.pxn() != origin_pxn {
                    delay += remote_pxn;
                }
                queue.push(queue.now() + delay, Event::MemAccess(req));
                Ok(None)
            }
        }
    }

    /// Largest access starting at `paddr` that stays within one interleave
    /// stripe (unbounded for unstriped memories).
    pub fn stripe_room(&self, paddr: PAddr) -> u64 {
        match (paddr.memory_type(), paddr.offset()) {
            (Some(MemKind::L2sp), off) => {
                let il = self.map.l2_interleave();
                il.stripe() - il.stripe_offset(off)
            }
            (Some(MemKind::Dram), off) => {
                let il = self.map.dram_interleave();
                il.stripe() - il.stripe_offset(off)
            }
            _ => u64::MAX,
        }
    }

    /// Split `[paddr, paddr+len)` into pieces of at most `max` bytes that
    /// never straddle an interleave stripe. Yields (piece, offset-in-buffer,
    /// piece-length).
    pub fn stripe_chunks(
        &self,
        paddr: PAddr,
        len: usize,
        max: usize,
    ) -> Vec<(PAddr, usize, usize)> {
        let mut out = Vec::new();
        let mut at = 0usize;
        while at < len {
            let piece = paddr.add_offset(at as u64);
            let room = self.stripe_room(piece).min(max as u64) as usize;
            let n = room.min(len - at);
            out.push((piece, at, n));
            at += n;
        }
        out
    }

    /// Untimed bulk write, used for program loading and test setup.
    pub fn write_blob(&self, paddr: PAddr, bytes: &[u8]) -> Result<(), SimError> {
        for (piece, at, n) in self.stripe_chunks(paddr, bytes.len(), usize::MAX) {
            let (ctrl, local) = self.map.route(piece)?;
            ctrl.write(local, &bytes[at..at + n], piece)?;
        }
        Ok(())
    }

    /// Untimed bulk read.
    pub fn read_blob(&self, paddr: PAddr, len: usize) -> Result<Vec<u8>, SimError> {
        let mut out = vec![0u8; len];
        for (piece, at, n) in self.stripe_chunks(paddr, len, usize::MAX) {
            let (ctrl, local) = self.map.route(piece)?;
            out[at..at + n].copy_from_slice(&ctrl.read(local, n, piece)?);
        }
        Ok(out)
    }

    /// Execute a request against its owning controller.
    pub fn perform(&self, req: &MemRequest) -> Result<MemResponse, SimError> {
        let (ctrl, local) = self.map.route(req.paddr)?;
        let access_len = match &req.op {
            MemOp::Read { size } => *size as u64,
            MemOp::Write { data } => data.len() as u64,
            MemOp::Atomic { wdata, .. } => wdata.len() as u64,
            MemOp::ToNative => 0,
        };
        // accesses must not straddle a stripe; the bytes past the edge
        // belong to another controller
        if access_len > self.stripe_room(req.paddr) {
            return Err(SimError::InvalidAddress { paddr: req.paddr });
        }
        match &req.op {
            MemOp::Read { size } => ctrl.read(local, *size, req.paddr).map(MemResponse::Data),
            MemOp::Write { data } => {
                ctrl.write(local, data, req.paddr)?;
                Ok(MemResponse::WriteDone)
            }
            MemOp::Atomic { op, wdata, ext } => ctrl
                .atomic(local, *op, wdata, ext.as_deref(), req.paddr)
                .map(MemResponse::AtomicData),
            MemOp::ToNative => {
                let region = ctrl.native_region(local);
                Ok(MemResponse::Native(region))
            }
        }
    }
}
