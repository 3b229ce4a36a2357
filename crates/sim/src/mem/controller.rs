//! Memory controllers and the interleave arithmetic.
//!
//! A controller owns one contiguous backing buffer: one per core for L1SP,
//! one per bank for a pod's L2SP, one per port for a PXN's DRAM. Striped
//! memories spread their offset space across banks in `stripe`-byte runs;
//! the controller collapses the global offset back into its local buffer.
//!
//! The backing store sits behind a lock and the atomic read-modify-write
//! holds that lock from the read through the write-back. That is what makes
//! RMWs linearizable against every other access to the same controller.

use pando_api::{AtomicOp, MemKind, NativeRegion, PAddr, Site, rmw};
use spin::Mutex;

use crate::SimError;

/// Bank-striping descriptor. Stripe size and bank count are powers of two;
/// that is validated when the configuration is frozen.
#[derive(Debug, Clone, Copy)]
pub struct Interleave {
    stripe: u64,
    bank_shift: u32,
    bank_mask: u64,
    segment_shift: u32,
    offset_mask: u64,
}

impl Interleave {
    pub fn new(stripe: u64, banks: u64) -> Self {
        debug_assert!(stripe.is_power_of_two() && banks.is_power_of_two());
        let bank_shift = stripe.trailing_zeros();
        Self {
            stripe,
            bank_shift,
            bank_mask: banks - 1,
            segment_shift: bank_shift + banks.trailing_zeros(),
            offset_mask: stripe - 1,
        }
    }

    pub fn stripe(&self) -> u64 {
        self.stripe
    }

    /// Which bank a global offset lands in.
    pub fn bank_of(&self, offset: u64) -> u64 {
        (offset >> self.bank_shift) & self.bank_mask
    }

    /// Position within the stripe.
    pub fn stripe_offset(&self, offset: u64) -> u64 {
        offset & self.offset_mask
    }

    /// Collapse a global interleaved offset into the owning bank's local
    /// contiguous offset.
    pub fn to_local(&self, offset: u64) -> u64 {
        (offset >> self.segment_shift) * self.stripe + (offset & self.offset_mask)
    }
}

#[derive(Debug)]
pub struct Controller {
    kind: MemKind,
    pxn: u16,
    pod: u8,
    /// Core id for L1SP, bank index for L2SP, port index for DRAM.
    bank: u32,
    /// Encoded physical address of the first byte this controller owns.
    /// Tables are sorted on it.
    start: u64,
    size: u64,
    interleave: Option<Interleave>,
    data: Mutex<Box<[u8]>>,
}

fn zeroed(size: u64) -> Mutex<Box<[u8]>> {
    Mutex::new(vec![0u8; size as usize].into_boxed_slice())
}

impl Controller {
    /// A core's private L1 scratchpad bank. Registers itself with `builder`.
    pub fn l1sp(builder: &mut super::MemoryMapBuilder, site: Site, size: u64) {
        let start = PAddr::L1sp {
            pxn: site.pxn,
            pod: site.pod,
            core_y: site.core_y,
            core_x: site.core_x,
            offset: 0,
        }
        .encode();
        builder.register(Controller {
            kind: MemKind::L1sp,
            pxn: site.pxn,
            pod: site.pod,
            bank: site.core_id(),
            start,
            size,
            interleave: None,
            data: zeroed(size),
        });
    }

    /// One bank of a pod's L2 scratchpad.
    pub fn l2sp_bank(
        builder: &mut super::MemoryMapBuilder,
        pxn: u16,
        pod: u8,
        bank: u32,
        ileave: Interleave,
        bank_size: u64,
    ) {
        let start =
            PAddr::L2sp { pxn, pod, offset: (bank as u64 * ileave.stripe()) as u32 }.encode();
        builder.register(Controller {
            kind: MemKind::L2sp,
            pxn,
            pod,
            bank,
            start,
            size: bank_size,
            interleave: Some(ileave),
            data: zeroed(bank_size),
        });
    }

    /// One port of a PXN's DRAM.
    pub fn dram_port(
        builder: &mut super::MemoryMapBuilder,
        pxn: u16,
        port: u32,
        ileave: Interleave,
        port_size: u64,
    ) {
        let start = PAddr::Dram { pxn, offset: port as u64 * ileave.stripe() }.encode();
        builder.register(Controller {
            kind: MemKind::Dram,
            pxn,
            pod: 0,
            bank: port,
            start,
            size: port_size,
            interleave: Some(ileave),
            data: zeroed(port_size),
        });
    }

    pub fn kind(&self) -> MemKind {
        self.kind
    }

    pub fn pxn(&self) -> u16 {
        self.pxn
    }

    pub fn pod(&self) -> u8 {
        self.pod
    }

    pub fn bank(&self) -> u32 {
        self.bank
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Does this controller serve `paddr`?
    pub fn owns(&self, paddr: PAddr) -> bool {
        let locale_match = match (self.kind, paddr) {
            (MemKind::L1sp, PAddr::L1sp { pxn, pod, core_y, core_x, .. }) => {
                pxn == self.pxn
                    && pod == self.pod
                    && pando_api::locality::core_id_from_xy(core_x, core_y) == self.bank
            }
            (MemKind::L2sp, PAddr::L2sp { pxn, pod, .. }) => pxn == self.pxn && pod == self.pod,
            (MemKind::Dram, PAddr::Dram { pxn, .. }) => pxn == self.pxn,
            _ => false,
        };
        if !locale_match {
            return false;
        }
        match self.interleave {
            None => paddr.offset() < self.size(),
            Some(il) => {
                il.bank_of(paddr.offset()) == self.bank as u64
                    && il.to_local(paddr.offset()) < self.size()
            }
        }
    }

    /// Map `paddr`'s offset into this controller's backing buffer.
    pub fn to_local(&self, paddr: PAddr) -> u64 {
        match self.interleave {
            None => paddr.offset(),
            Some(il) => il.to_local(paddr.offset()),
        }
    }

    fn check_range(&self, local: u64, len: usize, paddr: PAddr) -> Result<usize, SimError> {
        if local + len as u64 > self.size {
            return Err(SimError::InvalidAddress { paddr });
        }
        Ok(local as usize)
    }

    pub fn read(&self, local: u64, size: usize, paddr: PAddr) -> Result<Vec<u8>, SimError> {
        let at = self.check_range(local, size, paddr)?;
        let data = self.data.lock();
        Ok(data[at..at + size].to_vec())
    }

    pub fn write(&self, local: u64, bytes: &[u8], paddr: PAddr) -> Result<(), SimError> {
        let at = self.check_range(local, bytes.len(), paddr)?;
        let mut data = self.data.lock();
        data[at..at + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Read-modify-write under the controller lock; returns the read-out
    /// payload. Widths outside {1, 2, 4, 8} and a CAS missing its expected
    /// operand are fatal.
    pub fn atomic(
        &self,
        local: u64,
        op: AtomicOp,
        wdata: &[u8],
        ext: Option<&[u8]>,
        paddr: PAddr,
    ) -> Result<Vec<u8>, SimError> {
        let size = wdata.len();
        if !rmw::width_ok(size) {
            return Err(SimError::InvalidAtomic { what: format!("width {size}"), paddr });
        }
        if op.has_ext() && ext.is_none() {
            return Err(SimError::InvalidAtomic {
                what: format!("{op} without extended operand"),
                paddr,
            });
        }
        let at = self.check_range(local, size, paddr)?;

        // lock held across the full read-modify-write
        let mut data = self.data.lock();
        let r = le_load(&data[at..at + size]);
        let w = le_load(wdata);
        let e = ext.map(le_load);
        let (w_new, r_out) = rmw::modify(op, size, w, r, e);
        data[at..at + size].copy_from_slice(&w_new.to_le_bytes()[..size]);
        Ok(r_out.to_le_bytes()[..size].to_vec())
    }

    /// Host pointer covering `local` up to the end of the stripe (or of the
    /// backing store, for unstriped memories). The pointer stays valid for
    /// the controller's lifetime but aliases simulated memory; see
    /// [`NativeRegion`].
    pub fn native_region(&self, local: u64) -> NativeRegion {
        let mut data = self.data.lock();
        let len = match self.interleave {
            Some(il) => (il.stripe() - (local % il.stripe())) as usize,
            None => data.len() - local as usize,
        };
        // the box never reallocates, so the pointer outlives the guard
        let ptr = unsafe { data.as_mut_ptr().add(local as usize) };
        NativeRegion { ptr, len }
    }
}

fn le_load(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf[..bytes.len()].copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemoryMapBuilder;
    use pando_api::SysConfig;

    fn lone_l1sp() -> Controller {
        let cfg = SysConfig::default();
        let mut b = MemoryMapBuilder::new(&cfg);
        Controller::l1sp(&mut b, Site::new(0, 0, 0), 0x1000);
        b.take_controllers().pop().unwrap()
    }

    #[test]
    fn write_then_read_roundtrips() {
        let c = lone_l1sp();
        let paddr = PAddr::L1sp { pxn: 0, pod: 0, core_y: 0, core_x: 0, offset: 0x100 };
        c.write(0x100, &0xDEAD_BEEF_CAFE_BABEu64.to_le_bytes(), paddr).unwrap();
        let got = c.read(0x100, 8, paddr).unwrap();
        assert_eq!(got, 0xDEAD_BEEF_CAFE_BABEu64.to_le_bytes());
    }

    #[test]
    fn cas_matches_then_fails() {
        let c = lone_l1sp();
        let paddr = PAddr::L1sp { pxn: 0, pod: 0, core_y: 0, core_x: 0, offset: 0 };
        c.write(0, &7u64.to_le_bytes(), paddr).unwrap();

        let r = c
            .atomic(0, AtomicOp::Cas, &42u64.to_le_bytes(), Some(&7u64.to_le_bytes()), paddr)
            .unwrap();
        assert_eq!(le_load(&r), 7);
        assert_eq!(le_load(&c.read(0, 8, paddr).unwrap()), 42);

        let r = c
            .atomic(0, AtomicOp::Cas, &99u64.to_le_bytes(), Some(&7u64.to_le_bytes()), paddr)
            .unwrap();
        assert_eq!(le_load(&r), 42);
        assert_eq!(le_load(&c.read(0, 8, paddr).unwrap()), 42);
    }

    #[test]
    fn add_serializes_and_returns_every_intermediate() {
        let c = lone_l1sp();
        let paddr = PAddr::L1sp { pxn: 0, pod: 0, core_y: 0, core_x: 0, offset: 8 };
        let mut seen = Vec::new();
        for _ in 0..100 {
            let r = c.atomic(8, AtomicOp::Add, &1u64.to_le_bytes(), None, paddr).unwrap();
            seen.push(le_load(&r));
        }
        assert_eq!(seen, (0..100).collect::<Vec<u64>>());
        assert_eq!(le_load(&c.read(8, 8, paddr).unwrap()), 100);
    }

    #[test]
    fn bad_atomic_width_is_fatal() {
        let c = lone_l1sp();
        let paddr = PAddr::L1sp { pxn: 0, pod: 0, core_y: 0, core_x: 0, offset: 0 };
        let err = c.atomic(0, AtomicOp::Add, &[1, 2, 3], None, paddr).unwrap_err();
        assert!(matches!(err, SimError::InvalidAtomic { .. }));
    }

    #[test]
    fn interleave_bank_law() {
        // bank(a) = (a / stripe) mod banks
        let il = Interleave::new(64, 4);
        for a in (0u64..4096).step_by(8) {
            assert_eq!(il.bank_of(a), (a / 64) % 4);
            assert_eq!(il.stripe_offset(a), a % 64);
        }
        // consecutive stripes of one bank pack contiguously
        assert_eq!(il.to_local(0), 0);
        assert_eq!(il.to_local(63), 63);
        assert_eq!(il.to_local(256), 64); // second stripe of bank 0
        assert_eq!(il.to_local(64), 0); // first stripe of bank 1
    }

    #[test]
    fn native_region_stops_at_the_stripe_edge() {
        let cfg = SysConfig::default();
        let mut b = MemoryMapBuilder::new(&cfg);
        Controller::l2sp_bank(&mut b, 0, 0, 0, Interleave::new(64, 2), 0x1000);
        let c = b.take_controllers().pop().unwrap();
        let region = c.native_region(40);
        assert_eq!(region.len, 24);
    }
}
