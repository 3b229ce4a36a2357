//! Virtual and physical address encodings.
//!
//! A virtual address is what a workload holds: a 64-bit word encoding the
//! memory kind (L1SP / L2SP / DRAM / control register), where that memory
//! lives, and an offset. Scratchpad addresses come in a *local* form that is
//! resolved against the executing core's site and a *global* form that names
//! its home explicitly. A physical address is what the memory subsystem
//! routes on; its encoding is entirely distinct from the virtual one.
//!
//! Both words are kept bit-compatible with workloads compiled against the
//! original layout, so the field positions here are load-bearing. The DRAM
//! virtual offset is split across two ranges (bits [57:48] and [32:0]); the
//! skipped [47:33] range carries the PXN and must never be repurposed.

use bitfield_struct::bitfield;
use core::fmt;
use thiserror::Error;

use crate::locality::Site;

/// Errors produced while decoding an address word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AddrError {
    #[error("physical address {raw:#018x} has unknown type bits {ty:#08b}")]
    UnknownType { raw: u64, ty: u8 },
}

/// The kinds of memory a data address can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemKind {
    L1sp,
    L2sp,
    Dram,
}

impl fmt::Display for MemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemKind::L1sp => write!(f, "L1SP"),
            MemKind::L2sp => write!(f, "L2SP"),
            MemKind::Dram => write!(f, "DRAM"),
        }
    }
}

// Raw views of the virtual address word, one per kind. The fields overlap
// between kinds, which is why these are separate structs over the same word;
// only the decoded `VAddr` is public.

#[bitfield(u64)]
struct RawVL1 {
    #[bits(17)]
    offset: u32,
    #[bits(3)]
    core_x: u8,
    #[bits(3)]
    core_y: u8,
    #[bits(2)]
    _p1: u8,
    l2_not_l1: bool,
    #[bits(6)]
    pod: u8,
    global: bool,
    #[bits(14)]
    pxn: u16,
    not_scratchpad: bool,
    #[bits(15)]
    _p2: u16,
    ctrl: bool,
}

#[bitfield(u64)]
struct RawVL2 {
    #[bits(25)]
    offset: u32,
    l2_not_l1: bool,
    #[bits(6)]
    pod: u8,
    global: bool,
    #[bits(14)]
    pxn: u16,
    not_scratchpad: bool,
    #[bits(15)]
    _p3: u16,
    ctrl: bool,
}

#[bitfield(u64)]
struct RawVDram {
    #[bits(33)]
    offset_lo: u64,
    #[bits(14)]
    pxn: u16,
    not_scratchpad: bool,
    #[bits(10)]
    offset_hi: u64,
    #[bits(5)]
    _p4: u8,
    ctrl: bool,
}

// Raw views of the physical address word.

#[bitfield(u64)]
struct RawPL1 {
    #[bits(17)]
    offset: u32,
    #[bits(5)]
    _p5: u8,
    #[bits(3)]
    core_x: u8,
    #[bits(3)]
    _p6: u8,
    #[bits(3)]
    core_y: u8,
    #[bits(3)]
    _p7: u8,
    #[bits(6)]
    pod: u8,
    #[bits(4)]
    _p8: u8,
    #[bits(14)]
    pxn: u16,
    #[bits(6)]
    ty: u8,
}

#[bitfield(u64)]
struct RawPL2 {
    #[bits(25)]
    offset: u32,
    #[bits(9)]
    _p9: u16,
    #[bits(6)]
    pod: u8,
    #[bits(4)]
    _p10: u8,
    #[bits(14)]
    pxn: u16,
    #[bits(6)]
    ty: u8,
}

#[bitfield(u64)]
struct RawPDram {
    #[bits(44)]
    offset: u64,
    #[bits(14)]
    pxn: u16,
    #[bits(6)]
    ty: u8,
}

#[bitfield(u64)]
struct RawPCtrl {
    #[bits(18)]
    offset: u32,
    ctrl_is_core: bool,
    #[bits(3)]
    _p11: u8,
    #[bits(3)]
    core_x: u8,
    #[bits(3)]
    _p12: u8,
    #[bits(3)]
    core_y: u8,
    #[bits(3)]
    _p13: u8,
    #[bits(6)]
    pod: u8,
    #[bits(4)]
    _p14: u8,
    #[bits(14)]
    pxn: u16,
    #[bits(6)]
    ty: u8,
}

/// Home of a global L2SP address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PodHome {
    pub pxn: u16,
    pub pod: u8,
}

/// Home of a global L1SP address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreHome {
    pub pxn: u16,
    pub pod: u8,
    pub core_y: u8,
    pub core_x: u8,
}

/// A decoded virtual address.
///
/// `home: None` on the scratchpad kinds means the address is local and must
/// be interpreted relative to the executing core's site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VAddr {
    L1sp { home: Option<CoreHome>, offset: u32 },
    L2sp { home: Option<PodHome>, offset: u32 },
    Dram { pxn: u16, offset: u64 },
    Ctrl { pxn: u16, pod: u8, core_y: u8, core_x: u8, offset: u32 },
}

impl VAddr {
    /// Base of the executing core's own L1 scratchpad.
    pub const fn my_l1_base() -> Self {
        VAddr::L1sp { home: None, offset: 0 }
    }

    /// Base of the executing pod's L2 scratchpad.
    pub const fn my_l2_base() -> Self {
        VAddr::L2sp { home: None, offset: 0 }
    }

    /// Base of a PXN's main memory.
    pub const fn main_mem_base(pxn: u16) -> Self {
        VAddr::Dram { pxn, offset: 0 }
    }

    /// Base of a core's control-register window.
    pub const fn core_ctrl_base(pxn: u16, pod: u8, core_y: u8, core_x: u8) -> Self {
        VAddr::Ctrl { pxn, pod, core_y, core_x, offset: 0 }
    }

    pub fn decode(raw: u64) -> Self {
        let common = RawVL1::from_bits(raw);
        if common.ctrl() {
            let v = RawVL1::from_bits(raw);
            VAddr::Ctrl {
                pxn: v.pxn(),
                pod: v.pod(),
                core_y: v.core_y(),
                core_x: v.core_x(),
                offset: v.offset(),
            }
        } else if common.not_scratchpad() {
            let v = RawVDram::from_bits(raw);
            VAddr::Dram { pxn: v.pxn(), offset: (v.offset_hi() << 33) | v.offset_lo() }
        } else if common.l2_not_l1() {
            let v = RawVL2::from_bits(raw);
            let home = v.global().then(|| PodHome { pxn: v.pxn(), pod: v.pod() });
            VAddr::L2sp { home, offset: v.offset() }
        } else {
            let v = RawVL1::from_bits(raw);
            let home = v.global().then(|| CoreHome {
                pxn: v.pxn(),
                pod: v.pod(),
                core_y: v.core_y(),
                core_x: v.core_x(),
            });
            VAddr::L1sp { home, offset: v.offset() }
        }
    }

    pub fn encode(self) -> u64 {
        match self {
            VAddr::L1sp { home, offset } => {
                let mut v = RawVL1::new().with_offset(offset);
                if let Some(h) = home {
                    v = v
                        .with_global(true)
                        .with_pxn(h.pxn)
                        .with_pod(h.pod)
                        .with_core_y(h.core_y)
                        .with_core_x(h.core_x);
                }
                v.into_bits()
            }
            VAddr::L2sp { home, offset } => {
                let mut v = RawVL2::new().with_l2_not_l1(true).with_offset(offset);
                if let Some(h) = home {
                    v = v.with_global(true).with_pxn(h.pxn).with_pod(h.pod);
                }
                v.into_bits()
            }
            VAddr::Dram { pxn, offset } => RawVDram::new()
                .with_not_scratchpad(true)
                .with_pxn(pxn)
                .with_offset_lo(offset & 0x1_FFFF_FFFF)
                .with_offset_hi((offset >> 33) & 0x3FF)
                .into_bits(),
            VAddr::Ctrl { pxn, pod, core_y, core_x, offset } => RawVL1::new()
                .with_ctrl(true)
                .with_not_scratchpad(true)
                .with_pxn(pxn)
                .with_pod(pod)
                .with_core_y(core_y)
                .with_core_x(core_x)
                .with_offset(offset)
                .into_bits(),
        }
    }

    /// The kind of memory this address names, `None` for control registers.
    pub fn memory_type(self) -> Option<MemKind> {
        match self {
            VAddr::L1sp { .. } => Some(MemKind::L1sp),
            VAddr::L2sp { .. } => Some(MemKind::L2sp),
            VAddr::Dram { .. } => Some(MemKind::Dram),
            VAddr::Ctrl { .. } => None,
        }
    }

    /// The (pxn, pod, core) triple this address resolves to when used at
    /// `site`. Pod and core components are those of the site where the
    /// address does not constrain them (DRAM is PXN-wide, L2SP pod-wide).
    pub fn locality(self, site: Site) -> Site {
        match self {
            VAddr::L1sp { home: None, .. } => site,
            VAddr::L1sp { home: Some(h), .. } => Site {
                pxn: h.pxn,
                pod: h.pod,
                core_y: h.core_y,
                core_x: h.core_x,
            },
            VAddr::L2sp { home: None, .. } => site,
            VAddr::L2sp { home: Some(h), .. } => Site { pxn: h.pxn, pod: h.pod, ..site },
            VAddr::Dram { pxn, .. } => Site { pxn, ..site },
            VAddr::Ctrl { pxn, pod, core_y, core_x, .. } => {
                Site { pxn, pod, core_y, core_x }
            }
        }
    }

    /// Translate against the executing site.
    pub fn to_physical(self, site: Site) -> PAddr {
        match self {
            VAddr::Ctrl { pxn, pod, core_y, core_x, offset } => {
                PAddr::Ctrl { pxn, pod, core_y, core_x, offset }
            }
            VAddr::Dram { pxn, offset } => PAddr::Dram { pxn, offset },
            VAddr::L2sp { home, offset } => {
                let (pxn, pod) = match home {
                    Some(h) => (h.pxn, h.pod),
                    None => (site.pxn, site.pod),
                };
                PAddr::L2sp { pxn, pod, offset }
            }
            VAddr::L1sp { home, offset } => {
                let h = home.unwrap_or(CoreHome {
                    pxn: site.pxn,
                    pod: site.pod,
                    core_y: site.core_y,
                    core_x: site.core_x,
                });
                PAddr::L1sp {
                    pxn: h.pxn,
                    pod: h.pod,
                    core_y: h.core_y,
                    core_x: h.core_x,
                    offset,
                }
            }
        }
    }

    /// Make a local scratchpad address global by imprinting `site` as its
    /// home. DRAM, control and already-global addresses are returned
    /// unchanged, so globalization is idempotent.
    pub fn to_global(self, site: Site) -> Self {
        match self {
            VAddr::L1sp { home: None, offset } => VAddr::L1sp {
                home: Some(CoreHome {
                    pxn: site.pxn,
                    pod: site.pod,
                    core_y: site.core_y,
                    core_x: site.core_x,
                }),
                offset,
            },
            VAddr::L2sp { home: None, offset } => VAddr::L2sp {
                home: Some(PodHome { pxn: site.pxn, pod: site.pod }),
                offset,
            },
            other => other,
        }
    }
}

impl fmt::Display for VAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            VAddr::L1sp { home: None, offset } => {
                write!(f, "VADDR{{L1SP LOCAL {offset:#011x}}}")
            }
            VAddr::L1sp { home: Some(h), offset } => write!(
                f,
                "VADDR{{L1SP PXN={} POD={} CORE_Y={} CORE_X={} {offset:#011x}}}",
                h.pxn, h.pod, h.core_y, h.core_x
            ),
            VAddr::L2sp { home: None, offset } => {
                write!(f, "VADDR{{L2SP LOCAL {offset:#011x}}}")
            }
            VAddr::L2sp { home: Some(h), offset } => {
                write!(f, "VADDR{{L2SP PXN={} POD={} {offset:#011x}}}", h.pxn, h.pod)
            }
            VAddr::Dram { pxn, offset } => write!(f, "VADDR{{DRAM PXN={pxn} {offset:#011x}}}"),
            VAddr::Ctrl { pxn, pod, core_y, core_x, offset } => write!(
                f,
                "VADDR{{CTRL PXN={pxn} POD={pod} CORE_Y={core_y} CORE_X={core_x} {offset:#011x}}}"
            ),
        }
    }
}

/// A decoded physical address.
///
/// The encoded form carries the kind in the six type bits [63:58]; only the
/// four tags below are legal there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PAddr {
    L1sp { pxn: u16, pod: u8, core_y: u8, core_x: u8, offset: u32 },
    L2sp { pxn: u16, pod: u8, offset: u32 },
    Dram { pxn: u16, offset: u64 },
    Ctrl { pxn: u16, pod: u8, core_y: u8, core_x: u8, offset: u32 },
}

impl PAddr {
    pub const TYPE_L1SP: u8 = 0b000000;
    pub const TYPE_L2SP: u8 = 0b000001;
    pub const TYPE_DRAM: u8 = 0b000100;
    pub const TYPE_CTRL: u8 = 0b001000;

    /// Control-register offset of the core reset register.
    pub const CTRL_CORE_RESET: u32 = 0x000;

    pub fn decode(raw: u64) -> Result<Self, AddrError> {
        let ty = RawPDram::from_bits(raw).ty();
        match ty {
            Self::TYPE_L1SP => {
                let p = RawPL1::from_bits(raw);
                Ok(PAddr::L1sp {
                    pxn: p.pxn(),
                    pod: p.pod(),
                    core_y: p.core_y(),
                    core_x: p.core_x(),
                    offset: p.offset(),
                })
            }
            Self::TYPE_L2SP => {
                let p = RawPL2::from_bits(raw);
                Ok(PAddr::L2sp { pxn: p.pxn(), pod: p.pod(), offset: p.offset() })
            }
            Self::TYPE_DRAM => {
                let p = RawPDram::from_bits(raw);
                Ok(PAddr::Dram { pxn: p.pxn(), offset: p.offset() })
            }
            Self::TYPE_CTRL => {
                let p = RawPCtrl::from_bits(raw);
                Ok(PAddr::Ctrl {
                    pxn: p.pxn(),
                    pod: p.pod(),
                    core_y: p.core_y(),
                    core_x: p.core_x(),
                    offset: p.offset(),
                })
            }
            _ => Err(AddrError::UnknownType { raw, ty }),
        }
    }

    pub fn encode(self) -> u64 {
        match self {
            PAddr::L1sp { pxn, pod, core_y, core_x, offset } => RawPL1::new()
                .with_ty(Self::TYPE_L1SP)
                .with_pxn(pxn)
                .with_pod(pod)
                .with_core_y(core_y)
                .with_core_x(core_x)
                .with_offset(offset)
                .into_bits(),
            PAddr::L2sp { pxn, pod, offset } => RawPL2::new()
                .with_ty(Self::TYPE_L2SP)
                .with_pxn(pxn)
                .with_pod(pod)
                .with_offset(offset)
                .into_bits(),
            PAddr::Dram { pxn, offset } => RawPDram::new()
                .with_ty(Self::TYPE_DRAM)
                .with_pxn(pxn)
                .with_offset(offset)
                .into_bits(),
            PAddr::Ctrl { pxn, pod, core_y, core_x, offset } => RawPCtrl::new()
                .with_ty(Self::TYPE_CTRL)
                .with_pxn(pxn)
                .with_pod(pod)
                .with_core_y(core_y)
                .with_core_x(core_x)
                .with_offset(offset)
                .into_bits(),
        }
    }

    pub fn pxn(self) -> u16 {
        match self {
            PAddr::L1sp { pxn, .. }
            | PAddr::L2sp { pxn, .. }
            | PAddr::Dram { pxn, .. }
            | PAddr::Ctrl { pxn, .. } => pxn,
        }
    }

    pub fn memory_type(self) -> Option<MemKind> {
        match self {
            PAddr::L1sp { .. } => Some(MemKind::L1sp),
            PAddr::L2sp { .. } => Some(MemKind::L2sp),
            PAddr::Dram { .. } => Some(MemKind::Dram),
            PAddr::Ctrl { .. } => None,
        }
    }

    /// The same location `delta` bytes further into the owning memory's
    /// offset space. Pointer arithmetic for buffer traffic; the locality
    /// fields are untouched.
    pub fn add_offset(self, delta: u64) -> Self {
        match self {
            PAddr::L1sp { pxn, pod, core_y, core_x, offset } => {
                PAddr::L1sp { pxn, pod, core_y, core_x, offset: offset + delta as u32 }
            }
            PAddr::L2sp { pxn, pod, offset } => {
                PAddr::L2sp { pxn, pod, offset: offset + delta as u32 }
            }
            PAddr::Dram { pxn, offset } => PAddr::Dram { pxn, offset: offset + delta },
            PAddr::Ctrl { pxn, pod, core_y, core_x, offset } => {
                PAddr::Ctrl { pxn, pod, core_y, core_x, offset: offset + delta as u32 }
            }
        }
    }

    /// Byte offset within the owning memory's offset space.
    pub fn offset(self) -> u64 {
        match self {
            PAddr::L1sp { offset, .. }
            | PAddr::L2sp { offset, .. }
            | PAddr::Ctrl { offset, .. } => offset as u64,
            PAddr::Dram { offset, .. } => offset,
        }
    }
}

impl fmt::Display for PAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            PAddr::L1sp { pxn, pod, core_y, core_x, offset } => write!(
                f,
                "PADDR{{L1SP PXN={pxn} POD={pod} CORE_Y={core_y} CORE_X={core_x} {offset:#011x}}}"
            ),
            PAddr::L2sp { pxn, pod, offset } => {
                write!(f, "PADDR{{L2SP PXN={pxn} POD={pod} {offset:#011x}}}")
            }
            PAddr::Dram { pxn, offset } => write!(f, "PADDR{{DRAM PXN={pxn} {offset:#011x}}}"),
            PAddr::Ctrl { pxn, pod, core_y, core_x, offset } => write!(
                f,
                "PADDR{{CTRL PXN={pxn} POD={pod} CORE_Y={core_y} CORE_X={core_x} {offset:#011x}}}"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SITE: Site = Site { pxn: 3, pod: 2, core_y: 1, core_x: 4 };

    #[test]
    fn vaddr_roundtrip() {
        let cases = [
            VAddr::L1sp { home: None, offset: 0x100 },
            VAddr::L1sp {
                home: Some(CoreHome { pxn: 9, pod: 5, core_y: 7, core_x: 2 }),
                offset: 0x1FFFF,
            },
            VAddr::L2sp { home: None, offset: 0x1FF_FFFF },
            VAddr::L2sp { home: Some(PodHome { pxn: 1, pod: 63 }), offset: 0x40 },
            VAddr::Dram { pxn: 0x3FFF, offset: 0x7FF_FFFF_FFFF },
            VAddr::Ctrl { pxn: 2, pod: 1, core_y: 3, core_x: 6, offset: 0x8 },
        ];
        for v in cases {
            assert_eq!(VAddr::decode(v.encode()), v, "{v}");
        }
    }

    #[test]
    fn paddr_roundtrip() {
        let cases = [
            PAddr::L1sp { pxn: 3, pod: 2, core_y: 1, core_x: 4, offset: 0x1FFFF },
            PAddr::L2sp { pxn: 1, pod: 0, offset: 0x1FF_FFFF },
            PAddr::Dram { pxn: 0x3FFF, offset: 0xFFF_FFFF_FFFF },
            PAddr::Ctrl { pxn: 0, pod: 0, core_y: 0, core_x: 0, offset: 0 },
        ];
        for p in cases {
            assert_eq!(PAddr::decode(p.encode()), Ok(p), "{p}");
        }
    }

    #[test]
    fn paddr_type_field_is_checked() {
        // type bits [63:58] = 0b000010 is not a legal tag
        let raw = 0b000010u64 << 58;
        assert_eq!(PAddr::decode(raw), Err(AddrError::UnknownType { raw, ty: 0b000010 }));
    }

    #[test]
    fn dram_offset_is_split_across_the_word() {
        // hi10 lands in bits [57:48], lo33 in [32:0]; [47:33] holds the pxn
        let v = VAddr::Dram { pxn: 0, offset: (1 << 33) | 5 };
        let raw = v.encode();
        assert_eq!(raw & (1 << 48), 1 << 48);
        assert_eq!(raw & 0x1_FFFF_FFFF, 5);
        assert_eq!(raw & (0x3FFF << 33), 0);
        assert_eq!(VAddr::decode(raw), v);
    }

    #[test]
    fn local_l1_resolves_to_site() {
        let v = VAddr::L1sp { home: None, offset: 0x100 };
        let p = v.to_physical(SITE);
        assert_eq!(
            p,
            PAddr::L1sp { pxn: 3, pod: 2, core_y: 1, core_x: 4, offset: 0x100 }
        );
    }

    #[test]
    fn global_l2_overrides_site() {
        let local = VAddr::L2sp { home: None, offset: 0x40 };
        assert_eq!(
            local.to_physical(SITE),
            PAddr::L2sp { pxn: 3, pod: 2, offset: 0x40 }
        );
        let global = VAddr::L2sp { home: Some(PodHome { pxn: 1, pod: 0 }), offset: 0x40 };
        assert_eq!(
            global.to_physical(SITE),
            PAddr::L2sp { pxn: 1, pod: 0, offset: 0x40 }
        );
    }

    #[test]
    fn globalization_is_idempotent_against_same_site() {
        let cases = [
            VAddr::L1sp { home: None, offset: 0x80 },
            VAddr::L2sp { home: None, offset: 0x2000 },
            VAddr::Dram { pxn: 7, offset: 0x1234 },
            VAddr::L2sp { home: Some(PodHome { pxn: 1, pod: 1 }), offset: 0 },
        ];
        for v in cases {
            let g = v.to_global(SITE);
            assert_eq!(g.to_global(SITE), g);
            assert_eq!(g.to_physical(SITE), v.to_physical(SITE));
        }
    }

    #[test]
    fn base_constructors_encode_canonically() {
        assert_eq!(VAddr::my_l1_base().encode(), 0);
        let l2 = VAddr::my_l2_base().encode();
        assert_eq!(l2, 1 << 25);
        let dram = VAddr::main_mem_base(2).encode();
        assert_eq!(dram, (1 << 47) | (2 << 33));
        let ctrl = VAddr::core_ctrl_base(0, 0, 0, 0).encode();
        assert_eq!(ctrl, (1 << 63) | (1 << 47));
    }
}
