//! The atomic read-modify-write algebra.
//!
//! Memory controllers execute these operations against their backing store
//! under the controller lock. `modify` is the pure kernel: given the write
//! operand, the value read from memory and (for CAS) the expected value, it
//! answers what to write back and what to return to the issuer.

use int_enum::IntEnum;

/// Operation carried by an atomic memory request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntEnum)]
#[repr(u8)]
pub enum AtomicOp {
    Cas = 0,
    Swap = 1,
    Add = 2,
    Or = 3,
}

impl AtomicOp {
    /// CAS carries the expected value as an extended operand.
    pub const fn has_ext(self) -> bool {
        matches!(self, AtomicOp::Cas)
    }
}

impl core::fmt::Display for AtomicOp {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            AtomicOp::Cas => "CAS",
            AtomicOp::Swap => "SWAP",
            AtomicOp::Add => "ADD",
            AtomicOp::Or => "OR",
        };
        f.write_str(name)
    }
}

/// Legal widths of an atomic access, in bytes.
pub const fn width_ok(size: usize) -> bool {
    matches!(size, 1 | 2 | 4 | 8)
}

const fn width_mask(size: usize) -> u64 {
    if size >= 8 { u64::MAX } else { (1u64 << (size * 8)) - 1 }
}

/// Compute `(write_back, returned)` for an RMW of `size` bytes.
///
/// `w` and `r` are the operand and the memory value zero-extended into 64
/// bits; ADD wraps at the access width. For CAS, `ext` is the expected
/// value: on mismatch the memory value is written back unchanged.
pub fn modify(op: AtomicOp, size: usize, w: u64, r: u64, ext: Option<u64>) -> (u64, u64) {
    debug_assert!(width_ok(size));
    let mask = width_mask(size);
    match op {
        AtomicOp::Swap => (w & mask, r),
        AtomicOp::Add => (w.wrapping_add(r) & mask, r),
        AtomicOp::Or => ((w | r) & mask, r),
        AtomicOp::Cas => {
            // ext is validated against the opcode before submission
            if r == ext.unwrap_or(0) { (w & mask, r) } else { (r, r) }
        }
    }
}
