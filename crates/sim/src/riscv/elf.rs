//! Minimal RV64 ELF executable loader.
//!
//! Parses just enough of the file to fetch instructions by virtual address
//! and to copy PT_LOAD segments into the simulated memory. Anything the
//! loader cannot make sense of is an [`ExecutableLoad`] error; there is no
//! partial-load mode.
//!
//! [`ExecutableLoad`]: crate::SimError::ExecutableLoad

use std::fs;
use std::path::{Path, PathBuf};

use crate::SimError;

const EI_CLASS_64: u8 = 2;
const EI_DATA_LE: u8 = 1;
const ET_EXEC: u16 = 2;
const EM_RISCV: u16 = 243;
const PT_LOAD: u32 = 1;

#[derive(Debug)]
pub struct Segment {
    /// Link-time virtual address (instruction fetch space).
    pub vaddr: u64,
    /// Load address; a fabric virtual address resolved by the loading core.
    pub paddr: u64,
    pub data: Vec<u8>,
    pub memsz: u64,
}

/// A loaded executable: the instruction-cache backing and the program
/// segments still to be placed into simulated memory.
#[derive(Debug)]
pub struct Image {
    pub path: PathBuf,
    pub entry: u64,
    segments: Vec<Segment>,
}

fn err(path: &Path, reason: impl Into<String>) -> SimError {
    SimError::ExecutableLoad { path: path.to_path_buf(), reason: reason.into() }
}

fn field<const N: usize>(bytes: &[u8], off: usize, path: &Path) -> Result<[u8; N], SimError> {
    bytes
        .get(off..off + N)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| err(path, format!("truncated at offset {off:#x}")))
}

fn u16_at(bytes: &[u8], off: usize, path: &Path) -> Result<u16, SimError> {
    Ok(u16::from_le_bytes(field(bytes, off, path)?))
}

fn u32_at(bytes: &[u8], off: usize, path: &Path) -> Result<u32, SimError> {
    Ok(u32::from_le_bytes(field(bytes, off, path)?))
}

fn u64_at(bytes: &[u8], off: usize, path: &Path) -> Result<u64, SimError> {
    Ok(u64::from_le_bytes(field(bytes, off, path)?))
}

impl Image {
    pub fn load(path: &Path) -> Result<Self, SimError> {
        let bytes = fs::read(path).map_err(|e| err(path, e.to_string()))?;
        if bytes.get(..4) != Some(&[0x7F, b'E', b'L', b'F']) {
            return Err(err(path, "not an ELF file"));
        }
        if bytes.get(4) != Some(&EI_CLASS_64) {
            return Err(err(path, "not a 64-bit ELF"));
        }
        if bytes.get(5) != Some(&EI_DATA_LE) {
            return Err(err(path, "not little-endian"));
        }
        if u16_at(&bytes, 16, path)? != ET_EXEC {
            return Err(err(path, "not an executable"));
        }
        if u16_at(&bytes, 18, path)? != EM_RISCV {
            return Err(err(path, "not a RISC-V binary"));
        }

        let entry = u64_at(&bytes, 24, path)?;
        let phoff = u64_at(&bytes, 32, path)? as usize;
        let phentsize = u16_at(&bytes, 54, path)? as usize;
        let phnum = u16_at(&bytes, 56, path)? as usize;

        let mut segments = Vec::new();
        for i in 0..phnum {
            let at = phoff + i * phentsize;
            if u32_at(&bytes, at, path)? != PT_LOAD {
                continue;
            }
            let offset = u64_at(&bytes, at + 8, path)? as usize;
            let vaddr = u64_at(&bytes, at + 16, path)?;
            let paddr = u64_at(&bytes, at + 24, path)?;
            let filesz = u64_at(&bytes, at + 32, path)? as usize;
            let memsz = u64_at(&bytes, at + 40, path)?;
            let data = bytes
                .get(offset..offset + filesz)
                .ok_or_else(|| err(path, format!("segment {i} data out of bounds")))?
                .to_vec();
            segments.push(Segment { vaddr, paddr, data, memsz });
        }
        if segments.is_empty() {
            return Err(err(path, "no loadable segments"));
        }
        Ok(Self { path: path.to_path_buf(), entry, segments })
    }

    /// Instruction fetch: the executable image backs the i-cache directly,
    /// untimed. Bytes in a segment's bss tail read as zero.
    pub fn read_u32(&self, addr: u64) -> Option<u32> {
        for seg in &self.segments {
            if addr >= seg.vaddr && addr + 4 <= seg.vaddr + seg.memsz {
                let off = (addr - seg.vaddr) as usize;
                let b = |i: usize| *seg.data.get(off + i).unwrap_or(&0) as u32;
                return Some(b(0) | b(1) << 8 | b(2) << 16 | b(3) << 24);
            }
        }
        None
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }
}
