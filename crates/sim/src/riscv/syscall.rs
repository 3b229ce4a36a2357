//! ECALL emulation.
//!
//! The seven calls the runtime needs: exit, brk, write, read, open, close,
//! fstat, numbered per the riscv-newlib ABI. Buffers living in simulated
//! memory move through the modeled network in chunks bounded by the output
//! buffer size; the continuation behind the last chunk finishes the call.
//! The pc advances when the ECALL issues; only the stall is released later.

use std::fs::File;
use std::io::{Read, Write};

use hashbrown::{HashMap, HashSet};
use int_enum::IntEnum;
use log::{debug, warn};
use pando_api::{PAddr, VAddr};
use slab::Slab;

use super::hart::{Pending, ReadCont};
use super::RiscvCore;
use crate::SimError;
use crate::event::EventQueue;
use crate::mem::{MemOp, MemRequest, Memory};

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntEnum)]
#[repr(u64)]
enum Sysno {
    Close = 57,
    Read = 63,
    Write = 64,
    Fstat = 80,
    Exit = 93,
    Brk = 214,
    Open = 1024,
}

// newlib open(2) flag bits
const O_WRONLY: u64 = 0x1;
const O_RDWR: u64 = 0x2;
const O_APPEND: u64 = 0x8;
const O_CREAT: u64 = 0x200;
const O_TRUNC: u64 = 0x400;

/// Host files backing the workload's descriptors. 0/1/2 are the host
/// standard streams and are never closed; everything else lives in a slab
/// whose keys become descriptors.
pub struct FdTable {
    files: Slab<File>,
}

const FD_BASE: i32 = 3;

impl FdTable {
    pub fn new() -> Self {
        Self { files: Slab::new() }
    }

    fn slot(&mut self, fd: i32) -> Option<&mut File> {
        if fd < FD_BASE {
            return None;
        }
        self.files.get_mut((fd - FD_BASE) as usize)
    }

    fn open(&mut self, path: &str, flags: u64) -> i64 {
        let mut opts = File::options();
        match flags & 0x3 {
            O_WRONLY => opts.write(true),
            O_RDWR => opts.read(true).write(true),
            _ => opts.read(true),
        };
        opts.create(flags & O_CREAT != 0)
            .truncate(flags & O_TRUNC != 0)
            .append(flags & O_APPEND != 0);
        match opts.open(path) {
            Ok(f) => self.files.insert(f) as i64 + FD_BASE as i64,
            Err(e) => {
                debug!("open({path:?}) failed: {e}");
                -1
            }
        }
    }

    fn write(&mut self, fd: i32, buf: &[u8]) -> i64 {
        let r = match fd {
            1 => std::io::stdout().write(buf).and_then(|n| {
                std::io::stdout().flush()?;
                Ok(n)
            }),
            2 => std::io::stderr().write(buf),
            _ => match self.slot(fd) {
                Some(f) => f.write(buf),
                None => return -1,
            },
        };
        r.map(|n| n as i64).unwrap_or(-1)
    }

    fn read(&mut self, fd: i32, buf: &mut [u8]) -> i64 {
        let r = match fd {
            0 => std::io::stdin().read(buf),
            _ => match self.slot(fd) {
                Some(f) => f.read(buf),
                None => return -1,
            },
        };
        r.map(|n| n as i64).unwrap_or(-1)
    }

    fn close(&mut self, fd: i32) -> i64 {
        if fd < FD_BASE {
            return 0;
        }
        match self.files.try_remove((fd - FD_BASE) as usize) {
            Some(_) => 0,
            None => -1,
        }
    }

    /// riscv64 stat buffer: mode at offset 16, size at offset 48. The
    /// standard streams report as character devices.
    fn fstat(&mut self, fd: i32) -> (i64, Vec<u8>) {
        let mut stat = vec![0u8; 128];
        if fd < FD_BASE {
            stat[16..20].copy_from_slice(&(0o020000u32 | 0o666).to_le_bytes());
            return (0, stat);
        }
        match self.slot(fd).and_then(|f| f.metadata().ok()) {
            Some(meta) => {
                stat[16..20].copy_from_slice(&(0o100000u32 | 0o644).to_le_bytes());
                stat[48..56].copy_from_slice(&(meta.len() as i64).to_le_bytes());
                (0, stat)
            }
            None => (-1, stat),
        }
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RiscvCore {
    pub(crate) fn ecall(
        &mut self,
        h: usize,
        queue: &mut EventQueue,
        memory: &Memory,
    ) -> Result<(), SimError> {
        let sysno = self.harts[h].a(7);
        // the call advances the pc now; a stalled hart only resumes later
        self.harts[h].pc += 4;
        match Sysno::try_from(sysno) {
            Ok(Sysno::Exit) => {
                let code = self.harts[h].a(0) as i64;
                debug!("core {}: hart {h} exit({code})", self.site);
                let hart = self.hart(h);
                hart.exited = true;
                hart.exit_code = code;
            }
            Ok(Sysno::Brk) => {
                // the runtime allocates from the fabric, never the host
                self.harts[h].set_a(0, u64::MAX);
            }
            Ok(Sysno::Close) => {
                let fd = self.harts[h].a(0) as i32;
                let r = self.files.close(fd);
                self.harts[h].set_a(0, r as u64);
            }
            Ok(Sysno::Write) => {
                let fd = self.harts[h].a(0) as i32;
                let buf = self.harts[h].a(1);
                let len = self.harts[h].a(2) as usize;
                debug!("core {}: hart {h} write(fd={fd}, len={len})", self.site);
                let paddr = VAddr::decode(buf).to_physical(self.site);
                self.read_guest_buffer(
                    h,
                    paddr,
                    len,
                    ReadCont::Write { fd, len },
                    queue,
                    memory,
                )?;
            }
            Ok(Sysno::Read) => {
                let fd = self.harts[h].a(0) as i32;
                let buf = self.harts[h].a(1);
                let len = self.harts[h].a(2) as usize;
                debug!("core {}: hart {h} read(fd={fd}, len={len})", self.site);
                let mut data = vec![0u8; len];
                let r = self.files.read(fd, &mut data);
                self.harts[h].set_a(0, r as u64);
                let paddr = VAddr::decode(buf).to_physical(self.site);
                self.write_guest_buffer(h, paddr, data, queue, memory)?;
            }
            Ok(Sysno::Open) => {
                let path = self.harts[h].a(0);
                let flags = self.harts[h].a(1);
                let paddr = VAddr::decode(path).to_physical(self.site);
                self.read_guest_buffer(
                    h,
                    paddr,
                    1024,
                    ReadCont::Open { flags },
                    queue,
                    memory,
                )?;
            }
            Ok(Sysno::Fstat) => {
                let fd = self.harts[h].a(0) as i32;
                let buf = self.harts[h].a(1);
                let (r, stat) = self.files.fstat(fd);
                self.harts[h].set_a(0, r as u64);
                let paddr = VAddr::decode(buf).to_physical(self.site);
                self.write_guest_buffer(h, paddr, stat, queue, memory)?;
            }
            Err(_) => {
                return Err(SimError::IllegalInstruction {
                    pc: self.harts[h].pc - 4,
                    raw: sysno as u32,
                });
            }
        }
        Ok(())
    }

    /// Fetch `n` guest bytes at `base` through the modeled memory, then run
    /// `cont` on the assembled buffer.
    fn read_guest_buffer(
        &mut self,
        h: usize,
        base: PAddr,
        n: usize,
        cont: ReadCont,
        queue: &mut EventQueue,
        memory: &Memory,
    ) -> Result<(), SimError> {
        if n == 0 {
            self.finish_buf_read(h, Vec::new(), cont);
            return Ok(());
        }
        let chunks = memory.stripe_chunks(base, n, self.max_req);
        let mut parts = HashMap::new();
        let mut issues = Vec::with_capacity(chunks.len());
        for (piece, pos, len) in chunks {
            let token = self.issue_token();
            parts.insert(token, pos);
            issues.push((token, piece, len));
        }
        {
            let hart = self.hart(h);
            hart.stalled = true;
            hart.pending = Some(Pending::BufRead { buf: vec![0u8; n], parts, cont });
        }
        for (token, piece, len) in issues {
            let req = MemRequest {
                core: self.index,
                tid: h,
                token,
                paddr: piece,
                op: MemOp::Read { size: len },
            };
            if let Some(resp) = memory.submit(queue, self.site.pxn, req)? {
                self.complete_mem(h, token, resp)?;
            }
        }
        Ok(())
    }

    /// Store a host buffer into guest memory, unstalling the hart when the
    /// last chunk completes.
    fn write_guest_buffer(
        &mut self,
        h: usize,
        base: PAddr,
        data: Vec<u8>,
        queue: &mut EventQueue,
        memory: &Memory,
    ) -> Result<(), SimError> {
        if data.is_empty() {
            return Ok(());
        }
        let chunks = memory.stripe_chunks(base, data.len(), self.max_req);
        let mut parts = HashSet::new();
        let mut issues = Vec::with_capacity(chunks.len());
        for (piece, pos, len) in chunks {
            let token = self.issue_token();
            parts.insert(token);
            issues.push((token, piece, pos, len));
        }
        {
            let hart = self.hart(h);
            hart.stalled = true;
            hart.pending = Some(Pending::BufWrite { parts });
        }
        for (token, piece, pos, len) in issues {
            let req = MemRequest {
                core: self.index,
                tid: h,
                token,
                paddr: piece,
                op: MemOp::Write { data: data[pos..pos + len].to_vec() },
            };
            if let Some(resp) = memory.submit(queue, self.site.pxn, req)? {
                self.complete_mem(h, token, resp)?;
            }
        }
        Ok(())
    }

    /// Run the continuation behind a completed guest-buffer read.
    pub(crate) fn finish_buf_read(&mut self, h: usize, buf: Vec<u8>, cont: ReadCont) {
        match cont {
            ReadCont::Write { fd, len } => {
                let r = self.files.write(fd, &buf[..len.min(buf.len())]);
                let hart = self.hart(h);
                hart.set_a(0, r as u64);
                hart.stalled = false;
            }
            ReadCont::Open { flags } => {
                let nul = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
                let r = match std::str::from_utf8(&buf[..nul]) {
                    Ok(path) => self.files.open(path, flags),
                    Err(_) => {
                        warn!("core {}: open() path is not utf-8", self.site);
                        -1
                    }
                };
                let hart = self.hart(h);
                hart.set_a(0, r as u64);
                hart.stalled = false;
            }
        }
    }
}
