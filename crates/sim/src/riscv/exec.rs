//! Instruction decode and dispatch.
//!
//! One instruction per call. Pure computation retires immediately and
//! advances the pc; loads, stores and AMOs publish a memory request and
//! stall the hart, finishing in the response handler. The implemented set
//! is RV64IMAF plus Zicsr and the Zacas compare-and-swap; anything else is
//! a fatal illegal-instruction diagnostic.

use log::warn;
use pando_api::{AtomicOp, PAddr, VAddr};

use super::hart::Pending;
use super::{MMIO_BASE, MMIO_PRINT_CHAR, MMIO_PRINT_HEX, MMIO_PRINT_INT, MMIO_PRINT_TIME,
            RiscvCore};
use crate::SimError;
use crate::event::EventQueue;
use crate::mem::{MemOp, Memory};
use crate::stats::Access;

/// Raw instruction word with field extractors.
#[derive(Clone, Copy)]
pub(crate) struct Insn(pub u32);

impl Insn {
    fn opcode(self) -> u32 {
        self.0 & 0x7F
    }
    fn rd(self) -> u8 {
        ((self.0 >> 7) & 0x1F) as u8
    }
    fn funct3(self) -> u32 {
        (self.0 >> 12) & 7
    }
    fn rs1(self) -> u8 {
        ((self.0 >> 15) & 0x1F) as u8
    }
    fn rs2(self) -> u8 {
        ((self.0 >> 20) & 0x1F) as u8
    }
    fn rs3(self) -> u8 {
        ((self.0 >> 27) & 0x1F) as u8
    }
    fn funct7(self) -> u32 {
        self.0 >> 25
    }
    /// AMO funct5 (aq/rl stripped).
    fn funct5(self) -> u32 {
        self.0 >> 27
    }
    fn shamt(self) -> u32 {
        (self.0 >> 20) & 0x3F
    }
    fn imm_i(self) -> i64 {
        ((self.0 as i32) >> 20) as i64
    }
    fn imm_s(self) -> i64 {
        ((((self.0 as i32) >> 25) << 5) as i64) | (((self.0 >> 7) & 0x1F) as i64)
    }
    fn imm_b(self) -> i64 {
        ((((self.0 as i32) >> 31) as i64) << 12)
            | ((((self.0 >> 7) & 1) as i64) << 11)
            | ((((self.0 >> 25) & 0x3F) as i64) << 5)
            | ((((self.0 >> 8) & 0xF) as i64) << 1)
    }
    fn imm_u(self) -> i64 {
        ((self.0 & 0xFFFF_F000) as i32) as i64
    }
    fn imm_j(self) -> i64 {
        ((((self.0 as i32) >> 31) as i64) << 20)
            | ((((self.0 >> 12) & 0xFF) as i64) << 12)
            | ((((self.0 >> 20) & 1) as i64) << 11)
            | ((((self.0 >> 21) & 0x3FF) as i64) << 1)
    }
}

impl RiscvCore {
    pub(crate) fn exec(
        &mut self,
        h: usize,
        raw: u32,
        queue: &mut EventQueue,
        memory: &Memory,
    ) -> Result<(), SimError> {
        let i = Insn(raw);
        let pc = self.harts[h].pc;
        let illegal = || SimError::IllegalInstruction { pc, raw };
        match i.opcode() {
            0x37 => {
                // lui
                self.harts[h].set_x(i.rd(), i.imm_u() as u64);
                self.harts[h].pc += 4;
            }
            0x17 => {
                // auipc
                self.harts[h].set_x(i.rd(), pc.wrapping_add(i.imm_u() as u64));
                self.harts[h].pc += 4;
            }
            0x6F => {
                // jal
                self.harts[h].set_x(i.rd(), pc + 4);
                self.harts[h].pc = pc.wrapping_add(i.imm_j() as u64);
            }
            0x67 => {
                // jalr
                let target = self.harts[h].x(i.rs1()).wrapping_add(i.imm_i() as u64) & !1;
                self.harts[h].set_x(i.rd(), pc + 4);
                self.harts[h].pc = target;
            }
            0x63 => {
                let hart = &mut self.harts[h];
                let (a, b) = (hart.x(i.rs1()), hart.x(i.rs2()));
                let taken = match i.funct3() {
                    0b000 => a == b,
                    0b001 => a != b,
                    0b100 => (a as i64) < (b as i64),
                    0b101 => (a as i64) >= (b as i64),
                    0b110 => a < b,
                    0b111 => a >= b,
                    _ => return Err(illegal()),
                };
                hart.pc = if taken { pc.wrapping_add(i.imm_b() as u64) } else { pc + 4 };
            }
            0x03 => {
                let (width, signed) = match i.funct3() {
                    0b000 => (1, true),
                    0b001 => (2, true),
                    0b010 => (4, true),
                    0b011 => (8, false),
                    0b100 => (1, false),
                    0b101 => (2, false),
                    0b110 => (4, false),
                    _ => return Err(illegal()),
                };
                let addr = self.harts[h].x(i.rs1()).wrapping_add(i.imm_i() as u64);
                self.load(h, addr, i.rd(), width, signed, false, queue, memory)?;
            }
            0x07 => {
                // flw
                if i.funct3() != 0b010 {
                    return Err(illegal());
                }
                let addr = self.harts[h].x(i.rs1()).wrapping_add(i.imm_i() as u64);
                self.load(h, addr, i.rd(), 4, false, true, queue, memory)?;
            }
            0x23 => {
                let width = match i.funct3() {
                    0b000 => 1,
                    0b001 => 2,
                    0b010 => 4,
                    0b011 => 8,
                    _ => return Err(illegal()),
                };
                let addr = self.harts[h].x(i.rs1()).wrapping_add(i.imm_s() as u64);
                if addr >= MMIO_BASE {
                    return self.store_mmio(h, addr, i, false, queue);
                }
                let v = self.harts[h].x(i.rs2());
                self.store(h, addr, &v.to_le_bytes()[..width], queue, memory)?;
            }
            0x27 => {
                // fsw
                if i.funct3() != 0b010 {
                    return Err(illegal());
                }
                let addr = self.harts[h].x(i.rs1()).wrapping_add(i.imm_s() as u64);
                if addr >= MMIO_BASE {
                    return self.store_mmio(h, addr, i, true, queue);
                }
                let bits = self.harts[h].f_bits(i.rs2());
                self.store(h, addr, &bits.to_le_bytes(), queue, memory)?;
            }
            0x13 => {
                let hart = &mut self.harts[h];
                let a = hart.x(i.rs1());
                let imm = i.imm_i();
                let v = match i.funct3() {
                    0b000 => a.wrapping_add(imm as u64),
                    0b010 => ((a as i64) < imm) as u64,
                    0b011 => (a < imm as u64) as u64,
                    0b100 => a ^ imm as u64,
                    0b110 => a | imm as u64,
                    0b111 => a & imm as u64,
                    0b001 if i.funct7() >> 1 == 0 => a << i.shamt(),
                    0b101 if i.funct7() >> 1 == 0 => a >> i.shamt(),
                    0b101 if i.funct7() >> 1 == 0b010000 => ((a as i64) >> i.shamt()) as u64,
                    _ => return Err(illegal()),
                };
                hart.set_x(i.rd(), v);
                hart.pc += 4;
            }
            0x1B => {
                let hart = &mut self.harts[h];
                let a = hart.x(i.rs1()) as u32;
                let v: i32 = match i.funct3() {
                    0b000 => a.wrapping_add(i.imm_i() as u32) as i32,
                    0b001 if i.funct7() == 0 => (a << (i.shamt() & 0x1F)) as i32,
                    0b101 if i.funct7() == 0 => (a >> (i.shamt() & 0x1F)) as i32,
                    0b101 if i.funct7() == 0b0100000 => (a as i32) >> (i.shamt() & 0x1F),
                    _ => return Err(illegal()),
                };
                hart.set_x(i.rd(), v as i64 as u64);
                hart.pc += 4;
            }
            0x33 => {
                let hart = &mut self.harts[h];
                let (a, b) = (hart.x(i.rs1()), hart.x(i.rs2()));
                let v = match (i.funct7(), i.funct3()) {
                    (0b0000000, 0b000) => a.wrapping_add(b),
                    (0b0100000, 0b000) => a.wrapping_sub(b),
                    (0b0000000, 0b001) => a << (b & 0x3F),
                    (0b0000000, 0b010) => ((a as i64) < (b as i64)) as u64,
                    (0b0000000, 0b011) => (a < b) as u64,
                    (0b0000000, 0b100) => a ^ b,
                    (0b0000000, 0b101) => a >> (b & 0x3F),
                    (0b0100000, 0b101) => ((a as i64) >> (b & 0x3F)) as u64,
                    (0b0000000, 0b110) => a | b,
                    (0b0000000, 0b111) => a & b,
                    (0b0000001, f3) => muldiv(f3, a, b).ok_or_else(illegal)?,
                    _ => return Err(illegal()),
                };
                hart.set_x(i.rd(), v);
                hart.pc += 4;
            }
            0x3B => {
                let hart = &mut self.harts[h];
                let (a, b) = (hart.x(i.rs1()) as u32, hart.x(i.rs2()) as u32);
                let v: i32 = match (i.funct7(), i.funct3()) {
                    (0b0000000, 0b000) => a.wrapping_add(b) as i32,
                    (0b0100000, 0b000) => a.wrapping_sub(b) as i32,
                    (0b0000000, 0b001) => (a << (b & 0x1F)) as i32,
                    (0b0000000, 0b101) => (a >> (b & 0x1F)) as i32,
                    (0b0100000, 0b101) => (a as i32) >> (b & 0x1F),
                    (0b0000001, f3) => muldiv32(f3, a as i32, b as i32).ok_or_else(illegal)?,
                    _ => return Err(illegal()),
                };
                hart.set_x(i.rd(), v as i64 as u64);
                hart.pc += 4;
            }
            0x2F => self.amo(h, i, queue, memory)?,
            0x0F => {
                // fence: no reordering to undo
                self.harts[h].pc += 4;
            }
            0x73 => match i.funct3() {
                0b000 if i.imm_i() == 0 => self.ecall(h, queue, memory)?,
                0b000 => return Err(illegal()),
                _ => self.csr(h, i, queue)?,
            },
            0x53 => self.fp_op(h, i)?,
            0x43 | 0x47 | 0x4B | 0x4F => self.fp_fma(h, i)?,
            _ => return Err(illegal()),
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn load(
        &mut self,
        h: usize,
        addr: u64,
        rd: u8,
        width: u8,
        signed: bool,
        float: bool,
        queue: &mut EventQueue,
        memory: &Memory,
    ) -> Result<(), SimError> {
        let paddr = VAddr::decode(addr).to_physical(self.site);
        self.record_access(h, Access::Load, paddr);
        self.issue(
            h,
            paddr,
            MemOp::Read { size: width as usize },
            Pending::Load { rd, width, signed, float },
            queue,
            memory,
        )
    }

    fn store(
        &mut self,
        h: usize,
        addr: u64,
        bytes: &[u8],
        queue: &mut EventQueue,
        memory: &Memory,
    ) -> Result<(), SimError> {
        let paddr = VAddr::decode(addr).to_physical(self.site);
        self.record_access(h, Access::Store, paddr);
        if let PAddr::Ctrl { .. } = paddr {
            return self.ctrl_store(h, paddr, bytes, queue);
        }
        self.issue(
            h,
            paddr,
            MemOp::Write { data: bytes.to_vec() },
            Pending::Store,
            queue,
            memory,
        )
    }

    fn amo(
        &mut self,
        h: usize,
        i: Insn,
        queue: &mut EventQueue,
        memory: &Memory,
    ) -> Result<(), SimError> {
        let pc = self.harts[h].pc;
        let width: u8 = match i.funct3() {
            0b010 => 4,
            0b011 => 8,
            _ => return Err(SimError::IllegalInstruction { pc, raw: i.0 }),
        };
        // aq/rl bits are accepted and ignored; ordering comes from the
        // controller's linearization
        let op = match i.funct5() {
            0b00000 => AtomicOp::Add,
            0b00001 => AtomicOp::Swap,
            0b01000 => AtomicOp::Or,
            0b00101 => AtomicOp::Cas,
            _ => return Err(SimError::IllegalInstruction { pc, raw: i.0 }),
        };
        let addr = self.harts[h].x(i.rs1());
        let paddr = VAddr::decode(addr).to_physical(self.site);
        self.record_access(h, Access::Atomic, paddr);

        let w = self.harts[h].x(i.rs2());
        let wdata = w.to_le_bytes()[..width as usize].to_vec();
        // Zacas: the expected value rides in rd and is replaced by the result
        let ext = op
            .has_ext()
            .then(|| self.harts[h].x(i.rd()).to_le_bytes()[..width as usize].to_vec());
        self.issue(
            h,
            paddr,
            MemOp::Atomic { op, wdata, ext },
            Pending::Amo { rd: i.rd(), width },
            queue,
            memory,
        )
    }

    fn store_mmio(
        &mut self,
        h: usize,
        addr: u64,
        i: Insn,
        float: bool,
        queue: &EventQueue,
    ) -> Result<(), SimError> {
        let hart = &self.harts[h];
        let whoami = format!(
            "PXN {:3} POD {:2} CORE {:3} THREAD {:2}",
            self.site.pxn,
            self.site.pod,
            self.site.core_id(),
            h
        );
        match addr {
            MMIO_PRINT_INT => {
                if float {
                    println!("{whoami}: {}", hart.fs(i.rs2()));
                } else {
                    println!("{whoami}: {}", hart.sx(i.rs2()));
                }
            }
            MMIO_PRINT_HEX => println!("{whoami}: 0x{:016x}", hart.x(i.rs2())),
            MMIO_PRINT_CHAR => print!("{}", hart.x(i.rs2()) as u8 as char),
            MMIO_PRINT_TIME => println!("{whoami}: {} ps", queue.now()),
            _ => {
                return Err(SimError::IllegalInstruction { pc: hart.pc, raw: i.0 });
            }
        }
        self.harts[h].pc += 4;
        Ok(())
    }

    /// A store that translated into a core's control window. Only 8-byte
    /// writes are defined there.
    fn ctrl_store(
        &mut self,
        h: usize,
        paddr: PAddr,
        bytes: &[u8],
        queue: &mut EventQueue,
    ) -> Result<(), SimError> {
        let PAddr::Ctrl { pxn, pod, core_y, core_x, offset } = paddr else { unreachable!() };
        if bytes.len() != 8 {
            return Err(SimError::InvalidAddress { paddr });
        }
        let value = u64::from_le_bytes(bytes.try_into().unwrap());
        let dst = pando_api::Site { pxn, pod, core_y, core_x };
        let token = self.stall_for_ctrl(h);
        queue.push(
            queue.now() + self.period,
            crate::event::Event::CtrlWrite {
                dst,
                offset,
                value,
                origin: Some((self.index, h, token)),
            },
        );
        Ok(())
    }

    fn csr(&mut self, h: usize, i: Insn, queue: &EventQueue) -> Result<(), SimError> {
        let csr = (i.0 >> 20) as u64;
        let (wval, mask) = match i.funct3() {
            0b001 => (self.harts[h].x(i.rs1()), u64::MAX),
            0b010 => (u64::MAX, self.harts[h].x(i.rs1())),
            0b011 => (0, self.harts[h].x(i.rs1())),
            0b101 => (i.rs1() as u64, u64::MAX),
            0b110 => (u64::MAX, i.rs1() as u64),
            0b111 => (0, i.rs1() as u64),
            _ => return Err(SimError::IllegalInstruction { pc: self.harts[h].pc, raw: i.0 }),
        };
        let rval = self.csr_rw(h, csr, wval, mask, queue)?;
        self.harts[h].set_x(i.rd(), rval);
        self.harts[h].pc += 4;
        Ok(())
    }

    /// Machine-info CSRs expose the fabric dimensions to the workload.
    fn csr_rw(
        &mut self,
        h: usize,
        csr: u64,
        wval: u64,
        mask: u64,
        queue: &EventQueue,
    ) -> Result<u64, SimError> {
        let cfg = &self.config;
        Ok(match csr {
            0xF14 => h as u64,
            0xF15 => self.site.core_id() as u64,
            0xF16 => self.site.pod as u64,
            0xF17 => self.site.pxn as u64,
            0xF18 => self.harts.len() as u64,
            0xF19 => cfg.cores_per_pod() as u64,
            0xF1A => cfg.pods_per_pxn() as u64,
            0xF1B => cfg.num_pxn() as u64,
            0xF1C => cfg.l1sp_size(),
            0xF1D => cfg.l2sp_size(),
            0xF1E => cfg.dram_size(),
            0x002 => {
                let old = self.harts[h].frm;
                self.harts[h].frm = (old & !mask) | (wval & mask);
                old
            }
            0x300 | 0x304 | 0x305 | 0x341 => {
                warn!("core {}: CSR {csr:#x} not modeled", self.site);
                0
            }
            0xC00 => self.cycle(queue),
            _ => {
                return Err(SimError::IllegalInstruction {
                    pc: self.harts[h].pc,
                    raw: csr as u32,
                });
            }
        })
    }

    fn fp_op(&mut self, h: usize, i: Insn) -> Result<(), SimError> {
        let pc = self.harts[h].pc;
        let illegal = move || SimError::IllegalInstruction { pc, raw: i.0 };
        let hart = &mut self.harts[h];
        let (a, b) = (hart.fs(i.rs1()), hart.fs(i.rs2()));
        match i.funct7() {
            0b0000000 => hart.set_fs(i.rd(), a + b),
            0b0000100 => hart.set_fs(i.rd(), a - b),
            0b0001000 => hart.set_fs(i.rd(), a * b),
            0b0001100 => hart.set_fs(i.rd(), a / b),
            0b0101100 => hart.set_fs(i.rd(), a.sqrt()),
            0b0010000 => {
                let bits = match i.funct3() {
                    0b000 => (a.to_bits() & 0x7FFF_FFFF) | (b.to_bits() & 0x8000_0000),
                    0b001 => (a.to_bits() & 0x7FFF_FFFF) | (!b.to_bits() & 0x8000_0000),
                    0b010 => a.to_bits() ^ (b.to_bits() & 0x8000_0000),
                    _ => return Err(illegal()),
                };
                hart.set_f_bits(i.rd(), bits);
            }
            0b0010100 => match i.funct3() {
                0b000 => hart.set_fs(i.rd(), a.min(b)),
                0b001 => hart.set_fs(i.rd(), a.max(b)),
                _ => return Err(illegal()),
            },
            0b1010000 => {
                let v = match i.funct3() {
                    0b010 => (a == b) as u64,
                    0b001 => (a < b) as u64,
                    0b000 => (a <= b) as u64,
                    _ => return Err(illegal()),
                };
                hart.set_x(i.rd(), v);
            }
            0b1100000 => {
                let v = match i.rs2() {
                    0 => a as i32 as i64 as u64,
                    1 => a as u32 as u64,
                    2 => a as i64 as u64,
                    3 => a as u64,
                    _ => return Err(illegal()),
                };
                hart.set_x(i.rd(), v);
            }
            0b1101000 => {
                let v = match i.rs2() {
                    0 => hart.x(i.rs1()) as i32 as f32,
                    1 => hart.x(i.rs1()) as u32 as f32,
                    2 => hart.sx(i.rs1()) as f32,
                    3 => hart.x(i.rs1()) as f32,
                    _ => return Err(illegal()),
                };
                hart.set_fs(i.rd(), v);
            }
            0b1110000 if i.funct3() == 0 => {
                let v = hart.f_bits(i.rs1()) as i32 as i64 as u64;
                hart.set_x(i.rd(), v);
            }
            0b1111000 if i.funct3() == 0 => {
                let bits = hart.x(i.rs1()) as u32;
                hart.set_f_bits(i.rd(), bits);
            }
            _ => return Err(illegal()),
        }
        hart.pc += 4;
        Ok(())
    }

    fn fp_fma(&mut self, h: usize, i: Insn) -> Result<(), SimError> {
        if i.0 & 0x0600_0000 != 0 {
            // fmt must be S
            return Err(SimError::IllegalInstruction { pc: self.harts[h].pc, raw: i.0 });
        }
        let hart = &mut self.harts[h];
        let (a, b, c) = (hart.fs(i.rs1()), hart.fs(i.rs2()), hart.fs(i.rs3()));
        let v = match i.opcode() {
            0x43 => a.mul_add(b, c),
            0x47 => a.mul_add(b, -c),
            0x4B => -(a.mul_add(b, -c)),
            0x4F => -(a.mul_add(b, c)),
            _ => unreachable!(),
        };
        hart.set_fs(i.rd(), v);
        hart.pc += 4;
        Ok(())
    }
}

fn muldiv(f3: u32, a: u64, b: u64) -> Option<u64> {
    Some(match f3 {
        0b000 => a.wrapping_mul(b),
        0b001 => (((a as i64 as i128) * (b as i64 as i128)) >> 64) as u64,
        0b010 => (((a as i64 as i128) * (b as u128 as i128)) >> 64) as u64,
        0b011 => (((a as u128) * (b as u128)) >> 64) as u64,
        0b100 => {
            let (a, b) = (a as i64, b as i64);
            if b == 0 {
                u64::MAX
            } else {
                a.wrapping_div(b) as u64
            }
        }
        0b101 => {
            if b == 0 {
                u64::MAX
            } else {
                a / b
            }
        }
        0b110 => {
            let (a, b) = (a as i64, b as i64);
            if b == 0 {
                a as u64
            } else {
                a.wrapping_rem(b) as u64
            }
        }
        0b111 => {
            if b == 0 {
                a
            } else {
                a % b
            }
        }
        _ => return None,
    })
}

fn muldiv32(f3: u32, a: i32, b: i32) -> Option<i32> {
    Some(match f3 {
        0b000 => a.wrapping_mul(b),
        0b100 => {
            if b == 0 {
                -1
            } else {
                a.wrapping_div(b)
            }
        }
        0b101 => {
            if b == 0 {
                -1
            } else {
                ((a as u32) / (b as u32)) as i32
            }
        }
        0b110 => {
            if b == 0 {
                a
            } else {
                a.wrapping_rem(b)
            }
        }
        0b111 => {
            if b == 0 {
                a
            } else {
                ((a as u32) % (b as u32)) as i32
            }
        }
        _ => return None,
    })
}
