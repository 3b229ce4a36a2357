//! End-to-end runs of hand-assembled RV64 binaries on the RISC-V
//! front-end: loads, stores and AMOs through the modeled memory, syscalls,
//! reset release timing.

use std::io::Write as _;
use std::path::PathBuf;

use pando_api::{PAddr, SysConfig};
use pando_sim::event::PS_PER_NS;
use pando_sim::mem::Backend;
use pando_sim::{SimOptions, Simulation};

// -- a tiny assembler ------------------------------------------------------

fn enc_r(op: u32, rd: u32, f3: u32, rs1: u32, rs2: u32, f7: u32) -> u32 {
    op | (rd << 7) | (f3 << 12) | (rs1 << 15) | (rs2 << 20) | (f7 << 25)
}

fn enc_i(op: u32, rd: u32, f3: u32, rs1: u32, imm: i32) -> u32 {
    op | (rd << 7) | (f3 << 12) | (rs1 << 15) | (((imm as u32) & 0xFFF) << 20)
}

fn enc_s(op: u32, f3: u32, rs1: u32, rs2: u32, imm: i32) -> u32 {
    let imm = imm as u32;
    op | ((imm & 0x1F) << 7) | (f3 << 12) | (rs1 << 15) | (rs2 << 20) | ((imm >> 5) << 25)
}

fn enc_b(op: u32, f3: u32, rs1: u32, rs2: u32, imm: i32) -> u32 {
    let imm = imm as u32;
    op | (((imm >> 11) & 1) << 7)
        | (((imm >> 1) & 0xF) << 8)
        | (f3 << 12)
        | (rs1 << 15)
        | (rs2 << 20)
        | (((imm >> 5) & 0x3F) << 25)
        | (((imm >> 12) & 1) << 31)
}

fn enc_amo(f5: u32, f3: u32, rd: u32, rs1: u32, rs2: u32) -> u32 {
    0x2F | (rd << 7) | (f3 << 12) | (rs1 << 15) | (rs2 << 20) | (f5 << 27)
}

const ECALL: u32 = 0x73;

fn exit_with(code_reg_setup: &[u32]) -> Vec<u32> {
    let mut v = code_reg_setup.to_vec();
    v.push(enc_i(0x13, 17, 0, 0, 93)); // li a7, SYS_exit
    v.push(ECALL);
    v
}

// -- minimal RV64 executable container --------------------------------------

fn build_elf(vaddr: u64, code: &[u32]) -> Vec<u8> {
    let code_bytes: Vec<u8> = code.iter().flat_map(|w| w.to_le_bytes()).collect();
    let mut out = vec![0u8; 0x78];
    out[..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
    out[4] = 2; // ELFCLASS64
    out[5] = 1; // little-endian
    out[6] = 1;
    out[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    out[18..20].copy_from_slice(&243u16.to_le_bytes()); // EM_RISCV
    out[24..32].copy_from_slice(&vaddr.to_le_bytes());
    out[32..40].copy_from_slice(&0x40u64.to_le_bytes());
    out[54..56].copy_from_slice(&56u16.to_le_bytes());
    out[56..58].copy_from_slice(&1u16.to_le_bytes());
    out[0x40..0x44].copy_from_slice(&1u32.to_le_bytes()); // PT_LOAD
    out[0x48..0x50].copy_from_slice(&0x78u64.to_le_bytes());
    out[0x50..0x58].copy_from_slice(&vaddr.to_le_bytes());
    out[0x58..0x60].copy_from_slice(&vaddr.to_le_bytes());
    out[0x60..0x68].copy_from_slice(&(code_bytes.len() as u64).to_le_bytes());
    out[0x68..0x70].copy_from_slice(&(code_bytes.len() as u64).to_le_bytes());
    out.extend_from_slice(&code_bytes);
    out
}

fn write_elf(code: &[u32]) -> (tempfile::NamedTempFile, PathBuf) {
    // link at the base of PXN 0's DRAM
    let vaddr = 1u64 << 47;
    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(&build_elf(vaddr, code)).unwrap();
    let path = f.path().to_path_buf();
    (f, path)
}

fn one_core_cfg() -> SysConfig {
    SysConfig {
        sys_num_pxn: 1,
        sys_pxn_pods: 1,
        sys_pod_cores: 1,
        sys_core_threads: 1,
        ..SysConfig::default()
    }
}

#[test]
fn store_load_amo_roundtrip() {
    // sd 42 to own L1SP, load it back, amoadd.d 42 on it, check both the
    // returned read-out and the final memory; exit code ORs the mismatches
    let code = exit_with(&[
        enc_i(0x13, 5, 0, 0, 42),    // addi x5, x0, 42
        enc_s(0x23, 3, 0, 5, 8),     // sd x5, 8(x0)
        enc_i(0x03, 6, 3, 0, 8),     // ld x6, 8(x0)
        enc_i(0x13, 8, 0, 0, 8),     // addi x8, x0, 8
        enc_amo(0, 3, 7, 8, 5),      // amoadd.d x7, x5, (x8)
        enc_i(0x03, 9, 3, 0, 8),     // ld x9, 8(x0)
        enc_r(0x33, 10, 4, 5, 6, 0), // xor a0, x5, x6
        enc_i(0x13, 28, 0, 0, 42),
        enc_r(0x33, 29, 4, 7, 28, 0), // xor x29, x7, 42
        enc_r(0x33, 10, 6, 10, 29, 0),
        enc_i(0x13, 28, 0, 0, 84),
        enc_r(0x33, 29, 4, 9, 28, 0), // xor x29, x9, 84
        enc_r(0x33, 10, 6, 10, 29, 0),
    ]);
    let (_f, path) = write_elf(&code);
    let opts = SimOptions { backend: Backend::default(), ..SimOptions::default() };
    let mut sim = Simulation::riscv(one_core_cfg(), opts, &path).unwrap();
    let summary = sim.run().unwrap();
    assert!(summary.success, "exit codes: {:?}", sim.exit_codes());

    // the word ended up in the core's L1SP, doubled by the amoadd
    let paddr = PAddr::L1sp { pxn: 0, pod: 0, core_y: 0, core_x: 0, offset: 8 };
    assert_eq!(sim.memory().read_blob(paddr, 8).unwrap(), 84u64.to_le_bytes());
}

#[test]
fn branch_loop_counts() {
    // count x5 from 0 to 10, exit with x5 - 10
    let code = exit_with(&[
        enc_i(0x13, 5, 0, 0, 0),     // addi x5, x0, 0
        enc_i(0x13, 6, 0, 0, 10),    // addi x6, x0, 10
        enc_i(0x13, 5, 0, 5, 1),     // loop: addi x5, x5, 1
        enc_b(0x63, 1, 5, 6, -4),    // bne x5, x6, loop
        enc_i(0x13, 10, 0, 5, -10),  // addi a0, x5, -10
    ]);
    let (_f, path) = write_elf(&code);
    let opts = SimOptions { backend: Backend::Simple, ..SimOptions::default() };
    let mut sim = Simulation::riscv(one_core_cfg(), opts, &path).unwrap();
    assert!(sim.run().unwrap().success);
}

#[test]
fn harts_interleave_on_shared_counter() {
    // 4 harts each amoadd.d 1 to the same DRAM word, then exit 0; the
    // word holds 4 afterwards
    let code = exit_with(&[
        // x8 = dram base + 0x100 (counter slot, clear of the code)
        enc_i(0x13, 8, 0, 0, 1),  // addi x8, x0, 1
        enc_i(0x13, 9, 0, 0, 47), // addi x9, x0, 47
        enc_r(0x33, 8, 1, 8, 9, 0), // sll x8, x8, x9
        enc_i(0x13, 8, 0, 8, 0x100),
        enc_i(0x13, 5, 0, 0, 1),  // addi x5, x0, 1
        enc_amo(0, 3, 7, 8, 5),   // amoadd.d x7, x5, (x8)
        enc_i(0x13, 10, 0, 0, 0), // a0 = 0
    ]);
    let (_f, path) = write_elf(&code);
    let cfg = SysConfig { sys_core_threads: 4, ..one_core_cfg() };
    let opts = SimOptions { backend: Backend::default(), ..SimOptions::default() };
    let mut sim = Simulation::riscv(cfg, opts, &path).unwrap();
    assert!(sim.run().unwrap().success);

    let paddr = PAddr::Dram { pxn: 0, offset: 0x100 };
    assert_eq!(sim.memory().read_blob(paddr, 8).unwrap(), 4u64.to_le_bytes());
}

#[test]
fn reset_release_delays_execution() {
    let code = exit_with(&[enc_i(0x13, 10, 0, 0, 0)]);
    let (_f, path) = write_elf(&code);
    let opts = SimOptions {
        backend: Backend::Simple,
        release_reset: 500_000, // 500 ns in ps
        ..SimOptions::default()
    };
    let mut sim = Simulation::riscv(one_core_cfg(), opts, &path).unwrap();
    let summary = sim.run().unwrap();
    assert!(summary.success);
    assert!(summary.time_ps >= 500_000, "finished at {} ps", summary.time_ps);
}

/// Two-core program for the reset-versus-in-flight-load races. Core 0
/// loads a marker word from DRAM through a long-latency link, bumping a
/// run counter in x20 that survives reset, and exits with the difference
/// between the loaded word and the second run's marker. Core 1 waits
/// until core 0 is stalled on the load, asserts core 0's reset, spins
/// `hold` iterations, releases it, and exits.
fn reset_race_program(hold: i32) -> Vec<u32> {
    let code = vec![
        enc_i(0x73, 5, 0b010, 0, 0xF15), // csrrs x5, mcoreid, x0
        enc_b(0x63, 1, 5, 0, 48),        // bne x5, x0, core1
        // core0:
        enc_i(0x13, 20, 0, 20, 1),  // addi x20, x20, 1 (run counter)
        enc_i(0x13, 9, 0, 0, 1),    // addi x9, x0, 1
        enc_i(0x13, 9, 1, 9, 47),   // slli x9, x9, 47 (dram base)
        enc_i(0x13, 21, 0, 20, -1), // addi x21, x20, -1
        enc_i(0x13, 21, 1, 21, 3),  // slli x21, x21, 3
        enc_r(0x33, 8, 0, 9, 21, 0), // add x8, x9, x21
        enc_i(0x03, 6, 3, 8, 0x200), // ld x6, 0x200(x8) -- raced by reset
        enc_i(0x13, 28, 0, 0, 0xBB), // addi x28, x0, 0xBB
        enc_r(0x33, 10, 0, 6, 28, 0x20), // sub a0, x6, x28
        enc_i(0x13, 17, 0, 0, 93),
        ECALL,
        // core1: let core 0 reach its load first
        enc_i(0x13, 22, 0, 0, 64),
        enc_i(0x13, 22, 0, 22, -1),
        enc_b(0x63, 1, 22, 0, -4),
        // x9 = core 0's control window base
        enc_i(0x13, 9, 0, 0, 1),
        enc_i(0x13, 9, 1, 9, 63),
        enc_i(0x13, 28, 0, 0, 1),
        enc_i(0x13, 28, 1, 28, 47),
        enc_r(0x33, 9, 6, 9, 28, 0), // or x9, x9, x28
        enc_i(0x13, 7, 0, 0, 1),
        enc_s(0x23, 3, 9, 7, 0), // sd x7, 0(x9): assert reset
        // hold reset for `hold` << 3 iterations
        enc_i(0x13, 22, 0, 0, hold),
        enc_i(0x13, 22, 1, 22, 3),
        enc_i(0x13, 22, 0, 22, -1),
        enc_b(0x63, 1, 22, 0, -4),
        enc_s(0x23, 3, 9, 0, 0), // sd x0, 0(x9): release
        enc_i(0x13, 10, 0, 0, 0),
        enc_i(0x13, 17, 0, 0, 93),
        ECALL,
    ];
    // the hand-computed bne offset (48) must land on core 1's first word
    assert_eq!(code[13], enc_i(0x13, 22, 0, 0, 64));
    code
}

fn run_reset_race(hold: i32) {
    let (_f, path) = write_elf(&reset_race_program(hold));
    let cfg = SysConfig { sys_pod_cores: 2, ..one_core_cfg() };
    let opts = SimOptions {
        // long flight time so the reset always beats the response
        backend: Backend::SelfLink { latency: 100_000 * PS_PER_NS },
        ..SimOptions::default()
    };
    let mut sim = Simulation::riscv(cfg, opts, &path).unwrap();
    // run 1 reads the 0xAA marker, run 2 (after reset) the 0xBB one
    sim.memory()
        .write_blob(PAddr::Dram { pxn: 0, offset: 0x200 }, &0xAAu64.to_le_bytes())
        .unwrap();
    sim.memory()
        .write_blob(PAddr::Dram { pxn: 0, offset: 0x208 }, &0xBBu64.to_le_bytes())
        .unwrap();
    let summary = sim.run().unwrap();
    assert!(summary.success, "exit codes: {:?}", sim.exit_codes());
}

#[test]
fn reset_discards_the_in_flight_response() {
    // reset is held past the old load's response: the response finds no
    // pending operation and must be dropped, not treated as fatal
    run_reset_race(1750); // 14000 spin iterations, well past the flight time
}

#[test]
fn stale_response_after_reset_does_not_corrupt_the_new_load() {
    // reset is released immediately, so the rerun's load is in flight
    // when the old response lands; the old token must not complete it
    run_reset_race(1);
}

#[test]
fn csr_reports_fabric_dimensions() {
    // mpodcores CSR (0xF19) reads back the configured core count; exit
    // with the difference
    let code = exit_with(&[
        enc_i(0x73, 5, 0b010, 0, 0xF19u32 as i32), // csrrs x5, mpodcores, x0
        enc_i(0x13, 10, 0, 5, -1),                 // a0 = x5 - 1
    ]);
    let (_f, path) = write_elf(&code);
    let opts = SimOptions { backend: Backend::Simple, ..SimOptions::default() };
    let mut sim = Simulation::riscv(one_core_cfg(), opts, &path).unwrap();
    assert!(sim.run().unwrap().success);
}
