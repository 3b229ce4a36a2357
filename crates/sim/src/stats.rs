//! Statistics collection.
//!
//! Counters are kept per thread and bucketed twice: a running total and a
//! per-stage copy, where the stage is whatever the thread had declared via
//! `SetStage` when the event was recorded. Memory accesses are split by
//! destination kind as seen from the issuing core: local-PXN L1SP, L2SP and
//! DRAM, or remote PXN. The writer appends one `SimTime,TagName` row to
//! `tags.csv` per application dump request and snapshots every counter to
//! `stats.csv`.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use bitflags::bitflags;
use hashbrown::HashMap;
use log::debug;
use pando_api::{MemKind, PAddr, Stage};

use crate::event::Time;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Load,
    Store,
    Atomic,
}

impl Access {
    pub const fn name(self) -> &'static str {
        match self {
            Access::Load => "load",
            Access::Store => "store",
            Access::Atomic => "atomic",
        }
    }
}

/// Destination of a memory access for accounting purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dest {
    L1sp,
    L2sp,
    Dram,
    RemotePxn,
}

impl Dest {
    pub const fn name(self) -> &'static str {
        match self {
            Dest::L1sp => "l1sp",
            Dest::L2sp => "l2sp",
            Dest::Dram => "dram",
            Dest::RemotePxn => "remote_pxn",
        }
    }
}

/// Classify a physical destination relative to the issuing core's PXN.
pub fn classify(paddr: PAddr, self_pxn: u16) -> Option<Dest> {
    if paddr.pxn() != self_pxn {
        return Some(Dest::RemotePxn);
    }
    match paddr.memory_type() {
        Some(MemKind::L1sp) => Some(Dest::L1sp),
        Some(MemKind::L2sp) => Some(Dest::L2sp),
        Some(MemKind::Dram) => Some(Dest::Dram),
        None => None,
    }
}

bitflags! {
    /// Remote-PXN trace selection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TraceFlags: u32 {
        const REMOTE_PXN_LOAD = 1 << 0;
        const REMOTE_PXN_STORE = 1 << 1;
        const REMOTE_PXN_ATOMIC = 1 << 2;
        const REMOTE_PXN_MEMORY = Self::REMOTE_PXN_LOAD.bits()
            | Self::REMOTE_PXN_STORE.bits()
            | Self::REMOTE_PXN_ATOMIC.bits();
    }
}

impl TraceFlags {
    pub fn covers(self, access: Access) -> bool {
        match access {
            Access::Load => self.contains(TraceFlags::REMOTE_PXN_LOAD),
            Access::Store => self.contains(TraceFlags::REMOTE_PXN_STORE),
            Access::Atomic => self.contains(TraceFlags::REMOTE_PXN_ATOMIC),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct MemCounters {
    counts: [[u64; 4]; 3], // [access][dest]
    pub stall_cycles_when_ready: u64,
    pub tag_cycles: HashMap<u64, u64>,
}

impl MemCounters {
    fn bump(&mut self, access: Access, dest: Dest) {
        self.counts[access as usize][dest as usize] += 1;
    }

    pub fn get(&self, access: Access, dest: Dest) -> u64 {
        self.counts[access as usize][dest as usize]
    }

    fn rows(&self) -> impl Iterator<Item = (String, u64)> + '_ {
        let accesses = [Access::Load, Access::Store, Access::Atomic];
        let dests = [Dest::L1sp, Dest::L2sp, Dest::Dram, Dest::RemotePxn];
        accesses
            .into_iter()
            .flat_map(move |a| {
                dests.into_iter().map(move |d| {
                    (format!("{}_{}", a.name(), d.name()), self.get(a, d))
                })
            })
            .chain(std::iter::once((
                "stall_cycles_when_ready".to_string(),
                self.stall_cycles_when_ready,
            )))
    }
}

/// Counters for one hardware thread.
#[derive(Debug, Default, Clone)]
pub struct ThreadStats {
    pub total: MemCounters,
    pub by_stage: [MemCounters; Stage::COUNT],
}

impl ThreadStats {
    pub fn record(&mut self, stage: Stage, access: Access, dest: Dest) {
        self.total.bump(access, dest);
        self.by_stage[stage as usize].bump(access, dest);
    }

    pub fn stalled_when_ready(&mut self, stage: Stage) {
        self.total.stall_cycles_when_ready += 1;
        self.by_stage[stage as usize].stall_cycles_when_ready += 1;
    }

    /// Attribute `n` cycles to the thread's current tag.
    pub fn tag_cycles(&mut self, stage: Stage, tag: u64, n: u64) {
        *self.total.tag_cycles.entry(tag).or_default() += n;
        *self.by_stage[stage as usize].tag_cycles.entry(tag).or_default() += n;
    }
}

/// Per-core cycle accounting plus the per-thread tables.
#[derive(Debug, Default, Clone)]
pub struct CoreStats {
    pub threads: Vec<ThreadStats>,
    pub busy_cycles: u64,
    pub stall_cycles: u64,
    pub busy_by_stage: [u64; Stage::COUNT],
    pub stall_by_stage: [u64; Stage::COUNT],
}

impl CoreStats {
    pub fn new(threads: usize) -> Self {
        Self { threads: vec![ThreadStats::default(); threads], ..Self::default() }
    }

    pub fn busy(&mut self, stage: Stage, cycles: u64) {
        self.busy_cycles += cycles;
        self.busy_by_stage[stage as usize] += cycles;
    }

    pub fn stall(&mut self, stage: Stage, cycles: u64) {
        self.stall_cycles += cycles;
        self.stall_by_stage[stage as usize] += cycles;
    }
}

/// CSV sink for tag rows and counter snapshots.
pub struct StatsWriter {
    tags: BufWriter<File>,
    stats_path: PathBuf,
    dump_count: u64,
}

impl StatsWriter {
    pub fn new(dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let mut tags = BufWriter::new(File::create(dir.join("tags.csv"))?);
        writeln!(tags, "SimTime,TagName")?;
        Ok(Self { tags, stats_path: dir.join("stats.csv"), dump_count: 0 })
    }

    /// Record one `output_statistics(tag)` call and snapshot all counters.
    pub fn output<'a>(
        &mut self,
        now: Time,
        tag: &str,
        cores: impl Iterator<Item = (String, &'a CoreStats)>,
    ) -> io::Result<()> {
        writeln!(self.tags, "{now},{tag}")?;
        self.tags.flush()?;
        self.snapshot(now, cores)
    }

    /// Final counter snapshot at end of simulation; no tag row.
    pub fn finish<'a>(
        &mut self,
        now: Time,
        cores: impl Iterator<Item = (String, &'a CoreStats)>,
    ) -> io::Result<()> {
        self.snapshot(now, cores)
    }

    fn snapshot<'a>(
        &mut self,
        now: Time,
        cores: impl Iterator<Item = (String, &'a CoreStats)>,
    ) -> io::Result<()> {
        let fresh = self.dump_count == 0;
        let mut out = BufWriter::new(if fresh {
            File::create(&self.stats_path)?
        } else {
            File::options().append(true).open(&self.stats_path)?
        });
        if fresh {
            writeln!(out, "Dump,SimTime,Core,Thread,Stage,Counter,Value")?;
        }
        let dump = self.dump_count;
        self.dump_count += 1;
        for (core, stats) in cores {
            writeln!(out, "{dump},{now},{core},,,busy_cycles,{}", stats.busy_cycles)?;
            writeln!(out, "{dump},{now},{core},,,stall_cycles,{}", stats.stall_cycles)?;
            for (tid, ts) in stats.threads.iter().enumerate() {
                for (counter, value) in ts.total.rows() {
                    writeln!(out, "{dump},{now},{core},{tid},total,{counter},{value}")?;
                }
                for stage in [Stage::Init, Stage::ExecComp, Stage::ExecComm, Stage::Other] {
                    for (counter, value) in ts.by_stage[stage as usize].rows() {
                        if value != 0 {
                            writeln!(
                                out,
                                "{dump},{now},{core},{tid},{},{counter},{value}",
                                stage.name()
                            )?;
                        }
                    }
                }
            }
        }
        out.flush()?;
        debug!("statistics dump {dump} written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_is_relative_to_the_issuer() {
        let l2 = PAddr::L2sp { pxn: 0, pod: 0, offset: 0 };
        assert_eq!(classify(l2, 0), Some(Dest::L2sp));
        assert_eq!(classify(l2, 1), Some(Dest::RemotePxn));
        let ctrl = PAddr::Ctrl { pxn: 0, pod: 0, core_y: 0, core_x: 0, offset: 0 };
        assert_eq!(classify(ctrl, 0), None);
    }

    #[test]
    fn stage_buckets_are_independent() {
        let mut ts = ThreadStats::default();
        ts.record(Stage::ExecComp, Access::Load, Dest::Dram);
        ts.record(Stage::ExecComm, Access::Load, Dest::Dram);
        assert_eq!(ts.total.get(Access::Load, Dest::Dram), 2);
        assert_eq!(ts.by_stage[Stage::ExecComp as usize].get(Access::Load, Dest::Dram), 1);
        assert_eq!(ts.by_stage[Stage::ExecComm as usize].get(Access::Load, Dest::Dram), 1);
    }

    #[test]
    fn writer_emits_the_tag_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = StatsWriter::new(dir.path()).unwrap();
        let stats = CoreStats::new(1);
        w.output(12345, "checkpoint", std::iter::once(("0.0.0".to_string(), &stats))).unwrap();
        let tags = std::fs::read_to_string(dir.path().join("tags.csv")).unwrap();
        assert!(tags.starts_with("SimTime,TagName\n"));
        assert!(tags.contains("12345,checkpoint"));
        assert!(dir.path().join("stats.csv").exists());
    }
}
