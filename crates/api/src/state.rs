//! Thread suspension states.
//!
//! A thread gives up the core by publishing one of these variants; the
//! scheduler dispatches it (to the memory subsystem, the nop timer, or
//! synchronously for stage changes) and the thread stays blocked until the
//! completion flag flips. `Running` and `Terminated` are the two states with
//! nothing outstanding: a freshly resumable thread and a finished one.

use int_enum::IntEnum;

use crate::rmw::AtomicOp;

/// Application-declared execution phase, used to bucket statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntEnum, Default)]
#[repr(u8)]
pub enum Stage {
    Init = 0,
    ExecComp = 1,
    ExecComm = 2,
    #[default]
    Other = 3,
}

impl Stage {
    pub const COUNT: usize = 4;

    pub const fn name(self) -> &'static str {
        match self {
            Stage::Init => "init",
            Stage::ExecComp => "exec_comp",
            Stage::ExecComm => "exec_comm",
            Stage::Other => "other",
        }
    }
}

/// A host pointer into a controller's backing store, together with the
/// number of valid bytes before the interleave stripe (or the store) ends.
///
/// This is the escape hatch for clients that must bulk-memcpy. The pointer
/// aliases memory the simulation also writes through its own access paths,
/// so it is only sound to use while the owning controller is quiescent.
#[derive(Debug, Clone, Copy)]
pub struct NativeRegion {
    pub ptr: *mut u8,
    pub len: usize,
}

/// What a suspended hart is waiting on. Addresses are virtual; the core
/// translates against its own site when it dispatches the request.
#[derive(Debug)]
pub enum ThreadState {
    Running,
    Terminated,
    Nop {
        cycles: u64,
        done: bool,
    },
    MemRead {
        addr: u64,
        size: usize,
        result: Option<Vec<u8>>,
        done: bool,
    },
    MemWrite {
        addr: u64,
        payload: Vec<u8>,
        done: bool,
    },
    MemAtomic {
        addr: u64,
        size: usize,
        op: AtomicOp,
        wdata: Vec<u8>,
        ext: Option<Vec<u8>>,
        result: Option<Vec<u8>>,
        done: bool,
    },
    SetStage {
        stage: Stage,
        done: bool,
    },
    ToNative {
        addr: u64,
        region: Option<NativeRegion>,
        done: bool,
    },
}

impl ThreadState {
    /// Block on a load of `size` bytes.
    pub fn read(addr: u64, size: usize) -> Self {
        ThreadState::MemRead { addr, size, result: None, done: false }
    }

    /// Block on a store of `payload`.
    pub fn write(addr: u64, payload: Vec<u8>) -> Self {
        ThreadState::MemWrite { addr, payload, done: false }
    }

    /// Block on an atomic RMW; the access width is the operand's length.
    pub fn atomic(addr: u64, op: AtomicOp, wdata: Vec<u8>, ext: Option<Vec<u8>>) -> Self {
        let size = wdata.len();
        ThreadState::MemAtomic { addr, size, op, wdata, ext, result: None, done: false }
    }

    /// Burn a fixed number of cycles.
    pub fn nop(cycles: u64) -> Self {
        ThreadState::Nop { cycles, done: false }
    }

    /// Declare the statistics stage for the cycles that follow.
    pub fn set_stage(stage: Stage) -> Self {
        ThreadState::SetStage { stage, done: false }
    }

    /// Ask for the host view of a location (see [`NativeRegion`]).
    pub fn to_native(addr: u64) -> Self {
        ThreadState::ToNative { addr, region: None, done: false }
    }

    /// A thread is ready iff its state has nothing outstanding. Terminated
    /// threads are never resumable.
    pub fn can_resume(&self) -> bool {
        match self {
            ThreadState::Running => true,
            ThreadState::Terminated => false,
            ThreadState::Nop { done, .. }
            | ThreadState::MemRead { done, .. }
            | ThreadState::MemWrite { done, .. }
            | ThreadState::MemAtomic { done, .. }
            | ThreadState::SetStage { done, .. }
            | ThreadState::ToNative { done, .. } => *done,
        }
    }

    /// Flip the completion flag. No-op for states without one.
    pub fn complete(&mut self) {
        match self {
            ThreadState::Running | ThreadState::Terminated => {}
            ThreadState::Nop { done, .. }
            | ThreadState::MemRead { done, .. }
            | ThreadState::MemWrite { done, .. }
            | ThreadState::MemAtomic { done, .. }
            | ThreadState::SetStage { done, .. }
            | ThreadState::ToNative { done, .. } => *done = true,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            ThreadState::Running => "running",
            ThreadState::Terminated => "terminated",
            ThreadState::Nop { .. } => "nop",
            ThreadState::MemRead { .. } => "mem_read",
            ThreadState::MemWrite { .. } => "mem_write",
            ThreadState::MemAtomic { .. } => "mem_atomic",
            ThreadState::SetStage { .. } => "set_stage",
            ThreadState::ToNative { .. } => "to_native",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readiness_follows_the_completion_flag() {
        let mut st = ThreadState::MemRead { addr: 0, size: 8, result: None, done: false };
        assert!(!st.can_resume());
        st.complete();
        assert!(st.can_resume());

        assert!(ThreadState::Running.can_resume());
        assert!(!ThreadState::Terminated.can_resume());

        let mut term = ThreadState::Terminated;
        term.complete();
        assert!(!term.can_resume());
    }
}
