//! Threads of the native front-end and the workload-facing surface.

use pando_api::{NativeRegion, Site, Stage, SysConfig, ThreadState};

/// What a thread observes when it is resumed: the completion of whatever it
/// last yielded. `Start` is the very first resume after simulation setup.
#[derive(Debug)]
pub enum Resume {
    Start,
    /// The previous write, nop or stage change finished.
    Done,
    /// Read or atomic payload.
    Data(Vec<u8>),
    /// Translate-to-native answer.
    Native(NativeRegion),
}

/// Read-mostly view a program gets while it runs. `tag` may be reassigned
/// by the program to attribute subsequent cycles; `output_statistics`
/// requests a global statistics dump once the current operation retires.
pub struct ThreadContext<'a> {
    pub tid: usize,
    pub site: Site,
    pub cycle: u64,
    pub stage: Stage,
    pub tag: u64,
    pub config: &'a SysConfig,
    pub(crate) dump_request: Option<String>,
}

impl ThreadContext<'_> {
    pub fn output_statistics(&mut self, tag: &str) {
        self.dump_request = Some(tag.to_string());
    }
}

/// A native workload. Each `resume` runs until the next suspension point
/// and answers with the state the thread blocks on; the scheduler resumes
/// it again once that state completes, handing back the result.
pub trait Program {
    fn resume(&mut self, resume: Resume, ctx: &mut ThreadContext<'_>) -> ThreadState;
}

pub struct Thread {
    pub(crate) program: Box<dyn Program>,
    pub(crate) state: ThreadState,
    pub(crate) stage: Stage,
    pub(crate) tag: u64,
    pub(crate) token: u32,
    started: bool,
}

impl Thread {
    pub fn new(program: Box<dyn Program>) -> Self {
        Self {
            program,
            state: ThreadState::Running,
            stage: Stage::Other,
            tag: 0,
            token: 0,
            started: false,
        }
    }

    pub fn state(&self) -> &ThreadState {
        &self.state
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Run the program for one operation. The completed state is consumed
    /// into a [`Resume`] payload; the program's answer becomes the new
    /// outstanding state. Returns a statistics dump request, if the program
    /// made one.
    pub fn resume(
        &mut self,
        tid: usize,
        site: Site,
        config: &SysConfig,
        cycle: u64,
    ) -> Option<String> {
        debug_assert!(self.state.can_resume());
        let prev = std::mem::replace(&mut self.state, ThreadState::Running);
        let resume = match prev {
            ThreadState::Running if !self.started => Resume::Start,
            ThreadState::Running
            | ThreadState::Nop { .. }
            | ThreadState::MemWrite { .. }
            | ThreadState::SetStage { .. } => Resume::Done,
            ThreadState::MemRead { result, .. } | ThreadState::MemAtomic { result, .. } => {
                Resume::Data(result.unwrap_or_default())
            }
            ThreadState::ToNative { region, .. } => match region {
                Some(r) => Resume::Native(r),
                None => Resume::Done,
            },
            ThreadState::Terminated => return None,
        };
        self.started = true;

        let mut ctx = ThreadContext {
            tid,
            site,
            cycle,
            stage: self.stage,
            tag: self.tag,
            config,
            dump_request: None,
        };
        self.state = self.program.resume(resume, &mut ctx);
        self.tag = ctx.tag;
        ctx.dump_request
    }
}
