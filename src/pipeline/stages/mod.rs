//! Stage bodies for the pipeline threads
//!
//! Every stage follows the same discipline: loop on its input until it ends,
//! then terminate every queue it is the sole producer of. That single rule
//! is what carries end-of-stream, stop requests and failures downstream.
//!
//! ```text
//! Capture → [q] → Decode → [q] → Filter → [q] → Sink
//! ```

mod capture_stage;
mod sink_stage;
mod transform_stage;

pub(crate) use capture_stage::run_capture;
pub(crate) use sink_stage::run_sink;
pub(crate) use transform_stage::run_transform;

use std::sync::Arc;

use super::coordinator::Control;
use super::health::StageHealth;

/// Transient failures tolerated in a row before a stage gives up
pub const MAX_CONSECUTIVE_FAILURES: u32 = 10;

/// How a stage thread ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageExit {
    /// Input ended (end of stream or stop request) and was fully handled
    Completed,
    /// A collaborator reported a stage-fatal error
    Failed,
    /// The stage thread panicked
    Panicked,
}

impl std::fmt::Display for StageExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageExit::Completed => write!(f, "completed"),
            StageExit::Failed => write!(f, "failed"),
            StageExit::Panicked => write!(f, "panicked"),
        }
    }
}

/// What a stage thread can see of the pipeline it belongs to
pub(crate) struct StageContext {
    name: &'static str,
    control: Arc<Control>,
    health: Arc<StageHealth>,
}

impl StageContext {
    pub(crate) fn new(name: &'static str, control: Arc<Control>, health: Arc<StageHealth>) -> Self {
        Self {
            name,
            control,
            health,
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn health(&self) -> &StageHealth {
        &self.health
    }

    pub(crate) fn is_running(&self) -> bool {
        self.control.is_running()
    }

    /// The source is done: clear the run flag and start the cascade
    pub(crate) fn source_finished(&self) {
        self.control.begin_cascade();
    }

    /// Report a stage-fatal failure to the orchestrator
    pub(crate) fn fail(&self) {
        self.control.fail(self.name);
    }
}

/// Tracks the run of transient failures a stage has seen
#[derive(Debug, Default)]
pub(crate) struct FailureStreak {
    consecutive: u32,
}

impl FailureStreak {
    pub(crate) fn reset(&mut self) {
        self.consecutive = 0;
    }

    /// Count one more failure; `true` once the streak hits the limit
    pub(crate) fn bump(&mut self) -> bool {
        self.consecutive += 1;
        self.consecutive >= MAX_CONSECUTIVE_FAILURES
    }

    pub(crate) fn count(&self) -> u32 {
        self.consecutive
    }
}
