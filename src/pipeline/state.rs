//! Pipeline state management

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Shared run flag observed by every stage
///
/// Set once at start and cleared exactly once, by a stop request or by the
/// first stage that discovers a fatal condition. Clearing the flag on its own
/// wakes nobody: whoever clears it also terminates the head queue.
#[derive(Debug, Clone, Default)]
pub struct RunState {
    running: Arc<AtomicBool>,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Clear the flag; returns `true` only for the call that actually cleared it
    pub fn stop(&self) -> bool {
        self.running.swap(false, Ordering::SeqCst)
    }
}

/// Pipeline state machine
///
/// ```text
/// Idle → Running → StopRequested → Draining → Stopped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Built but no stage thread has been spawned
    Idle,

    /// Stage threads are processing media
    Running {
        /// When the pipeline started running
        started_at: Instant,
    },

    /// Stop was requested; the head queue is about to be terminated
    StopRequested,

    /// Queues are terminating and stages are emptying their inputs
    Draining,

    /// Every stage thread has been joined
    Stopped,
}

impl PipelineState {
    /// Check if this state transition is valid
    pub fn can_transition_to(&self, target: &PipelineState) -> bool {
        use PipelineState::*;

        match (self, target) {
            // From Idle
            (Idle, Running { .. }) => true,
            (Idle, Stopped) => true, // Stop before start, nothing to drain

            // From Running
            (Running { .. }, StopRequested) => true,
            (Running { .. }, Draining) => true, // A stage started the cascade itself
            (Running { .. }, Stopped) => true,  // Joined after a natural end of stream

            // From StopRequested
            (StopRequested, Draining) => true,
            (StopRequested, Stopped) => true,

            // From Draining
            (Draining, Stopped) => true,

            // From Stopped - no transitions allowed
            (Stopped, _) => false,

            // Self-transitions
            (a, b) if a == b => true,

            // All other transitions invalid
            _ => false,
        }
    }

    /// Get a human-readable description of this state
    pub fn description(&self) -> &'static str {
        match self {
            PipelineState::Idle => "Idle",
            PipelineState::Running { .. } => "Running",
            PipelineState::StopRequested => "StopRequested",
            PipelineState::Draining => "Draining",
            PipelineState::Stopped => "Stopped",
        }
    }

    /// Check if stage threads may still be alive
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            PipelineState::Running { .. } | PipelineState::StopRequested | PipelineState::Draining
        )
    }

    pub fn is_running(&self) -> bool {
        matches!(self, PipelineState::Running { .. })
    }

    /// Check if the pipeline is winding down or done
    pub fn is_stopping(&self) -> bool {
        matches!(
            self,
            PipelineState::StopRequested | PipelineState::Draining | PipelineState::Stopped
        )
    }

    /// Get the duration since the pipeline started (if running)
    pub fn running_duration(&self) -> Option<std::time::Duration> {
        if let PipelineState::Running { started_at } = self {
            Some(started_at.elapsed())
        } else {
            None
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}
