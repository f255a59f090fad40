//! Error types shared by the stages and the orchestrator

use thiserror::Error;

use super::state::PipelineState;

/// Failure reported by a collaborator while a stage handles one unit
#[derive(Debug, Error)]
pub enum StageError {
    /// This unit could not be handled; the stage drops it and moves on
    #[error("unit skipped: {0}")]
    Transient(String),
    #[error("ffmpeg: {0}")]
    Ffmpeg(#[from] ac_ffmpeg::Error),
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// The stage cannot continue
    #[error("{0}")]
    Fatal(String),
}

impl StageError {
    pub fn transient(msg: impl Into<String>) -> Self {
        StageError::Transient(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        StageError::Fatal(msg.into())
    }

    /// Transient failures skip a single unit; everything else ends the stage
    pub fn is_transient(&self) -> bool {
        matches!(self, StageError::Transient(_))
    }
}

/// Misuse of the orchestrator lifecycle or failure to bring it up
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid pipeline transition from {from} to {to}")]
    InvalidTransition {
        from: PipelineState,
        to: &'static str,
    },
    #[error("failed to spawn thread for stage '{stage}': {source}")]
    Spawn {
        stage: &'static str,
        #[source]
        source: std::io::Error,
    },
}
