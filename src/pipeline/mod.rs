//! Pipeline abstraction layer for recast
//!
//! This module provides the threaded media pipeline, separating concerns
//! between:
//! - Control/Coordination: run flag, lifecycle state machine, shutdown
//! - Data Transport: blocking hand-off queues between stages
//! - Media Processing: collaborator traits for capture, decode, filter, sink
//!
//! # Architecture
//!
//! The pipeline is organized into four stages that communicate via queues:
//! - Each stage runs on its own OS thread
//! - Stages reach the media libraries through the `CaptureSource`,
//!   `Transform` and `Sink` traits
//! - The coordinator chains stages together and manages lifecycle
//! - Shutdown cascades: a stage whose input ends terminates its output
//! - Health monitoring tracks per-stage counters

pub mod coordinator;
pub mod error;
pub mod health;
pub mod queue;
pub mod stage;
pub mod stages;
pub mod state;
pub mod sync;
pub mod types;

pub use coordinator::{
    Outcome, Pipeline, PipelineBuilder, PipelineHandle, ShutdownReport, StageReport, Topology,
};
pub use error::{PipelineError, StageError};
pub use health::PipelineHealth;
pub use queue::StageQueue;
pub use stage::{CaptureSource, Passthrough, Sink, Transform};
pub use stages::StageExit;
pub use state::{PipelineState, RunState};
pub use types::MediaUnit;
