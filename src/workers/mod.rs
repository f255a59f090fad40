//! Background worker tasks
//!
//! This module contains the long-running recording session that owns the
//! pipeline threads for the lifetime of the process.

pub mod recorder;

pub use recorder::Recorder;
