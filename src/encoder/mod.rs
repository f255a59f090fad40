//! Video encoding module
//!
//! Used by the container sink to re-encode decoded frames.

mod ffmpeg;

pub use ffmpeg::{EncoderSettings, FfmpegEncoder};
