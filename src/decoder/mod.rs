//! Video decoding module
//!
//! Provides compressed video decoding via FFmpeg.

mod ffmpeg;

pub use ffmpeg::FfmpegDecoder;
