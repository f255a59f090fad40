//! Capture module
//!
//! Reads a compressed container or elementary stream (file or stdin) through
//! the FFmpeg demuxer and hands the packets of the selected video stream to
//! the pipeline.

mod demuxer;

pub use demuxer::{DemuxSource, InputSpec};
