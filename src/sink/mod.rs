//! Output sinks
//!
//! - `YuvFileSink`: raw planar dump, one frame after the other
//! - `MuxSink`: re-encode and write a container picked from the file name

mod muxer;
mod yuv_file;

pub use muxer::MuxSink;
pub use yuv_file::YuvFileSink;
