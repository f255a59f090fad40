//! Video filtering module
//!
//! Pixel-format conversion and resizing between the decoder and the sink.

mod scaler;

pub use scaler::ScaleFilter;
