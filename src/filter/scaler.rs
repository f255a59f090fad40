use ac_ffmpeg::codec::video::scaler::{Algorithm, VideoFrameScaler};
use ac_ffmpeg::codec::video::{PixelFormat, VideoFrame};
use log::info;

use crate::pipeline::{StageError, Transform};

#[derive(Clone, Copy, PartialEq)]
struct Geometry {
    format: PixelFormat,
    width: usize,
    height: usize,
}

/// Converts decoded frames to one pixel format and (optionally) one size.
///
/// The scaler context is built from the first frame and rebuilt whenever
/// the input geometry changes mid-stream. Frames that already match the
/// target are forwarded untouched.
pub struct ScaleFilter {
    target_format: PixelFormat,
    target_format_name: String,
    target_size: Option<(usize, usize)>,
    scaler: Option<(Geometry, VideoFrameScaler)>,
    rebuilds: u32,
}

unsafe impl Send for ScaleFilter {}

impl ScaleFilter {
    pub fn new(pixel_format: &str, size: Option<(usize, usize)>) -> Result<Self, StageError> {
        let target_format = pixel_format
            .parse::<PixelFormat>()
            .map_err(|_| StageError::fatal(format!("unknown pixel format '{}'", pixel_format)))?;

        Ok(Self {
            target_format,
            target_format_name: pixel_format.to_string(),
            target_size: size.map(|(w, h)| (even(w), even(h))),
            scaler: None,
            rebuilds: 0,
        })
    }

    /// How many times the scaler had to be (re)built
    pub fn rebuilds(&self) -> u32 {
        self.rebuilds
    }

    fn target_for(&self, source: Geometry) -> Geometry {
        let (width, height) = self
            .target_size
            .unwrap_or((even(source.width), even(source.height)));
        Geometry {
            format: self.target_format,
            width,
            height,
        }
    }

    fn scaler_for(&mut self, source: Geometry) -> Result<&mut VideoFrameScaler, StageError> {
        let current = matches!(&self.scaler, Some((from, _)) if *from == source);
        if !current {
            let target = self.target_for(source);
            let scaler = VideoFrameScaler::builder()
                .source_pixel_format(source.format)
                .source_width(source.width)
                .source_height(source.height)
                .target_pixel_format(target.format)
                .target_width(target.width)
                .target_height(target.height)
                .algorithm(Algorithm::Bicubic)
                .build()?;

            self.rebuilds += 1;
            info!(
                "ScaleFilter: {}x{} -> {}x{} {}",
                source.width, source.height, target.width, target.height, self.target_format_name
            );
            self.scaler = Some((source, scaler));
        }

        match &mut self.scaler {
            Some((_, scaler)) => Ok(scaler),
            None => Err(StageError::fatal("scaler missing after build")),
        }
    }
}

impl Transform for ScaleFilter {
    type Input = VideoFrame;
    type Output = VideoFrame;

    fn process(&mut self, frame: VideoFrame, out: &mut Vec<VideoFrame>) -> Result<(), StageError> {
        let source = Geometry {
            format: frame.pixel_format(),
            width: frame.width(),
            height: frame.height(),
        };

        if self.target_for(source) == source {
            out.push(frame);
            return Ok(());
        }

        let scaled = self
            .scaler_for(source)?
            .scale(&frame)
            .map_err(|e| StageError::transient(format!("scale failed: {}", e)))?;
        out.push(scaled);
        Ok(())
    }
}

/// Planar 4:2:0 formats need even dimensions
fn even(value: usize) -> usize {
    if value.is_multiple_of(2) {
        value
    } else {
        value + 1
    }
}
