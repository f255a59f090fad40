use ac_ffmpeg::codec::video::{PixelFormat, VideoEncoder, VideoFrame};
use ac_ffmpeg::codec::{CodecParameters, Encoder};
use ac_ffmpeg::packet::Packet;
use ac_ffmpeg::time::{TimeBase, Timestamp};
use log::{debug, info};

use crate::pipeline::StageError;

/// Encoder fallback chain: try hardware encoders first, then software.
/// Tuned for file recording: quality over latency.
///
/// - NVENC: p5 preset, high quality tune
/// - QSV: medium preset with look-ahead
/// - AMF: transcoding usage with quality preset
/// - libx264: CRF 20 CPU fallback
/// - mpeg4: last resort, part of every FFmpeg build
const ENCODER_CHAIN: &[(&str, &[(&str, &str)])] = &[
    // NVIDIA NVENC
    (
        "h264_nvenc",
        &[
            ("preset", "p5"),
            ("tune", "hq"),
            ("rc", "vbr"),
            ("cq", "21"),
            ("b", "0"),
            ("g", "250"),
            ("gpu", "0"),
        ],
    ),
    // Intel Quick Sync Video
    (
        "h264_qsv",
        &[
            ("preset", "medium"),
            ("global_quality", "21"),
            ("look_ahead", "1"),
            ("g", "250"),
        ],
    ),
    // AMD AMF
    (
        "h264_amf",
        &[
            ("usage", "transcoding"),
            ("quality", "quality"),
            ("rc", "cqp"),
            ("qp_i", "20"),
            ("qp_p", "22"),
            ("g", "250"),
        ],
    ),
    // libx264 - CPU fallback
    (
        "libx264",
        &[
            ("profile", "high"),
            ("preset", "medium"),
            ("crf", "20"),
            ("keyint", "250"),
            ("threads", "0"),
        ],
    ),
    ("mpeg4", &[("q", "3"), ("g", "250")]),
];

/// Geometry and timing of the stream an encoder is opened for
#[derive(Clone)]
pub struct EncoderSettings {
    pub width: usize,
    pub height: usize,
    pub pixel_format: PixelFormat,
    pub frame_rate: u32,
    /// Use exactly this encoder instead of walking the fallback chain
    pub codec: Option<String>,
}

/// Frame-by-frame video encoder with an internal frame counter.
///
/// Incoming frames are restamped at `1 / frame_rate` so the output timing
/// does not depend on whatever timestamps the source carried.
pub struct FfmpegEncoder {
    encoder: VideoEncoder,
    time_base: TimeBase,
    frame_count: i64,
    width: usize,
    height: usize,
    pub codec_name: String,
}

unsafe impl Send for FfmpegEncoder {}

impl FfmpegEncoder {
    pub fn new(settings: &EncoderSettings) -> Result<Self, StageError> {
        let time_base = TimeBase::new(1, settings.frame_rate.max(1) as i32);

        let (encoder, codec_name) = match settings.codec.as_deref() {
            Some(codec) => {
                let encoder = Self::build_encoder(codec, &[], settings, time_base)?;
                (encoder, codec.to_string())
            }
            None => Self::try_create_encoder(settings, time_base)?,
        };
        info!(
            "Using encoder: {} ({}x{} @ {} fps)",
            codec_name, settings.width, settings.height, settings.frame_rate
        );

        Ok(Self {
            encoder,
            time_base,
            frame_count: 0,
            width: settings.width,
            height: settings.height,
            codec_name,
        })
    }

    fn build_encoder(
        codec: &str,
        options: &[(&str, &str)],
        settings: &EncoderSettings,
        time_base: TimeBase,
    ) -> Result<VideoEncoder, ac_ffmpeg::Error> {
        let mut builder = VideoEncoder::builder(codec)?
            .pixel_format(settings.pixel_format)
            .width(settings.width)
            .height(settings.height)
            .time_base(time_base);
        for (k, v) in options {
            builder = builder.set_option(k, v);
        }
        builder.build()
    }

    fn try_create_encoder(
        settings: &EncoderSettings,
        time_base: TimeBase,
    ) -> Result<(VideoEncoder, String), StageError> {
        for (codec, options) in ENCODER_CHAIN {
            match Self::build_encoder(codec, options, settings, time_base) {
                Ok(enc) => return Ok((enc, codec.to_string())),
                Err(e) => {
                    debug!("Encoder {} not available, skipping: {}", codec, e);
                    continue;
                }
            }
        }
        Err(StageError::fatal(
            "no video encoder available; install FFmpeg with at least libx264 support",
        ))
    }

    /// Parameters for the muxer stream fed by this encoder
    pub fn codec_parameters(&self) -> CodecParameters {
        self.encoder.codec_parameters().into()
    }

    pub fn frames(&self) -> i64 {
        self.frame_count
    }

    /// Submit one frame; a geometry change mid-stream skips the frame
    pub fn push(&mut self, frame: VideoFrame) -> Result<(), StageError> {
        if frame.width() != self.width || frame.height() != self.height {
            return Err(StageError::transient(format!(
                "frame is {}x{}, encoder was opened for {}x{}",
                frame.width(),
                frame.height(),
                self.width,
                self.height
            )));
        }

        let frame = frame.with_pts(Timestamp::new(self.frame_count, self.time_base));
        self.frame_count += 1;
        self.encoder.push(frame)?;
        Ok(())
    }

    /// Take the next encoded packet, if one is ready
    pub fn take(&mut self) -> Result<Option<Packet>, StageError> {
        Ok(self.encoder.take()?)
    }

    /// Signal end of input; buffered packets become available through `take`
    pub fn flush(&mut self) -> Result<(), StageError> {
        self.encoder.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_ends_with_software_encoders() {
        let names: Vec<&str> = ENCODER_CHAIN.iter().map(|(name, _)| *name).collect();
        assert_eq!(names.last(), Some(&"mpeg4"));
        assert!(names.contains(&"libx264"));
        let software = names.iter().position(|n| *n == "libx264").unwrap();
        let hardware = names.iter().position(|n| *n == "h264_nvenc").unwrap();
        assert!(hardware < software);
    }

    #[test]
    fn test_forced_unknown_encoder_fails() {
        let settings = EncoderSettings {
            width: 64,
            height: 64,
            pixel_format: ac_ffmpeg::codec::video::frame::get_pixel_format("yuv420p"),
            frame_rate: 25,
            codec: Some("no-such-encoder".to_string()),
        };
        let err = FfmpegEncoder::new(&settings).err().unwrap();
        assert!(!err.is_transient());
    }
}
