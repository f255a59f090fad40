use ac_ffmpeg::codec::Decoder;
use ac_ffmpeg::codec::video::{VideoDecoder, VideoFrame};
use ac_ffmpeg::format::stream::Stream;
use ac_ffmpeg::packet::Packet;

use crate::pipeline::{StageError, Transform};

/// Video decoder using FFmpeg.
///
/// Configured from the demuxed stream's codec parameters, so any codec the
/// FFmpeg build supports is accepted. A single packet may produce zero, one
/// or several frames; frames still buffered at end of stream come out of
/// [`Transform::flush`].
pub struct FfmpegDecoder {
    decoder: VideoDecoder,
    packet_count: u64,
}

unsafe impl Send for FfmpegDecoder {}

impl FfmpegDecoder {
    pub fn from_stream(stream: &Stream) -> Result<Self, StageError> {
        let decoder = VideoDecoder::from_stream(stream)?.build()?;

        Ok(Self {
            decoder,
            packet_count: 0,
        })
    }

    /// Move every frame the decoder has ready into `out`
    fn drain(&mut self, out: &mut Vec<VideoFrame>) -> Result<(), StageError> {
        loop {
            match self.decoder.take() {
                Ok(Some(frame)) => out.push(frame),
                Ok(None) => return Ok(()),
                Err(e) => {
                    return Err(StageError::transient(format!(
                        "decode error after packet {}: {}",
                        self.packet_count, e
                    )));
                }
            }
        }
    }
}

impl Transform for FfmpegDecoder {
    type Input = Packet;
    type Output = VideoFrame;

    fn process(&mut self, packet: Packet, out: &mut Vec<VideoFrame>) -> Result<(), StageError> {
        self.packet_count += 1;

        // The decoder was drained before this push, so any error here is a
        // hard failure rather than a full input buffer
        let count = self.packet_count;
        self.decoder
            .push(packet)
            .map_err(|e| StageError::fatal(format!("failed to push packet {}: {}", count, e)))?;
        self.drain(out)
    }

    fn flush(&mut self, out: &mut Vec<VideoFrame>) -> Result<(), StageError> {
        self.decoder.flush()?;
        self.drain(out)
    }
}
