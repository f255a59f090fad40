use ac_ffmpeg::codec::video::VideoFrame;
use ac_ffmpeg::format::io::IO;
use ac_ffmpeg::format::muxer::{Muxer, OutputFormat};
use log::{debug, info};
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::encoder::{EncoderSettings, FfmpegEncoder};
use crate::pipeline::{Sink, StageError};

/// Encoder and muxer opened for the first frame's geometry
struct Session {
    encoder: FfmpegEncoder,
    muxer: Muxer<File>,
    packets: u64,
}

impl Session {
    /// Move every packet the encoder has ready into the container
    fn drain(&mut self) -> Result<(), StageError> {
        while let Some(packet) = self.encoder.take()? {
            self.muxer.push(packet.with_stream_index(0))?;
            self.packets += 1;
        }
        Ok(())
    }
}

/// Re-encodes frames and writes them into a container.
///
/// The container format is guessed from the output file name (`.mkv`,
/// `.mp4`, `.ts`, ...). Nothing is opened until the first frame arrives,
/// since the encoder has to be sized from it.
pub struct MuxSink {
    path: PathBuf,
    frame_rate: u32,
    codec: Option<String>,
    session: Option<Session>,
}

unsafe impl Send for MuxSink {}

impl MuxSink {
    pub fn new(path: &Path, frame_rate: u32, codec: Option<String>) -> Result<Self, StageError> {
        output_format(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            frame_rate,
            codec,
            session: None,
        })
    }

    fn open(&self, frame: &VideoFrame) -> Result<Session, StageError> {
        let encoder = FfmpegEncoder::new(&EncoderSettings {
            width: frame.width(),
            height: frame.height(),
            pixel_format: frame.pixel_format(),
            frame_rate: self.frame_rate,
            codec: self.codec.clone(),
        })?;

        let mut builder = Muxer::builder();
        builder.add_stream(&encoder.codec_parameters())?;
        let file = File::create(&self.path)?;
        let muxer = builder.build(IO::from_seekable_write_stream(file), output_format(&self.path)?)?;

        info!(
            "MuxSink: writing {} to {}",
            encoder.codec_name,
            self.path.display()
        );
        Ok(Session {
            encoder,
            muxer,
            packets: 0,
        })
    }
}

impl Sink for MuxSink {
    type Unit = VideoFrame;

    fn consume(&mut self, frame: VideoFrame) -> Result<(), StageError> {
        if self.session.is_none() {
            self.session = Some(self.open(&frame)?);
        }
        let Some(session) = self.session.as_mut() else {
            return Err(StageError::fatal("muxer session missing"));
        };

        session.encoder.push(frame)?;
        session.drain()
    }

    fn finish(&mut self) -> Result<(), StageError> {
        let Some(mut session) = self.session.take() else {
            debug!("MuxSink: no frames received, nothing written");
            return Ok(());
        };

        session.encoder.flush()?;
        session.drain()?;
        session.muxer.flush()?;
        let frames = session.encoder.frames();
        let packets = session.packets;
        session.muxer.close()?;

        info!(
            "MuxSink: wrote {} frames ({} packets) to {}",
            frames,
            packets,
            self.path.display()
        );
        Ok(())
    }
}

fn output_format(path: &Path) -> Result<OutputFormat, StageError> {
    let name = path.to_string_lossy();
    OutputFormat::guess_from_file_name(&name)
        .ok_or_else(|| StageError::fatal(format!("cannot guess a container format for '{}'", name)))
}
