use ac_ffmpeg::format::demuxer::{Demuxer, DemuxerWithStreamInfo, InputFormat};
use ac_ffmpeg::format::io::IO;
use ac_ffmpeg::format::stream::Stream;
use ac_ffmpeg::packet::Packet;
use log::{debug, info};
use std::fs::File;
use std::io::{BufReader, Read};

use crate::pipeline::{CaptureSource, StageError};

type Reader = Box<dyn Read + Send>;

/// Where to read from and how to interpret it
#[derive(Debug, Clone, Default)]
pub struct InputSpec {
    /// File path, or `-` for stdin
    pub input: String,
    /// FFmpeg demuxer short name; probed from the data when unset
    pub format: Option<String>,
    /// Demuxer private options, e.g. `video_size=640x480` for raw input
    pub options: Vec<(String, String)>,
}

impl InputSpec {
    pub fn is_stdin(&self) -> bool {
        self.input == "-"
    }
}

/// Demuxer collaborator for the capture stage.
///
/// Yields every packet of the container; [`CaptureSource::wants`] keeps the
/// ones belonging to the first video stream.
pub struct DemuxSource {
    demuxer: DemuxerWithStreamInfo<Reader>,
    stream_index: usize,
}

unsafe impl Send for DemuxSource {}

impl DemuxSource {
    /// Open the input and probe its streams. Any failure here is fatal.
    pub fn open(spec: &InputSpec) -> Result<Self, StageError> {
        let input_format = match spec.format.as_deref() {
            Some(name) => Some(
                InputFormat::find_by_name(name)
                    .ok_or_else(|| StageError::fatal(format!("unknown input format '{}'", name)))?,
            ),
            None => None,
        };

        let reader: Reader = if spec.is_stdin() {
            Box::new(std::io::stdin())
        } else {
            Box::new(BufReader::new(File::open(&spec.input)?))
        };

        let mut builder = Demuxer::builder().input_format(input_format);
        for (key, value) in &spec.options {
            debug!("Demuxer: option {}={}", key, value);
            builder = builder.set_option(key, value);
        }

        let demuxer = builder
            .build(IO::from_read_stream(reader))?
            .find_stream_info(None)
            .map_err(|(_, e)| e)?;

        let stream_index = demuxer
            .streams()
            .iter()
            .position(|stream| stream.codec_parameters().is_video_codec())
            .ok_or_else(|| StageError::fatal(format!("no video stream in '{}'", spec.input)))?;

        info!(
            "Demuxer: opened '{}' ({} streams, video stream #{})",
            spec.input,
            demuxer.streams().len(),
            stream_index
        );

        Ok(Self {
            demuxer,
            stream_index,
        })
    }

    /// The stream of interest, used to configure the decoder
    pub fn video_stream(&self) -> &Stream {
        &self.demuxer.streams()[self.stream_index]
    }

    pub fn stream_index(&self) -> usize {
        self.stream_index
    }
}

impl CaptureSource for DemuxSource {
    type Unit = Packet;

    fn read_unit(&mut self) -> Result<Option<Packet>, StageError> {
        Ok(self.demuxer.take()?)
    }

    fn wants(&self, packet: &Packet) -> bool {
        packet.stream_index() == self.stream_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_fatal() {
        let spec = InputSpec {
            input: "/nonexistent/recast-input.ts".to_string(),
            ..Default::default()
        };
        let err = DemuxSource::open(&spec).err().unwrap();
        assert!(!err.is_transient());
        assert!(matches!(err, StageError::Io(_)));
    }

    #[test]
    fn test_unknown_format_is_fatal() {
        let spec = InputSpec {
            input: "-".to_string(),
            format: Some("no-such-demuxer".to_string()),
            options: Vec::new(),
        };
        assert!(spec.is_stdin());
        let err = DemuxSource::open(&spec).err().unwrap();
        assert!(matches!(err, StageError::Fatal(_)));
    }
}
