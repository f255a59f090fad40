use ac_ffmpeg::codec::video::{PixelFormat, VideoFrame};
use log::info;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::pipeline::{Sink, StageError};

/// Writes decoded `yuv420p` frames back to back into a raw file.
///
/// Stride padding is stripped: each frame is exactly the Y plane (w*h),
/// then U and V at half resolution, which is what `ffplay -f rawvideo`
/// and friends expect.
pub struct YuvFileSink {
    writer: BufWriter<File>,
    path: PathBuf,
    expected_format: PixelFormat,
    /// Reusable buffer for packed output to avoid per-frame allocation
    packed_buffer: Vec<u8>,
    geometry: Option<(usize, usize)>,
    frames: u64,
    bytes: u64,
}

impl YuvFileSink {
    pub fn create(path: &Path) -> Result<Self, StageError> {
        let writer = BufWriter::new(File::create(path)?);
        let expected_format = "yuv420p"
            .parse::<PixelFormat>()
            .map_err(|_| StageError::fatal("yuv420p missing from this FFmpeg build"))?;

        Ok(Self {
            writer,
            path: path.to_path_buf(),
            expected_format,
            packed_buffer: Vec::new(),
            geometry: None,
            frames: 0,
            bytes: 0,
        })
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }
}

impl Sink for YuvFileSink {
    type Unit = VideoFrame;

    fn consume(&mut self, frame: VideoFrame) -> Result<(), StageError> {
        if frame.pixel_format() != self.expected_format {
            return Err(StageError::fatal(
                "raw dump needs yuv420p frames; enable the filter stage",
            ));
        }

        let (w, h) = (frame.width(), frame.height());
        if self.geometry != Some((w, h)) {
            if let Some((old_w, old_h)) = self.geometry {
                info!(
                    "YuvFileSink: geometry changed {}x{} -> {}x{}",
                    old_w, old_h, w, h
                );
            }
            self.packed_buffer.resize(yuv420_size(w, h), 0);
            self.geometry = Some((w, h));
        }

        let planes = frame.planes();
        let (uw, uh) = chroma_size(w, h);
        pack_yuv420(
            &mut self.packed_buffer,
            Plane {
                data: planes[0].data(),
                stride: planes[0].line_size(),
                width: w,
                height: h,
            },
            Plane {
                data: planes[1].data(),
                stride: planes[1].line_size(),
                width: uw,
                height: uh,
            },
            Plane {
                data: planes[2].data(),
                stride: planes[2].line_size(),
                width: uw,
                height: uh,
            },
        );

        self.writer.write_all(&self.packed_buffer)?;
        self.frames += 1;
        self.bytes += self.packed_buffer.len() as u64;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), StageError> {
        self.writer.flush()?;
        info!(
            "YuvFileSink: wrote {} frames ({} bytes) to {}",
            self.frames,
            self.bytes,
            self.path.display()
        );
        Ok(())
    }
}

fn chroma_size(width: usize, height: usize) -> (usize, usize) {
    (width.div_ceil(2), height.div_ceil(2))
}

fn yuv420_size(width: usize, height: usize) -> usize {
    let (uw, uh) = chroma_size(width, height);
    width * height + uw * uh * 2
}

#[derive(Clone, Copy)]
struct Plane<'a> {
    data: &'a [u8],
    stride: usize,
    width: usize,
    height: usize,
}

fn pack_yuv420(dst: &mut [u8], y: Plane<'_>, u: Plane<'_>, v: Plane<'_>) {
    let y_size = y.width * y.height;
    let u_size = u.width * u.height;
    extract_plane(&mut dst[..y_size], y);
    extract_plane(&mut dst[y_size..y_size + u_size], u);
    extract_plane(&mut dst[y_size + u_size..], v);
}

/// Copy a plane from padded source rows into a contiguous destination.
///
/// - Fast path: no padding, single memcpy
/// - Fallback: row-by-row copy
#[inline]
fn extract_plane(dst: &mut [u8], plane: Plane<'_>) {
    let Plane {
        data: src,
        stride,
        width,
        height,
    } = plane;

    if stride == width && src.len() >= width * height {
        dst.copy_from_slice(&src[..width * height]);
        return;
    }

    for r in 0..height {
        let src_start = r * stride;
        let dst_start = r * width;
        if src_start + width > src.len() || dst_start + width > dst.len() {
            break;
        }
        dst[dst_start..dst_start + width].copy_from_slice(&src[src_start..src_start + width]);
    }
}
