use anyhow::{Context, Result, bail};
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::capture::DemuxSource;
use crate::config::{OutputKind, RecorderConfig, output_kind};
use crate::decoder::FfmpegDecoder;
use crate::filter::ScaleFilter;
use crate::pipeline::{Pipeline, PipelineBuilder, ShutdownReport};
use crate::sink::{MuxSink, YuvFileSink};
use crate::utils::sos::SignalOfStop;

/// One recording session: input → decode → (filter) → output file
pub struct Recorder {
    pipeline: Pipeline,
    output: PathBuf,
    duration: Option<Duration>,
    timer: Option<(SignalOfStop, JoinHandle<()>)>,
}

impl Recorder {
    /// Open every collaborator and assemble the pipeline, without starting it
    pub fn new(config: &RecorderConfig, sos: SignalOfStop) -> Result<Self> {
        config.validate()?;
        let output = config.output_path();
        let kind = output_kind(&output);
        if kind == OutputKind::RawYuv && config.pixel_format != "yuv420p" {
            bail!(
                "raw output is always yuv420p, cannot write {}",
                config.pixel_format
            );
        }

        let source = DemuxSource::open(&config.input_spec())
            .with_context(|| format!("failed to open input '{}'", config.input))?;
        let decoder = FfmpegDecoder::from_stream(source.video_stream())
            .context("failed to open video decoder")?;

        let builder = PipelineBuilder::from_source("capture", source)
            .queue_warn_depth(config.queue_warn_depth)
            .transform("decode", decoder);

        let builder = if config.filter {
            let filter = ScaleFilter::new(&config.pixel_format, config.target_size())
                .context("failed to configure filter")?;
            builder.transform("filter", filter)
        } else {
            info!("Recorder: filter stage disabled");
            builder
        };

        let topology = match kind {
            OutputKind::RawYuv => builder.sink("sink", open_yuv(&output)?),
            OutputKind::Container => builder.sink(
                "sink",
                MuxSink::new(&output, config.frame_rate, config.encoder.clone())
                    .context("failed to configure output")?,
            ),
        };
        info!(
            "Recorder: {} → {}",
            topology.stage_names().join(" → "),
            output.display()
        );

        Ok(Self {
            pipeline: Pipeline::new(topology, sos),
            output,
            duration: config.duration.map(Duration::from_secs_f64),
            timer: None,
        })
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    /// Spawn the stage threads, plus the auto-stop timer when a duration is set
    pub fn start(&mut self) -> Result<()> {
        self.pipeline.start().context("failed to start pipeline")?;

        if let Some(duration) = self.duration {
            let timer_stop = SignalOfStop::new();
            let waiter = timer_stop.clone();
            let handle = self.pipeline.handle();

            let spawned = thread::Builder::new()
                .name("duration-timer".to_string())
                .spawn(move || {
                    if !waiter.wait_cancellation_timeout(duration) {
                        info!(
                            "Recorder: {:.1}s elapsed, stopping",
                            duration.as_secs_f64()
                        );
                        handle.stop();
                    }
                });

            match spawned {
                Ok(timer) => self.timer = Some((timer_stop, timer)),
                Err(e) => {
                    // Recording still works, it just has to be stopped by hand
                    warn!("Recorder: failed to start duration timer: {}", e);
                }
            }
        }
        Ok(())
    }

    /// Block until the pipeline has shut down and every thread is joined
    pub fn wait(&mut self) -> Result<ShutdownReport> {
        let report = self.pipeline.join().context("failed to join pipeline")?;

        if let Some((timer_stop, timer)) = self.timer.take() {
            timer_stop.cancel();
            if timer.join().is_err() {
                warn!("Recorder: duration timer panicked");
            }
        }
        Ok(report)
    }
}

fn open_yuv(output: &Path) -> Result<YuvFileSink> {
    YuvFileSink::create(output).with_context(|| format!("failed to create {}", output.display()))
}
