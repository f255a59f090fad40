use crate::config::{RecorderConfig, app_name, app_version};
use crate::pipeline::Outcome;
use crate::pipeline::coordinator::STAGE_THREAD_PREFIX;
use crate::utils::sos::SignalOfStop;
use crate::workers::Recorder;
use anyhow::Result;
use clap::{Arg, ArgAction, ArgMatches, Command, value_parser};
use log::{error, info, warn};
use std::path::PathBuf;
use std::{panic, process, thread};
use tracing_subscriber::EnvFilter;

pub mod capture;
pub mod config;
pub mod decoder;
pub mod encoder;
pub mod filter;
pub mod pipeline;
pub mod sink;
pub mod utils;
pub mod workers;

const EXIT_CLEAN: i32 = 0;
const EXIT_FORCED: i32 = 1;
const EXIT_INIT_FAILED: i32 = 2;

fn cli() -> Command {
    Command::new(app_name())
        .version(app_version())
        .author(env!("CARGO_PKG_AUTHORS"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::new("input")
                .short('i')
                .long("input")
                .value_name("PATH")
                .help("Input file, or '-' to read from stdin."),
        )
        .arg(
            Arg::new("format")
                .short('f')
                .long("format")
                .value_name("DEMUXER")
                .help("Force the input format (e.g. mpegts, h264, matroska)."),
        )
        .arg(
            Arg::new("input-option")
                .short('O')
                .long("input-option")
                .value_name("KEY=VALUE")
                .help("Demuxer option, may be repeated.")
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_name("PATH")
                .help("Output file; '.yuv' writes raw frames, anything else is re-encoded."),
        )
        .arg(
            Arg::new("size")
                .short('s')
                .long("size")
                .value_name("WxH")
                .help("Scale frames to this size."),
        )
        .arg(
            Arg::new("pix-fmt")
                .long("pix-fmt")
                .value_name("FORMAT")
                .help("Pixel format produced by the filter stage."),
        )
        .arg(
            Arg::new("no-filter")
                .long("no-filter")
                .help("Hand decoded frames straight to the output.")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("encoder")
                .long("encoder")
                .value_name("NAME")
                .help("Use this encoder instead of the hardware/software fallback chain."),
        )
        .arg(
            Arg::new("frame-rate")
                .short('r')
                .long("frame-rate")
                .value_name("FPS")
                .help("Frame rate used to stamp encoded frames.")
                .value_parser(value_parser!(u32)),
        )
        .arg(
            Arg::new("duration")
                .short('t')
                .long("duration")
                .value_name("SECS")
                .help("Stop recording after this many seconds.")
                .value_parser(value_parser!(f64)),
        )
        .arg(
            Arg::new("queue-warn-depth")
                .long("queue-warn-depth")
                .value_name("ITEMS")
                .help("Warn when a stage queue grows past this depth.")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("JSON configuration file; command line flags take precedence.")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .help("Log filter used when RUST_LOG is not set."),
        )
}

fn build_config(matches: &ArgMatches) -> Result<RecorderConfig> {
    let mut config = match matches.get_one::<PathBuf>("config") {
        Some(path) => RecorderConfig::load(path)?,
        None => RecorderConfig::default(),
    };

    if let Some(input) = matches.get_one::<String>("input") {
        config.input = input.clone();
    }
    if let Some(format) = matches.get_one::<String>("format") {
        config.input_format = Some(format.clone());
    }
    if let Some(options) = matches.get_many::<String>("input-option") {
        for option in options {
            config.set_input_option(option)?;
        }
    }
    if let Some(output) = matches.get_one::<String>("output") {
        config.output = Some(PathBuf::from(output));
    }
    if let Some(size) = matches.get_one::<String>("size") {
        config.set_size(size)?;
    }
    if let Some(pixel_format) = matches.get_one::<String>("pix-fmt") {
        config.pixel_format = pixel_format.clone();
    }
    if matches.get_flag("no-filter") {
        config.filter = false;
    }
    if let Some(encoder) = matches.get_one::<String>("encoder") {
        config.encoder = Some(encoder.clone());
    }
    if let Some(frame_rate) = matches.get_one::<u32>("frame-rate") {
        config.frame_rate = *frame_rate;
    }
    if let Some(duration) = matches.get_one::<f64>("duration") {
        config.duration = Some(*duration);
    }
    if let Some(depth) = matches.get_one::<usize>("queue-warn-depth") {
        config.queue_warn_depth = *depth;
    }
    if let Some(level) = matches.get_one::<String>("log-level") {
        config.log_level = level.clone();
    }

    config.validate()?;
    Ok(config)
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Gracefully stop the recording when receiving SIGINT, SIGTERM, or SIGHUP
fn install_stop_handler(sos: SignalOfStop) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || {
        sos.cancel();
    })
}

fn run(config: &RecorderConfig, sos: SignalOfStop) -> i32 {
    let mut recorder = match Recorder::new(config, sos) {
        Ok(recorder) => recorder,
        Err(e) => {
            error!("{:#}", e);
            return EXIT_INIT_FAILED;
        }
    };

    if let Err(e) = recorder.start() {
        error!("{:#}", e);
        return EXIT_INIT_FAILED;
    }
    info!(
        "Recording to {} (Ctrl-C to stop)",
        recorder.output().display()
    );

    match recorder.wait() {
        Ok(report) => {
            if report.discarded > 0 {
                warn!("{} queued units were discarded", report.discarded);
            }
            match report.outcome {
                Outcome::Clean => {
                    info!("Recording finished: {}", recorder.output().display());
                    EXIT_CLEAN
                }
                Outcome::Forced => {
                    for stage in &report.stages {
                        error!("stage {}: {}", stage.name, stage.exit);
                    }
                    EXIT_FORCED
                }
            }
        }
        Err(e) => {
            error!("{:#}", e);
            EXIT_FORCED
        }
    }
}

fn main() {
    let matches = cli().get_matches();
    let config = match build_config(&matches) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {:#}", app_name(), e);
            process::exit(EXIT_INIT_FAILED);
        }
    };

    init_logging(&config.log_level);

    // kill the process as soon as a thread outside the pipeline panics;
    // stage panics are contained by the pipeline and reported at join
    let orig_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        orig_hook(panic_info);
        let in_stage = thread::current()
            .name()
            .is_some_and(|name| name.starts_with(STAGE_THREAD_PREFIX));
        if !in_stage {
            process::exit(105);
        }
    }));

    let sos = SignalOfStop::new();
    install_stop_handler(sos.clone()).expect("Error setting Ctrl-C handler");

    process::exit(run(&config, sos));
}
