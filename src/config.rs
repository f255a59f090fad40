use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::capture::InputSpec;
use crate::pipeline::coordinator::DEFAULT_QUEUE_WARN_DEPTH;

/// What the sink stage writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    /// Raw planar frames, back to back
    RawYuv,
    /// Re-encoded and multiplexed, container guessed from the file name
    Container,
}

/// Recorder settings: JSON file first, command line on top
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    pub input: String,
    pub input_format: Option<String>,
    pub input_options: BTreeMap<String, String>,
    pub output: Option<PathBuf>,
    pub width: Option<usize>,
    pub height: Option<usize>,
    pub pixel_format: String,
    pub filter: bool,
    pub encoder: Option<String>,
    pub frame_rate: u32,
    /// Stop automatically after this many seconds
    pub duration: Option<f64>,
    pub queue_warn_depth: usize,
    pub log_level: String,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        RecorderConfig {
            input: String::from("-"),
            input_format: None,
            input_options: BTreeMap::new(),
            output: None,
            width: None,
            height: None,
            pixel_format: String::from("yuv420p"),
            filter: true,
            encoder: None,
            frame_rate: 30,
            duration: None,
            queue_warn_depth: DEFAULT_QUEUE_WARN_DEPTH,
            log_level: String::from("info"),
        }
    }
}

impl RecorderConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Reject settings no pipeline could run with
    pub fn validate(&self) -> Result<()> {
        if self.input.is_empty() {
            bail!("input must not be empty");
        }
        if self.frame_rate == 0 {
            bail!("frame rate must be positive");
        }
        if let Some(duration) = self.duration {
            if !(duration.is_finite() && duration > 0.0) {
                bail!("duration must be a positive number of seconds");
            }
        }
        if self.width.is_some() != self.height.is_some() {
            bail!("width and height must be given together");
        }
        if matches!(self.width, Some(0)) || matches!(self.height, Some(0)) {
            bail!("target size must be non-zero");
        }
        if self.queue_warn_depth == 0 {
            bail!("queue warn depth must be positive");
        }
        if !self.filter && self.target_size().is_some() {
            bail!("resizing needs the filter stage");
        }
        Ok(())
    }

    pub fn set_size(&mut self, size: &str) -> Result<()> {
        let (w, h) = parse_size(size)?;
        self.width = Some(w);
        self.height = Some(h);
        Ok(())
    }

    pub fn set_input_option(&mut self, option: &str) -> Result<()> {
        let (key, value) = option
            .split_once('=')
            .filter(|(key, _)| !key.is_empty())
            .ok_or_else(|| anyhow!("input option '{}' is not KEY=VALUE", option))?;
        self.input_options.insert(key.to_string(), value.to_string());
        Ok(())
    }

    pub fn target_size(&self) -> Option<(usize, usize)> {
        self.width.zip(self.height)
    }

    pub fn input_spec(&self) -> InputSpec {
        InputSpec {
            input: self.input.clone(),
            format: self.input_format.clone(),
            options: self
                .input_options
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// The configured output, or `<unix-seconds>.yuv` in the working directory
    pub fn output_path(&self) -> PathBuf {
        self.output.clone().unwrap_or_else(default_output_name)
    }

    pub fn output_kind(&self) -> OutputKind {
        output_kind(&self.output_path())
    }
}

pub fn output_kind(path: &Path) -> OutputKind {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("yuv") => OutputKind::RawYuv,
        _ => OutputKind::Container,
    }
}

fn default_output_name() -> PathBuf {
    PathBuf::from(format!("{}.yuv", chrono::Utc::now().timestamp()))
}

/// Parse `WIDTHxHEIGHT`
pub fn parse_size(size: &str) -> Result<(usize, usize)> {
    let (w, h) = size
        .split_once(['x', 'X'])
        .ok_or_else(|| anyhow!("size '{}' is not WIDTHxHEIGHT", size))?;
    let w = w
        .trim()
        .parse()
        .with_context(|| format!("invalid width in '{}'", size))?;
    let h = h
        .trim()
        .parse()
        .with_context(|| format!("invalid height in '{}'", size))?;
    Ok((w, h))
}

/// Returns a version as specified in Cargo.toml
pub fn app_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn app_name() -> &'static str {
    env!("CARGO_PKG_NAME")
}
