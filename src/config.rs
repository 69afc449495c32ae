use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::pipeline::fusion::{BpmPolicy, PitchPolicy};

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub fusion: FusionConfig,
    #[serde(default)]
    pub normalizer: NormalizerConfig,
    #[serde(default)]
    pub gain: GainConfig,
    #[serde(default)]
    pub sink: SinkConfig,
}

#[derive(Debug, Deserialize)]
pub struct PipelineSection {
    #[serde(default = "default_publish_rate")]
    pub publish_rate: f32,
    #[serde(default = "default_frame_length")]
    pub frame_length: usize,
    #[serde(default = "default_replay_speed")]
    pub replay_speed: f32,
}

#[derive(Clone, Debug, Deserialize)]
pub struct FusionConfig {
    #[serde(default)]
    pub bpm_policy: BpmPolicy,
    #[serde(default = "default_bpm_threshold")]
    pub bpm_threshold: f32,
    #[serde(default)]
    pub pitch_policy: PitchPolicy,
    #[serde(default = "default_hihat_min_hz")]
    pub hihat_min_hz: f32,
    #[serde(default = "default_hihat_max_hz")]
    pub hihat_max_hz: f32,
    #[serde(default = "default_hihat_min_confidence")]
    pub hihat_min_confidence: f32,
    #[serde(default = "default_kick_band_threshold")]
    pub kick_band_threshold: f32,
}

#[derive(Clone, Debug, Deserialize)]
pub struct NormalizerConfig {
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    #[serde(default = "default_min_volume_threshold")]
    pub min_volume_threshold: f32,
}

#[derive(Clone, Debug, Deserialize)]
pub struct GainConfig {
    /// Band smoothing factor: smoothed = a * smoothed + (1 - a) * raw
    #[serde(default = "default_gain_smoothing")]
    pub smoothing: f32,
    #[serde(default = "default_gain_min")]
    pub min: f32,
    #[serde(default = "default_gain_max")]
    pub max: f32,
    #[serde(default = "default_gain_threshold")]
    pub threshold: f32,
    #[serde(default = "default_quiet_ratio")]
    pub quiet_ratio: f32,
    #[serde(default = "default_window_secs")]
    pub window_secs: f32,
    #[serde(default = "default_rise_step")]
    pub rise_step: f32,
    #[serde(default = "default_fall_step")]
    pub fall_step: f32,
    #[serde(default = "default_quiet_fall_step")]
    pub quiet_fall_step: f32,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SinkConfig {
    #[serde(default = "default_sink_kind")]
    pub kind: String,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            publish_rate: default_publish_rate(),
            frame_length: default_frame_length(),
            replay_speed: default_replay_speed(),
        }
    }
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            bpm_policy: BpmPolicy::default(),
            bpm_threshold: default_bpm_threshold(),
            pitch_policy: PitchPolicy::default(),
            hihat_min_hz: default_hihat_min_hz(),
            hihat_max_hz: default_hihat_max_hz(),
            hihat_min_confidence: default_hihat_min_confidence(),
            kick_band_threshold: default_kick_band_threshold(),
        }
    }
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            history_capacity: default_history_capacity(),
            min_volume_threshold: default_min_volume_threshold(),
        }
    }
}

impl Default for GainConfig {
    fn default() -> Self {
        Self {
            smoothing: default_gain_smoothing(),
            min: default_gain_min(),
            max: default_gain_max(),
            threshold: default_gain_threshold(),
            quiet_ratio: default_quiet_ratio(),
            window_secs: default_window_secs(),
            rise_step: default_rise_step(),
            fall_step: default_fall_step(),
            quiet_fall_step: default_quiet_fall_step(),
        }
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            kind: default_sink_kind(),
            path: None,
            url: None,
            timeout_ms: default_timeout_ms(),
        }
    }
}

fn default_publish_rate() -> f32 { 30.0 }
fn default_frame_length() -> usize { 512 }
fn default_replay_speed() -> f32 { 1.0 }
fn default_bpm_threshold() -> f32 { 120.0 }
fn default_hihat_min_hz() -> f32 { 4000.0 }
fn default_hihat_max_hz() -> f32 { 8000.0 }
fn default_hihat_min_confidence() -> f32 { 0.07 }
fn default_kick_band_threshold() -> f32 { 0.5 }
fn default_history_capacity() -> usize { 100 }
fn default_min_volume_threshold() -> f32 { 0.01 }
fn default_gain_smoothing() -> f32 { 0.7 }
fn default_gain_min() -> f32 { 1.0 }
fn default_gain_max() -> f32 { 3.0 }
fn default_gain_threshold() -> f32 { 0.02 }
fn default_quiet_ratio() -> f32 { 0.25 }
fn default_window_secs() -> f32 { 1.0 }
fn default_rise_step() -> f32 { 0.02 }
fn default_fall_step() -> f32 { 0.05 }
fn default_quiet_fall_step() -> f32 { 0.15 }
fn default_sink_kind() -> String { "stdout".into() }
fn default_timeout_ms() -> u64 { 500 }

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Explicit path first, then ./beatzero.toml, then the per-user config locations.
pub fn discover(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    let local = PathBuf::from("beatzero.toml");
    if local.exists() {
        return Some(local);
    }
    if let Some(home) = dirs::home_dir() {
        let xdg = home.join(".config").join("beatzero").join("config.toml");
        if xdg.exists() {
            return Some(xdg);
        }
    }
    if let Some(config_dir) = dirs::config_dir() {
        let platform = config_dir.join("beatzero").join("config.toml");
        if platform.exists() {
            return Some(platform);
        }
    }
    None
}

/// Validated settings the pipeline runs with.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub publish_rate: f32,
    pub frame_length: usize,
    pub sample_rate: u32,
    pub replay_speed: f32,
    pub fusion: FusionConfig,
    pub normalizer: NormalizerConfig,
    pub gain: GainConfig,
}

impl PipelineConfig {
    pub fn new(section: &PipelineSection, sample_rate: u32, config: &Config) -> Result<Self, ConfigError> {
        let cfg = Self {
            publish_rate: section.publish_rate,
            frame_length: section.frame_length,
            sample_rate,
            replay_speed: section.replay_speed,
            fusion: config.fusion.clone(),
            normalizer: config.normalizer.clone(),
            gain: config.gain.clone(),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.publish_rate.is_finite() || self.publish_rate <= 0.0 {
            return Err(ConfigError::PublishRate(self.publish_rate));
        }
        // Tiny rates pass the sign check but overflow Duration
        if try_period(1.0 / self.publish_rate as f64).is_none() {
            return Err(ConfigError::PublishRate(self.publish_rate));
        }
        if self.frame_length == 0 {
            return Err(ConfigError::FrameLength);
        }
        if self.sample_rate == 0 {
            return Err(ConfigError::SampleRate);
        }
        if !self.replay_speed.is_finite()
            || self.replay_speed <= 0.0
            || try_period(self.frame_secs() / self.replay_speed as f64).is_none()
        {
            return Err(ConfigError::ReplaySpeed(self.replay_speed));
        }
        if self.normalizer.history_capacity == 0 {
            return Err(ConfigError::HistoryCapacity);
        }
        check_threshold("min_volume_threshold", self.normalizer.min_volume_threshold)?;
        check_threshold("bpm_threshold", self.fusion.bpm_threshold)?;
        check_threshold("hihat_min_hz", self.fusion.hihat_min_hz)?;
        check_threshold("hihat_max_hz", self.fusion.hihat_max_hz)?;
        check_threshold("hihat_min_confidence", self.fusion.hihat_min_confidence)?;
        check_threshold("kick_band_threshold", self.fusion.kick_band_threshold)?;

        let gain = &self.gain;
        if !(0.0..1.0).contains(&gain.smoothing) {
            return Err(ConfigError::Smoothing(gain.smoothing));
        }
        if !gain.min.is_finite() || !gain.max.is_finite() || gain.min <= 0.0 || gain.min > gain.max {
            return Err(ConfigError::GainBounds { min: gain.min, max: gain.max });
        }
        if !gain.window_secs.is_finite() || gain.window_secs <= 0.0 {
            return Err(ConfigError::GainWindow(gain.window_secs));
        }
        check_threshold("gain.threshold", gain.threshold)?;
        check_threshold("gain.quiet_ratio", gain.quiet_ratio)?;
        check_threshold("gain.rise_step", gain.rise_step)?;
        check_threshold("gain.fall_step", gain.fall_step)?;
        check_threshold("gain.quiet_fall_step", gain.quiet_fall_step)?;
        Ok(())
    }

    pub fn publish_period(&self) -> Duration {
        try_period(1.0 / self.publish_rate as f64).unwrap_or(Duration::MAX)
    }

    /// Wall-clock spacing between replayed frames at `replay_speed`.
    pub fn frame_period(&self) -> Duration {
        try_period(self.frame_secs() / self.replay_speed as f64).unwrap_or(Duration::MAX)
    }

    fn frame_secs(&self) -> f64 {
        self.frame_length as f64 / self.sample_rate as f64
    }

    /// Native frame rate in Hz (informational).
    pub fn native_rate(&self) -> f32 {
        self.sample_rate as f32 / self.frame_length as f32
    }

    pub fn expected_frames_per_tick(&self) -> f32 {
        self.native_rate() / self.publish_rate
    }

    /// Frames in the gain rolling-average window, at least one.
    pub fn gain_window_frames(&self) -> usize {
        ((self.gain.window_secs * self.native_rate()).round() as usize).max(1)
    }
}

fn try_period(secs: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(secs).ok()
}

fn check_threshold(name: &'static str, value: f32) -> Result<(), ConfigError> {
    if !value.is_finite() || value < 0.0 {
        return Err(ConfigError::Threshold { name, value });
    }
    Ok(())
}

impl SinkConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.kind.as_str() {
            "stdout" => Ok(()),
            "file" if self.path.is_none() => Err(ConfigError::SinkTarget {
                kind: self.kind.clone(),
                field: "a path",
            }),
            "http" if self.url.is_none() => Err(ConfigError::SinkTarget {
                kind: self.kind.clone(),
                field: "a url",
            }),
            "file" | "http" => Ok(()),
            other => Err(ConfigError::SinkKind(other.to_string())),
        }
    }
}
