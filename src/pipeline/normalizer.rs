//! Adaptive normalization state carried across flushes.
//!
//! Two independent policies live here:
//!
//! - [`LoudnessNormalizer`]: per-summary volume normalization against a
//!   bounded history of recent peaks, with a noise floor below which the
//!   output is silence.
//! - [`BandSmoother`] and [`GainControl`]: per-frame exponential smoothing of
//!   band energies and an advisory visualization gain. The gain is exposed
//!   next to the summary and never rescales published values.

use std::collections::VecDeque;

use crate::audio::features::FrameResult;
use crate::config::{GainConfig, NormalizerConfig, PipelineConfig};

fn sanitize(value: f32) -> f32 {
    if value.is_finite() { value.max(0.0) } else { 0.0 }
}

#[derive(Clone, Debug)]
pub struct LoudnessNormalizer {
    history: VecDeque<f32>,
    capacity: usize,
    min_threshold: f32,
}

impl LoudnessNormalizer {
    pub fn new(config: &NormalizerConfig) -> Self {
        Self {
            history: VecDeque::with_capacity(config.history_capacity),
            capacity: config.history_capacity.max(1),
            min_threshold: config.min_volume_threshold,
        }
    }

    /// Normalize one summary's peak loudness into [0, 1], then record the raw
    /// peak in the history.
    pub fn normalize(&mut self, peak: f32) -> f32 {
        let peak = sanitize(peak);
        let floor = self.history_max().max(self.min_threshold);

        let volume = if peak < self.min_threshold || floor <= 0.0 {
            0.0
        } else {
            (peak / floor).clamp(0.0, 1.0)
        };

        self.history.push_back(peak);
        while self.history.len() > self.capacity {
            self.history.pop_front();
        }

        volume
    }

    pub fn history_max(&self) -> f32 {
        self.history.iter().copied().fold(0.0f32, f32::max)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.history.len()
    }
}

/// `smoothed = alpha * smoothed + (1 - alpha) * raw`, per band.
#[derive(Clone, Debug)]
pub struct BandSmoother {
    alpha: f32,
    smoothed: Vec<f32>,
}

impl BandSmoother {
    pub fn new(alpha: f32) -> Self {
        Self { alpha, smoothed: Vec::new() }
    }

    pub fn update(&mut self, raw: &[f32]) {
        if raw.is_empty() {
            return;
        }
        if self.smoothed.len() != raw.len() {
            self.smoothed = vec![0.0; raw.len()];
        }
        for (s, &r) in self.smoothed.iter_mut().zip(raw) {
            let r = sanitize(r).min(1.0);
            *s = (self.alpha * *s + (1.0 - self.alpha) * r).clamp(0.0, 1.0);
        }
    }

    pub fn bands(&self) -> &[f32] {
        &self.smoothed
    }
}

/// Advisory gain multiplier driven by a rolling loudness average.
///
/// Quiet input relaxes the gain toward `min` (faster when very quiet); louder
/// input raises it toward `max` by at most `rise_step` per frame.
#[derive(Clone, Debug)]
pub struct GainControl {
    config: GainConfig,
    window: VecDeque<f32>,
    window_len: usize,
    multiplier: f32,
}

impl GainControl {
    pub fn new(config: &GainConfig, window_len: usize) -> Self {
        Self {
            config: config.clone(),
            window: VecDeque::with_capacity(window_len),
            window_len: window_len.max(1),
            multiplier: config.min,
        }
    }

    pub fn update(&mut self, loudness: f32) -> f32 {
        self.window.push_back(sanitize(loudness));
        while self.window.len() > self.window_len {
            self.window.pop_front();
        }

        let average = self.average();
        let cfg = &self.config;
        if average < cfg.threshold {
            let step = if average < cfg.threshold * cfg.quiet_ratio {
                cfg.quiet_fall_step
            } else {
                cfg.fall_step
            };
            self.multiplier -= step;
        } else {
            self.multiplier += cfg.rise_step;
        }
        self.multiplier = self.multiplier.clamp(cfg.min, cfg.max);
        self.multiplier
    }

    pub fn average(&self) -> f32 {
        if self.window.is_empty() {
            return 0.0;
        }
        // Mean of values pre-divided so huge inputs cannot overflow to inf
        let n = self.window.len() as f32;
        self.window.iter().map(|v| v / n).sum()
    }

    pub fn multiplier(&self) -> f32 {
        self.multiplier
    }
}

/// Normalizer state for one pipeline run. Owned by the flush activity.
#[derive(Clone, Debug)]
pub struct NormalizerState {
    pub loudness: LoudnessNormalizer,
    pub bands: BandSmoother,
    pub gain: GainControl,
}

impl NormalizerState {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            loudness: LoudnessNormalizer::new(&config.normalizer),
            bands: BandSmoother::new(config.gain.smoothing),
            gain: GainControl::new(&config.gain, config.gain_window_frames()),
        }
    }

    /// Fold one frame into the per-frame policies, in arrival order.
    pub fn observe_frame(&mut self, frame: &FrameResult) {
        self.bands.update(&frame.bands);
        self.gain.update(frame.loudness);
    }
}
