use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Onset detection methods reported by the per-frame analyzer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnsetMethod {
    Energy,
    Hfc,
    Complex,
    Phase,
    SpecFlux,
    WPhase,
    Mkl,
    Kl,
}

impl OnsetMethod {
    pub const ALL: [OnsetMethod; 8] = [
        OnsetMethod::Energy,
        OnsetMethod::Hfc,
        OnsetMethod::Complex,
        OnsetMethod::Phase,
        OnsetMethod::SpecFlux,
        OnsetMethod::WPhase,
        OnsetMethod::Mkl,
        OnsetMethod::Kl,
    ];

    pub fn name(self) -> &'static str {
        match self {
            OnsetMethod::Energy => "energy",
            OnsetMethod::Hfc => "hfc",
            OnsetMethod::Complex => "complex",
            OnsetMethod::Phase => "phase",
            OnsetMethod::SpecFlux => "specflux",
            OnsetMethod::WPhase => "wphase",
            OnsetMethod::Mkl => "mkl",
            OnsetMethod::Kl => "kl",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            OnsetMethod::Energy => "Energy (loudness)",
            OnsetMethod::Hfc => "High frequency content (treble)",
            OnsetMethod::Complex => "Complex domain (tonal changes)",
            OnsetMethod::Phase => "Phase deviation (timing changes)",
            OnsetMethod::SpecFlux => "Spectral flux (overall)",
            OnsetMethod::WPhase => "Weighted phase deviation",
            OnsetMethod::Mkl => "Modified Kullback-Leibler",
            OnsetMethod::Kl => "Kullback-Leibler",
        }
    }
}

pub type OnsetFlags = BTreeMap<OnsetMethod, bool>;

/// All methods present, all false.
pub fn silent_onsets() -> OnsetFlags {
    OnsetMethod::ALL.iter().map(|&m| (m, false)).collect()
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Pitch {
    /// Frequency in Hz (0.0 when unvoiced)
    pub value: f32,
    /// Detector confidence (0.0-1.0)
    pub confidence: f32,
}

impl Pitch {
    pub fn new(value: f32, confidence: f32) -> Self {
        Self { value, confidence }
    }
}

/// One analyzed audio frame, as produced by the analyzer.
#[derive(Clone, Debug, PartialEq)]
pub struct FrameResult {
    pub onsets: OnsetFlags,
    pub tempo_flag: bool,
    /// Tempo estimate (0.0 = unknown)
    pub bpm: f32,
    pub pitch: Pitch,
    /// Detected note values (MIDI numbers), possibly empty
    pub notes: Vec<f32>,
    /// RMS amplitude of the frame
    pub loudness: f32,
    /// Per-band spectral energy (0.0-1.0), empty when the analyzer has no spectrum
    pub bands: Vec<f32>,
}

impl FrameResult {
    /// A frame with no detections and the given loudness.
    pub fn quiet(loudness: f32) -> Self {
        Self {
            onsets: silent_onsets(),
            tempo_flag: false,
            bpm: 0.0,
            pitch: Pitch::default(),
            notes: Vec::new(),
            loudness,
            bands: Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn onset(&self, method: OnsetMethod) -> bool {
        self.onsets.get(&method).copied().unwrap_or(false)
    }
}

/// One fused record per publish tick, serialized flat for the sink.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FusedSummary {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub onsets: OnsetFlags,
    pub tempo_beat: bool,
    pub bpm: f32,
    pub pitch: Pitch,
    /// Union of note values, ascending
    pub notes: Vec<f32>,
    /// Normalized peak loudness (0.0-1.0)
    pub volume: f32,
    pub kick_detected: bool,
    pub hihat_detected: bool,
    /// Smoothed band energies after the last fused frame
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bands: Vec<f32>,
    /// Advisory visualization gain, never applied to the fields above
    pub gain: f32,
    /// Number of frames fused into this record
    pub frames: usize,
}

impl FusedSummary {
    #[cfg(test)]
    pub fn onset(&self, method: OnsetMethod) -> bool {
        self.onsets.get(&method).copied().unwrap_or(false)
    }
}
