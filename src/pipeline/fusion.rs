use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::normalizer::NormalizerState;
use crate::audio::features::{silent_onsets, FrameResult, FusedSummary, OnsetMethod, Pitch};
use crate::config::FusionConfig;

/// How per-frame BPM estimates are reduced to one value per summary.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum BpmPolicy {
    /// Halve values above the threshold, then average all non-zero values
    #[default]
    NormalizedAverage,
    /// Latest frame's raw BPM
    Latest,
}

/// How the published pitch is chosen among buffered frames.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum PitchPolicy {
    /// Highest confidence, earliest frame on ties
    #[default]
    MaxConfidence,
    /// Latest frame's pitch
    Latest,
}

pub fn fuse_bpm(frames: &[FrameResult], policy: BpmPolicy, threshold: f32) -> f32 {
    match policy {
        BpmPolicy::NormalizedAverage => {
            let normalized: Vec<f32> = frames
                .iter()
                .map(|f| f.bpm)
                .filter(|&bpm| bpm > 0.0 && bpm.is_finite())
                .map(|bpm| if bpm > threshold { bpm / 2.0 } else { bpm })
                .collect();
            if normalized.is_empty() {
                0.0
            } else {
                normalized.iter().sum::<f32>() / normalized.len() as f32
            }
        }
        BpmPolicy::Latest => frames.last().map_or(0.0, |f| f.bpm),
    }
}

pub fn select_pitch(frames: &[FrameResult], policy: PitchPolicy) -> Pitch {
    match policy {
        PitchPolicy::MaxConfidence => {
            let mut best: Option<Pitch> = None;
            for frame in frames {
                // Strict comparison keeps the earliest frame on ties
                if best.map_or(true, |b| frame.pitch.confidence > b.confidence) {
                    best = Some(frame.pitch);
                }
            }
            best.unwrap_or_default()
        }
        PitchPolicy::Latest => frames.last().map(|f| f.pitch).unwrap_or_default(),
    }
}

/// Set union of note values, ascending.
pub fn union_notes(frames: &[FrameResult]) -> Vec<f32> {
    let mut notes: Vec<f32> = frames
        .iter()
        .flat_map(|f| f.notes.iter().copied())
        .filter(|n| n.is_finite())
        .collect();
    notes.sort_by(f32::total_cmp);
    notes.dedup();
    notes
}

/// Peak (not average) loudness across the window.
pub fn peak_loudness(frames: &[FrameResult]) -> f32 {
    frames
        .iter()
        .map(|f| f.loudness)
        .filter(|l| l.is_finite())
        .fold(0.0f32, f32::max)
}

/// Reduce one drained window into a summary. `None` for an empty window, in
/// which case normalizer state is left untouched.
pub fn combine(
    frames: &[FrameResult],
    state: &mut NormalizerState,
    config: &FusionConfig,
    seq: u64,
    timestamp: DateTime<Utc>,
) -> Option<FusedSummary> {
    if frames.is_empty() {
        return None;
    }

    let mut onsets = silent_onsets();
    let mut tempo_beat = false;
    for frame in frames {
        state.observe_frame(frame);
        for (&method, &fired) in &frame.onsets {
            if fired {
                onsets.insert(method, true);
            }
        }
        tempo_beat |= frame.tempo_flag;
    }

    let bpm = fuse_bpm(frames, config.bpm_policy, config.bpm_threshold);
    let pitch = select_pitch(frames, config.pitch_policy);
    let notes = union_notes(frames);
    let volume = state.loudness.normalize(peak_loudness(frames));

    let bands = state.bands.bands().to_vec();
    let energy_onset = onsets.get(&OnsetMethod::Energy).copied().unwrap_or(false);
    let kick_detected = energy_onset
        && bands.first().map_or(true, |&sub_bass| sub_bass > config.kick_band_threshold);
    let hihat_detected = pitch.value >= config.hihat_min_hz
        && pitch.value <= config.hihat_max_hz
        && pitch.confidence > config.hihat_min_confidence;

    Some(FusedSummary {
        seq,
        timestamp,
        onsets,
        tempo_beat,
        bpm,
        pitch,
        notes,
        volume,
        kick_detected,
        hihat_detected,
        bands,
        gain: state.gain.multiplier(),
        frames: frames.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, PipelineConfig};

    fn frame(energy: bool, bpm: f32, pitch: (f32, f32), notes: &[f32], loudness: f32) -> FrameResult {
        let mut f = FrameResult::quiet(loudness);
        f.onsets.insert(OnsetMethod::Energy, energy);
        f.bpm = bpm;
        f.pitch = Pitch::new(pitch.0, pitch.1);
        f.notes = notes.to_vec();
        f
    }

    fn setup() -> (NormalizerState, FusionConfig) {
        let config = Config::default();
        let pipeline = PipelineConfig::new(&config.pipeline, 44100, &config).unwrap();
        (NormalizerState::new(&pipeline), pipeline.fusion.clone())
    }

    #[test]
    fn empty_window_produces_nothing() {
        let (mut state, cfg) = setup();
        assert!(combine(&[], &mut state, &cfg, 0, Utc::now()).is_none());
        assert_eq!(state.loudness.len(), 0);
    }

    #[test]
    fn single_firing_frame_sets_onset() {
        let (mut state, cfg) = setup();
        let mut frames: Vec<FrameResult> = (0..6).map(|_| frame(false, 0.0, (0.0, 0.0), &[], 0.1)).collect();
        frames[3].onsets.insert(OnsetMethod::Energy, true);

        let summary = combine(&frames, &mut state, &cfg, 0, Utc::now()).unwrap();
        assert!(summary.onset(OnsetMethod::Energy));
        assert!(!summary.onset(OnsetMethod::Hfc));
        assert_eq!(summary.onsets.len(), OnsetMethod::ALL.len());
        assert_eq!(summary.frames, 6);
    }

    #[test]
    fn tempo_flag_is_ored() {
        let (mut state, cfg) = setup();
        let mut frames = vec![FrameResult::quiet(0.1), FrameResult::quiet(0.1)];
        assert!(!combine(&frames, &mut state, &cfg, 0, Utc::now()).unwrap().tempo_beat);
        frames[1].tempo_flag = true;
        assert!(combine(&frames, &mut state, &cfg, 1, Utc::now()).unwrap().tempo_beat);
    }

    #[test]
    fn bpm_is_octave_normalized_then_averaged() {
        let frames: Vec<FrameResult> = [130.0, 140.0, 0.0, 125.0]
            .iter()
            .map(|&bpm| frame(false, bpm, (0.0, 0.0), &[], 0.1))
            .collect();
        let bpm = fuse_bpm(&frames, BpmPolicy::NormalizedAverage, 120.0);
        assert!((bpm - (65.0 + 70.0 + 62.5) / 3.0).abs() < 1e-4, "bpm {}", bpm);
    }

    #[test]
    fn bpm_threshold_is_exclusive_and_zero_when_unknown() {
        let at = [frame(false, 120.0, (0.0, 0.0), &[], 0.1)];
        assert_eq!(fuse_bpm(&at, BpmPolicy::NormalizedAverage, 120.0), 120.0);
        let none = [frame(false, 0.0, (0.0, 0.0), &[], 0.1)];
        assert_eq!(fuse_bpm(&none, BpmPolicy::NormalizedAverage, 120.0), 0.0);
    }

    #[test]
    fn latest_bpm_policy_takes_raw_value() {
        let frames: Vec<FrameResult> = [90.0, 140.0]
            .iter()
            .map(|&bpm| frame(false, bpm, (0.0, 0.0), &[], 0.1))
            .collect();
        assert_eq!(fuse_bpm(&frames, BpmPolicy::Latest, 120.0), 140.0);
    }

    #[test]
    fn pitch_prefers_confidence_then_earliest() {
        let frames = vec![
            frame(false, 0.0, (300.0, 0.4), &[], 0.1),
            frame(false, 0.0, (440.0, 0.9), &[], 0.1),
            frame(false, 0.0, (880.0, 0.9), &[], 0.1),
            frame(false, 0.0, (220.0, 0.2), &[], 0.1),
        ];
        assert_eq!(select_pitch(&frames, PitchPolicy::MaxConfidence), Pitch::new(440.0, 0.9));
        // A short confident event followed by a weak one diverges between policies
        assert_eq!(select_pitch(&frames, PitchPolicy::Latest), Pitch::new(220.0, 0.2));
    }

    #[test]
    fn notes_are_a_set() {
        let frames = vec![
            frame(false, 0.0, (0.0, 0.0), &[81.0, 69.0], 0.1),
            frame(false, 0.0, (0.0, 0.0), &[], 0.1),
            frame(false, 0.0, (0.0, 0.0), &[69.0, 60.0], 0.1),
        ];
        assert_eq!(union_notes(&frames), vec![60.0, 69.0, 81.0]);
    }

    #[test]
    fn volume_uses_peak_not_average() {
        let (mut state, cfg) = setup();
        state.loudness.normalize(1.0);
        let frames = vec![
            frame(false, 0.0, (0.0, 0.0), &[], 0.1),
            frame(false, 0.0, (0.0, 0.0), &[], 0.5),
            frame(false, 0.0, (0.0, 0.0), &[], 0.2),
        ];
        let summary = combine(&frames, &mut state, &cfg, 0, Utc::now()).unwrap();
        assert_eq!(summary.volume, 0.5);
    }

    #[test]
    fn quiet_window_is_silent() {
        let (mut state, cfg) = setup();
        let frames = vec![frame(false, 0.0, (0.0, 0.0), &[], 0.005)];
        let summary = combine(&frames, &mut state, &cfg, 0, Utc::now()).unwrap();
        assert_eq!(summary.volume, 0.0);
    }

    #[test]
    fn three_frame_window() {
        let (mut state, cfg) = setup();
        let frames = vec![
            frame(true, 0.0, (0.0, 0.0), &[], 0.02),
            frame(false, 128.0, (440.0, 0.6), &[69.0], 0.05),
            frame(false, 130.0, (440.0, 0.9), &[69.0, 81.0], 0.03),
        ];
        let summary = combine(&frames, &mut state, &cfg, 7, Utc::now()).unwrap();

        assert_eq!(summary.seq, 7);
        assert!(summary.onset(OnsetMethod::Energy));
        assert!((summary.bpm - 64.5).abs() < 1e-4);
        assert_eq!(summary.pitch, Pitch::new(440.0, 0.9));
        assert_eq!(summary.notes, vec![69.0, 81.0]);
        // Empty history: floor is the noise threshold, 0.05 / 0.01 saturates
        assert_eq!(summary.volume, 1.0);
        assert_eq!(state.loudness.history_max(), 0.05);
        // No band data: the energy onset alone marks a kick
        assert!(summary.kick_detected);
        assert!(!summary.hihat_detected);
    }

    #[test]
    fn hihat_needs_pitch_in_range_with_confidence() {
        let (mut state, cfg) = setup();
        let frames = vec![frame(false, 0.0, (5200.0, 0.1), &[], 0.1)];
        assert!(combine(&frames, &mut state, &cfg, 0, Utc::now()).unwrap().hihat_detected);
        let frames = vec![frame(false, 0.0, (5200.0, 0.05), &[], 0.1)];
        assert!(!combine(&frames, &mut state, &cfg, 1, Utc::now()).unwrap().hihat_detected);
    }

    #[test]
    fn kick_requires_sub_bass_when_bands_present() {
        let (mut state, cfg) = setup();
        let mut weak = frame(true, 0.0, (0.0, 0.0), &[], 0.1);
        weak.bands = vec![0.1; 8];
        assert!(!combine(&[weak], &mut state, &cfg, 0, Utc::now()).unwrap().kick_detected);

        let mut strong = frame(true, 0.0, (0.0, 0.0), &[], 0.1);
        strong.bands = vec![1.0; 8];
        let frames = vec![strong.clone(), strong.clone(), strong];
        let summary = combine(&frames, &mut state, &cfg, 1, Utc::now()).unwrap();
        assert!(summary.bands[0] > 0.5);
        assert!(summary.kick_detected);
    }

    #[test]
    fn gain_is_reported_but_not_applied() {
        let (mut state, cfg) = setup();
        state.loudness.normalize(1.0);
        let frames: Vec<FrameResult> = (0..50).map(|_| frame(false, 0.0, (0.0, 0.0), &[], 0.5)).collect();
        let summary = combine(&frames, &mut state, &cfg, 0, Utc::now()).unwrap();
        assert!(summary.gain > 1.0);
        assert_eq!(summary.volume, 0.5);
    }
}
