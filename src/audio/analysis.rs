use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::collections::{BTreeMap, VecDeque};
use std::f32::consts::PI;
use std::sync::Arc;

use super::features::{FrameResult, OnsetFlags, OnsetMethod, Pitch};
use crate::error::AnalyzerError;

/// Per-frame analysis contract: one fixed-size mono frame in, one result bundle out.
pub trait Analyzer {
    fn analyze(&mut self, frame: &[f32]) -> Result<FrameResult, AnalyzerError>;
}

/// Frequency bands reported as per-band energy (Hz).
pub const FREQ_BANDS: [(f32, f32); 8] = [
    (20.0, 80.0),     // sub-bass
    (80.0, 250.0),    // bass
    (250.0, 500.0),   // low-mids
    (500.0, 1000.0),  // mids
    (1000.0, 2000.0), // upper-mids
    (2000.0, 3000.0), // presence
    (3000.0, 4000.0), // brilliance
    (4000.0, 8000.0), // air
];

const ODF_HISTORY: usize = 16;
const ONSET_HISTORY: usize = 20;
const MIN_PITCH_HZ: f32 = 40.0;
const EPS: f32 = 1e-10;

#[derive(Clone, Debug)]
pub struct AnalyzerSettings {
    /// Peak-picking threshold relative to the recent mean of each detection function
    pub onset_threshold: f32,
    /// Frames quieter than this (dBFS) never produce onsets
    pub onset_silence_db: f32,
    pub min_ioi_ms: f32,
    /// Frames quieter than this (dBFS) are reported unvoiced
    pub pitch_silence_db: f32,
    /// Minimum pitch confidence for a note to be emitted on an onset
    pub note_confidence: f32,
}

impl Default for AnalyzerSettings {
    fn default() -> Self {
        Self {
            onset_threshold: 0.1,
            onset_silence_db: -70.0,
            min_ioi_ms: 40.0,
            pitch_silence_db: -60.0,
            note_confidence: 0.5,
        }
    }
}

/// Adaptive threshold over one onset detection function: moving median plus a
/// fraction of the moving mean, firing on the rising edge only.
#[derive(Clone, Debug, Default)]
struct PeakPicker {
    history: VecDeque<f32>,
    above: bool,
    last_onset: Option<u64>,
}

impl PeakPicker {
    fn push(&mut self, value: f32, frame: u64, threshold: f32, min_ioi: u64, gated: bool) -> bool {
        let adaptive = if self.history.is_empty() {
            EPS
        } else {
            let mean = self.history.iter().sum::<f32>() / self.history.len() as f32;
            median(&self.history) + threshold * mean + EPS
        };

        self.history.push_back(value);
        if self.history.len() > ODF_HISTORY {
            self.history.pop_front();
        }

        let above = !gated && value > adaptive;
        let rising = above && !self.above;
        self.above = above;

        let far_enough = self
            .last_onset
            .map_or(true, |last| frame.saturating_sub(last) >= min_ioi);

        if rising && far_enough {
            self.last_onset = Some(frame);
            true
        } else {
            false
        }
    }
}

/// Reference FFT-based analyzer. Stateful across frames (previous spectrum,
/// thresholds, onset history), never reaches into the pipeline.
pub struct SpectralAnalyzer {
    sample_rate: u32,
    frame_length: usize,
    settings: AnalyzerSettings,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    buffer: Vec<Complex<f32>>,
    prev_spectrum: Vec<Complex<f32>>,
    prev_phase: Vec<f32>,
    prev_prev_phase: Vec<f32>,
    prev_energy: f32,
    pickers: BTreeMap<OnsetMethod, PeakPicker>,
    onset_times: VecDeque<f32>,
    last_tempo_beat: Option<f32>,
    bpm: f32,
    frame_index: u64,
}

impl SpectralAnalyzer {
    pub fn new(sample_rate: u32, frame_length: usize) -> Self {
        Self::with_settings(sample_rate, frame_length, AnalyzerSettings::default())
    }

    pub fn with_settings(sample_rate: u32, frame_length: usize, settings: AnalyzerSettings) -> Self {
        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(frame_length);
        let half = frame_length / 2;

        Self {
            sample_rate,
            frame_length,
            settings,
            fft,
            window: hann_window(frame_length),
            buffer: vec![Complex::new(0.0, 0.0); frame_length],
            prev_spectrum: vec![Complex::new(0.0, 0.0); half],
            prev_phase: vec![0.0; half],
            prev_prev_phase: vec![0.0; half],
            prev_energy: 0.0,
            pickers: OnsetMethod::ALL
                .iter()
                .map(|&m| (m, PeakPicker::default()))
                .collect(),
            onset_times: VecDeque::with_capacity(ONSET_HISTORY),
            last_tempo_beat: None,
            bpm: 0.0,
            frame_index: 0,
        }
    }

    fn freq_resolution(&self) -> f32 {
        self.sample_rate as f32 / self.frame_length as f32
    }

    fn min_ioi_frames(&self) -> u64 {
        let frames = self.settings.min_ioi_ms / 1000.0 * self.sample_rate as f32 / self.frame_length as f32;
        frames.ceil().max(1.0) as u64
    }

    fn detection_functions(&self, spectrum: &[Complex<f32>], magnitudes: &[f32], phases: &[f32]) -> [(OnsetMethod, f32); 8] {
        let half = magnitudes.len();
        let energy: f32 = magnitudes.iter().map(|m| m * m).sum();
        let hfc: f32 = magnitudes.iter().enumerate().map(|(k, m)| k as f32 * m).sum();

        let mut flux = 0.0f32;
        let mut complex = 0.0f32;
        let mut phase_dev = 0.0f32;
        let mut wphase = 0.0f32;
        let mut kl = 0.0f32;
        let mut mkl = 0.0f32;

        for k in 0..half {
            let mag = magnitudes[k];
            let prev = &self.prev_spectrum[k];
            let prev_mag = prev.norm();

            flux += (mag - prev_mag).max(0.0);

            let expected_phase = 2.0 * self.prev_phase[k] - self.prev_prev_phase[k];
            let target = Complex::from_polar(prev_mag, expected_phase);
            complex += (spectrum[k] - target).norm();

            let deviation = princarg(phases[k] - expected_phase).abs();
            phase_dev += deviation;
            wphase += mag * deviation;

            kl += mag * (1.0 + mag / (prev_mag + EPS)).ln();
            mkl += (1.0 + mag / (prev_mag + EPS)).ln();
        }

        let n = half.max(1) as f32;
        [
            (OnsetMethod::Energy, (energy - self.prev_energy).max(0.0)),
            (OnsetMethod::Hfc, hfc),
            (OnsetMethod::Complex, complex),
            (OnsetMethod::Phase, phase_dev / n),
            (OnsetMethod::SpecFlux, flux),
            (OnsetMethod::WPhase, wphase / n),
            (OnsetMethod::Mkl, mkl),
            (OnsetMethod::Kl, kl),
        ]
    }

    /// Interpolated spectral peak. Confidence is the share of total power held
    /// by the peak bin and its two neighbours.
    fn detect_pitch(&self, magnitudes: &[f32], level_db: f32) -> Pitch {
        if level_db < self.settings.pitch_silence_db {
            return Pitch::default();
        }

        let freq_resolution = self.freq_resolution();
        let low_bin = ((MIN_PITCH_HZ / freq_resolution).ceil() as usize).max(1);
        if low_bin + 1 >= magnitudes.len() {
            return Pitch::default();
        }

        let (peak_bin, peak_mag) = magnitudes[low_bin..magnitudes.len() - 1]
            .iter()
            .enumerate()
            .fold((low_bin, 0.0f32), |best, (i, &m)| {
                if m > best.1 { (low_bin + i, m) } else { best }
            });

        let total_power: f32 = magnitudes.iter().map(|m| m * m).sum();
        if peak_mag <= EPS || total_power <= EPS {
            return Pitch::default();
        }

        let left = magnitudes[peak_bin - 1];
        let right = magnitudes[peak_bin + 1];
        let denom = left - 2.0 * peak_mag + right;
        let delta = if denom.abs() > EPS {
            (0.5 * (left - right) / denom).clamp(-0.5, 0.5)
        } else {
            0.0
        };

        let peak_power = left * left + peak_mag * peak_mag + right * right;
        let confidence = (peak_power / total_power).clamp(0.0, 1.0);

        Pitch::new((peak_bin as f32 + delta) * freq_resolution, confidence)
    }

    fn band_energies(&self, magnitudes: &[f32]) -> Vec<f32> {
        let freq_resolution = self.freq_resolution();
        let half = magnitudes.len();
        FREQ_BANDS
            .iter()
            .map(|&(low_hz, high_hz)| {
                let low_bin = (low_hz / freq_resolution).ceil() as usize;
                let high_bin = ((high_hz / freq_resolution) as usize + 1).min(half);
                if low_bin >= high_bin {
                    return 0.0;
                }
                let mean = magnitudes[low_bin..high_bin].iter().sum::<f32>() / (high_bin - low_bin) as f32;
                (mean * 5.0).min(1.0)
            })
            .collect()
    }

    /// Median inter-onset interval of recent onsets, in BPM. Needs four onsets.
    fn estimate_tempo(&self) -> f32 {
        if self.onset_times.len() < 4 {
            return 0.0;
        }

        let mut intervals: Vec<f32> = self
            .onset_times
            .iter()
            .zip(self.onset_times.iter().skip(1))
            .map(|(a, b)| b - a)
            .filter(|&i| i > 0.2 && i < 2.0)
            .collect();

        if intervals.is_empty() {
            return 0.0;
        }

        intervals.sort_by(f32::total_cmp);
        let mid = intervals.len() / 2;
        let median_interval = if intervals.len() % 2 == 0 {
            (intervals[mid - 1] + intervals[mid]) * 0.5
        } else {
            intervals[mid]
        };

        60.0 / median_interval
    }
}

impl Analyzer for SpectralAnalyzer {
    fn analyze(&mut self, frame: &[f32]) -> Result<FrameResult, AnalyzerError> {
        if frame.len() != self.frame_length {
            return Err(AnalyzerError::FrameLength {
                expected: self.frame_length,
                actual: frame.len(),
            });
        }
        if let Some(idx) = frame.iter().position(|s| !s.is_finite()) {
            return Err(AnalyzerError::NonFinite(idx));
        }

        let frame_idx = self.frame_index;
        self.frame_index += 1;
        let time = frame_idx as f32 * self.frame_length as f32 / self.sample_rate as f32;

        let mean_square = frame.iter().map(|s| s * s).sum::<f32>() / frame.len() as f32;
        let loudness = mean_square.sqrt();
        let level_db = 10.0 * (mean_square + EPS).log10();

        for (i, (slot, &s)) in self.buffer.iter_mut().zip(frame.iter()).enumerate() {
            *slot = Complex::new(s * self.window[i], 0.0);
        }
        self.fft.process(&mut self.buffer);

        // Scale so a full-scale sine peaks near 0.5 after the Hann window
        let half = self.frame_length / 2;
        let scale = 2.0 / self.frame_length as f32;
        let spectrum: Vec<Complex<f32>> = self.buffer[..half].iter().map(|&c| c * scale).collect();
        let magnitudes: Vec<f32> = spectrum.iter().map(|c| c.norm()).collect();
        let phases: Vec<f32> = spectrum.iter().map(|c| c.arg()).collect();

        let gated = level_db < self.settings.onset_silence_db;
        let min_ioi = self.min_ioi_frames();
        let threshold = self.settings.onset_threshold;

        let odfs = self.detection_functions(&spectrum, &magnitudes, &phases);
        let mut onsets = OnsetFlags::new();
        for (method, value) in odfs {
            let fired = self
                .pickers
                .get_mut(&method)
                .map_or(false, |p| p.push(value, frame_idx, threshold, min_ioi, gated));
            onsets.insert(method, fired);
        }
        let any_onset = onsets.values().any(|&v| v);

        let mut tempo_flag = false;
        if any_onset {
            self.onset_times.push_back(time);
            if self.onset_times.len() > ONSET_HISTORY {
                self.onset_times.pop_front();
            }
            self.bpm = self.estimate_tempo();
            if self.bpm > 0.0 {
                let period = 60.0 / self.bpm;
                tempo_flag = self
                    .last_tempo_beat
                    .map_or(true, |last| time - last >= 0.9 * period);
                if tempo_flag {
                    self.last_tempo_beat = Some(time);
                }
            }
        }

        let pitch = self.detect_pitch(&magnitudes, level_db);
        let mut notes = Vec::new();
        if any_onset && pitch.value > 0.0 && pitch.confidence >= self.settings.note_confidence {
            notes.push(hz_to_midi(pitch.value));
        }

        let bands = self.band_energies(&magnitudes);

        self.prev_energy = magnitudes.iter().map(|m| m * m).sum();
        self.prev_prev_phase = std::mem::replace(&mut self.prev_phase, phases);
        self.prev_spectrum = spectrum;

        Ok(FrameResult {
            onsets,
            tempo_flag,
            bpm: self.bpm,
            pitch,
            notes,
            loudness,
            bands,
        })
    }
}

pub fn hz_to_midi(hz: f32) -> f32 {
    (69.0 + 12.0 * (hz / 440.0).log2()).round()
}

fn princarg(phase: f32) -> f32 {
    (phase + PI).rem_euclid(2.0 * PI) - PI
}

fn median(values: &VecDeque<f32>) -> f32 {
    let mut sorted: Vec<f32> = values.iter().copied().collect();
    sorted.sort_by(f32::total_cmp);
    sorted[sorted.len() / 2]
}

fn hann_window(size: usize) -> Vec<f32> {
    if size < 2 {
        return vec![1.0; size];
    }
    (0..size)
        .map(|i| {
            0.5 * (1.0 - (2.0 * PI * i as f32 / (size - 1) as f32).cos())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: u32 = 44100;

    fn sine(freq: f32, amplitude: f32, len: usize, offset: usize) -> Vec<f32> {
        (0..len)
            .map(|i| amplitude * (2.0 * PI * freq * (i + offset) as f32 / SR as f32).sin())
            .collect()
    }

    #[test]
    fn silence_has_no_detections() {
        let mut analyzer = SpectralAnalyzer::new(SR, 512);
        for _ in 0..5 {
            let result = analyzer.analyze(&vec![0.0; 512]).unwrap();
            assert_eq!(result.loudness, 0.0);
            assert!(result.onsets.values().all(|&v| !v));
            assert_eq!(result.pitch, Pitch::default());
            assert!(result.notes.is_empty());
            assert_eq!(result.onsets.len(), OnsetMethod::ALL.len());
        }
    }

    #[test]
    fn burst_after_silence_fires_energy_onset() {
        let mut analyzer = SpectralAnalyzer::new(SR, 512);
        for _ in 0..8 {
            analyzer.analyze(&vec![0.0; 512]).unwrap();
        }
        let result = analyzer.analyze(&sine(440.0, 0.8, 512, 0)).unwrap();
        assert!(result.onset(OnsetMethod::Energy));
        assert!(result.onset(OnsetMethod::SpecFlux));
        assert!(result.loudness > 0.5);
    }

    #[test]
    fn sine_pitch_is_found_with_high_confidence() {
        let mut analyzer = SpectralAnalyzer::new(SR, 2048);
        let result = analyzer.analyze(&sine(440.0, 0.5, 2048, 0)).unwrap();
        assert!((result.pitch.value - 440.0).abs() < 15.0, "pitch {}", result.pitch.value);
        assert!(result.pitch.confidence > 0.8, "confidence {}", result.pitch.confidence);
    }

    #[test]
    fn loudness_is_frame_rms() {
        let mut analyzer = SpectralAnalyzer::new(SR, 512);
        let result = analyzer.analyze(&vec![0.25; 512]).unwrap();
        assert!((result.loudness - 0.25).abs() < 1e-6);
    }

    #[test]
    fn bands_are_bounded() {
        let mut analyzer = SpectralAnalyzer::new(SR, 1024);
        let result = analyzer.analyze(&sine(60.0, 1.0, 1024, 0)).unwrap();
        assert_eq!(result.bands.len(), FREQ_BANDS.len());
        assert!(result.bands.iter().all(|&b| (0.0..=1.0).contains(&b)));
        assert!(result.bands[0] > result.bands[7]);
    }

    #[test]
    fn rejects_wrong_frame_length() {
        let mut analyzer = SpectralAnalyzer::new(SR, 512);
        let err = analyzer.analyze(&vec![0.0; 256]).unwrap_err();
        assert!(matches!(err, AnalyzerError::FrameLength { expected: 512, actual: 256 }));
    }

    #[test]
    fn rejects_non_finite_samples() {
        let mut analyzer = SpectralAnalyzer::new(SR, 512);
        let mut frame = vec![0.0; 512];
        frame[17] = f32::NAN;
        assert!(matches!(analyzer.analyze(&frame), Err(AnalyzerError::NonFinite(17))));
    }

    #[test]
    fn midi_conversion() {
        assert_eq!(hz_to_midi(440.0), 69.0);
        assert_eq!(hz_to_midi(880.0), 81.0);
        assert_eq!(hz_to_midi(261.63), 60.0);
    }
}
