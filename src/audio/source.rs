use indicatif::ProgressBar;
use std::path::Path;
use std::time::{Duration, Instant};

use super::decode::decode_audio;
use crate::error::SourceError;

/// Blocking supplier of fixed-size mono frames.
pub trait FrameSource {
    /// Next frame, `Ok(None)` once the source is exhausted.
    fn next_frame(&mut self) -> Result<Option<Vec<f32>>, SourceError>;

    fn sample_rate(&self) -> u32;

    fn frame_length(&self) -> usize;
}

/// Replays decoded samples as frames, paced at the native frame rate.
pub struct FileSource {
    samples: Vec<f32>,
    sample_rate: u32,
    frame_length: usize,
    position: usize,
    /// Wall-clock spacing between frames; `None` delivers as fast as asked
    frame_period: Option<Duration>,
    started: Option<Instant>,
    delivered: u64,
    progress: Option<ProgressBar>,
}

impl FileSource {
    /// Decode `path` into an unpaced source; see [`FileSource::paced`].
    pub fn open(path: &Path, frame_length: usize) -> Result<Self, SourceError> {
        let audio = decode_audio(path).map_err(|e| SourceError::Open(format!("{:#}", e)))?;
        Ok(Self::from_samples(audio.samples, audio.sample_rate, frame_length))
    }

    /// Unpaced source over in-memory samples.
    pub fn from_samples(samples: Vec<f32>, sample_rate: u32, frame_length: usize) -> Self {
        Self {
            samples,
            sample_rate,
            frame_length,
            position: 0,
            frame_period: None,
            started: None,
            delivered: 0,
            progress: None,
        }
    }

    /// Deliver one frame per `period`, measured from the first frame.
    pub fn paced(mut self, period: Duration) -> Self {
        self.frame_period = Some(period);
        self
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn total_frames(&self) -> usize {
        if self.frame_length == 0 {
            return 0;
        }
        self.samples.len().div_ceil(self.frame_length)
    }

    /// Sleep until frame `delivered` is due, measured from the first frame.
    fn pace(&mut self) {
        let Some(period) = self.frame_period else {
            return;
        };
        let started = *self.started.get_or_insert_with(Instant::now);
        let due = started + period.mul_f64(self.delivered as f64);
        let now = Instant::now();
        if due > now {
            std::thread::sleep(due - now);
        }
    }
}

impl FrameSource for FileSource {
    fn next_frame(&mut self) -> Result<Option<Vec<f32>>, SourceError> {
        if self.frame_length == 0 || self.position >= self.samples.len() {
            if let Some(pb) = self.progress.take() {
                pb.finish_with_message("replay complete");
            }
            return Ok(None);
        }

        self.pace();

        let end = (self.position + self.frame_length).min(self.samples.len());
        let mut frame = self.samples[self.position..end].to_vec();
        // Zero-pad the tail
        frame.resize(self.frame_length, 0.0);
        self.position = end;
        self.delivered += 1;

        if let Some(ref pb) = self.progress {
            pb.inc(1);
        }
        Ok(Some(frame))
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn frame_length(&self) -> usize {
        self.frame_length
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slices_samples_into_padded_frames() {
        let samples: Vec<f32> = (0..10).map(|i| i as f32).collect();
        let mut source = FileSource::from_samples(samples, 8000, 4);
        assert_eq!(source.total_frames(), 3);

        assert_eq!(source.next_frame().unwrap(), Some(vec![0.0, 1.0, 2.0, 3.0]));
        assert_eq!(source.next_frame().unwrap(), Some(vec![4.0, 5.0, 6.0, 7.0]));
        assert_eq!(source.next_frame().unwrap(), Some(vec![8.0, 9.0, 0.0, 0.0]));
        assert_eq!(source.next_frame().unwrap(), None);
        assert_eq!(source.next_frame().unwrap(), None);
    }

    #[test]
    fn paced_replay_follows_the_native_rate() {
        let mut source = FileSource::from_samples(vec![0.0; 4 * 6], 1000, 4).paced(Duration::from_millis(4));

        let start = Instant::now();
        while source.next_frame().unwrap().is_some() {}
        // Six frames: the first is immediate, five more at 4ms spacing
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn missing_file_fails_to_open() {
        let err = FileSource::open(Path::new("/nonexistent/input.wav"), 512);
        assert!(matches!(err, Err(SourceError::Open(_))));
    }
}
