use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::audio::features::FrameResult;

/// Frames accumulated since the last flush.
///
/// Appends and drains take the same lock, and a drain swaps the live vector for
/// an empty one, so every appended frame is returned by exactly one drain.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    frames: Mutex<Vec<FrameResult>>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<FrameResult>> {
        // A panicking holder cannot leave the Vec half-written
        self.frames.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn append(&self, frame: FrameResult) {
        self.lock().push(frame);
    }

    pub fn drain_and_reset(&self) -> Vec<FrameResult> {
        std::mem::take(&mut *self.lock())
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn tagged(i: usize) -> FrameResult {
        FrameResult::quiet(i as f32)
    }

    #[test]
    fn drain_returns_frames_in_order_and_resets() {
        let buffer = FrameBuffer::new();
        for i in 0..5 {
            buffer.append(tagged(i));
        }
        let drained: Vec<f32> = buffer.drain_and_reset().iter().map(|f| f.loudness).collect();
        assert_eq!(drained, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
        assert!(buffer.is_empty());
        assert!(buffer.drain_and_reset().is_empty());
    }

    #[test]
    fn interleaved_drains_neither_lose_nor_duplicate() {
        let buffer = FrameBuffer::new();
        let mut seen = Vec::new();
        let mut next = 0;
        // Irregular pattern of appends between drains, including empty drains
        for burst in [3, 0, 1, 7, 0, 0, 2, 11, 1] {
            for _ in 0..burst {
                buffer.append(tagged(next));
                next += 1;
            }
            seen.extend(buffer.drain_and_reset().into_iter().map(|f| f.loudness as usize));
        }
        assert_eq!(seen, (0..next).collect::<Vec<_>>());
    }

    #[test]
    fn concurrent_appends_and_drains_account_for_every_frame() {
        const N: usize = 20_000;
        let buffer = Arc::new(FrameBuffer::new());

        let producer = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || {
                for i in 0..N {
                    buffer.append(tagged(i));
                }
            })
        };

        let mut seen = Vec::with_capacity(N);
        while seen.len() < N {
            seen.extend(buffer.drain_and_reset().into_iter().map(|f| f.loudness as usize));
            thread::yield_now();
        }
        producer.join().unwrap();
        seen.extend(buffer.drain_and_reset().into_iter().map(|f| f.loudness as usize));

        assert_eq!(seen, (0..N).collect::<Vec<_>>());
    }
}
