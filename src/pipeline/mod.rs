//! Rate-decoupling pipeline.
//!
//! An acquisition thread pulls frames from the source, analyzes them and
//! appends the results to the [`FrameBuffer`] at the native frame rate. The
//! calling thread runs the flush loop: on every deadline of a fixed-period
//! [`Ticker`] it drains the buffer, fuses the window and publishes the summary.
//! Both loops stop on a single shutdown signal, after which one final flush
//! covers whatever is still buffered.

pub mod buffer;
pub mod fusion;
pub mod normalizer;
pub mod schedule;

use chrono::Utc;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crate::audio::analysis::Analyzer;
use crate::audio::source::FrameSource;
use crate::config::PipelineConfig;
use crate::error::SourceError;
use crate::sink::Sink;
use buffer::FrameBuffer;
use normalizer::NormalizerState;
use schedule::Ticker;

#[derive(Debug)]
pub enum ShutdownReason {
    Requested,
    SourceExhausted,
    SourceLost(SourceError),
}

/// Stops a running pipeline from any thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    stop: Arc<AtomicBool>,
    tx: Sender<ShutdownReason>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        let _ = self.tx.send(ShutdownReason::Requested);
    }

    /// Callback for `ctrlc::set_handler`: every signal requests a clean shutdown.
    pub fn on_signal(self) -> impl FnMut() + Send + 'static {
        move || {
            log::info!("Interrupt received, flushing and shutting down");
            self.shutdown();
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct RunReport {
    pub frames_analyzed: u64,
    pub frames_dropped: u64,
    pub summaries_published: u64,
    pub publish_failures: u64,
    pub empty_ticks: u64,
    pub skipped_ticks: u64,
}

#[derive(Debug, Default)]
struct AcquisitionStats {
    analyzed: u64,
    dropped: u64,
}

/// Everything the flush activity owns for one run.
pub struct PipelineState {
    pub buffer: Arc<FrameBuffer>,
    pub normalizer: NormalizerState,
    pub next_seq: u64,
}

impl PipelineState {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            buffer: Arc::new(FrameBuffer::new()),
            normalizer: NormalizerState::new(config),
            next_seq: 0,
        }
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    stop: Arc<AtomicBool>,
    tx: Sender<ShutdownReason>,
    rx: Receiver<ShutdownReason>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            config,
            stop: Arc::new(AtomicBool::new(false)),
            tx,
            rx,
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            stop: Arc::clone(&self.stop),
            tx: self.tx.clone(),
        }
    }

    /// Run until the source is exhausted or lost, or shutdown is requested.
    /// Source loss is returned as an error after the clean shutdown sequence.
    pub fn run<S, A, K>(self, source: S, analyzer: A, sink: &mut K) -> Result<RunReport, SourceError>
    where
        S: FrameSource + Send + 'static,
        A: Analyzer + Send + 'static,
        K: Sink + ?Sized,
    {
        let builder = thread::Builder::new().name("acquisition".into());
        self.run_on(builder, source, analyzer, sink)
    }

    fn run_on<S, A, K>(
        self,
        builder: thread::Builder,
        source: S,
        analyzer: A,
        sink: &mut K,
    ) -> Result<RunReport, SourceError>
    where
        S: FrameSource + Send + 'static,
        A: Analyzer + Send + 'static,
        K: Sink + ?Sized,
    {
        let mut state = PipelineState::new(&self.config);
        let mut report = RunReport::default();

        log::info!(
            "Pipeline starting: publish {:.1}Hz, frames of {} @ {}Hz ({:.1}Hz native, ~{:.1} frames/tick)",
            self.config.publish_rate,
            self.config.frame_length,
            self.config.sample_rate,
            self.config.native_rate(),
            self.config.expected_frames_per_tick()
        );

        let spawned = builder.spawn({
            let buffer = Arc::clone(&state.buffer);
            let stop = Arc::clone(&self.stop);
            let tx = self.tx.clone();
            move || acquire(source, analyzer, &buffer, &stop, &tx)
        });
        // A failed spawn drops the source with the closure
        let acquisition = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                log::error!("Failed to start acquisition thread: {}", err);
                if let Err(err) = sink.close() {
                    log::warn!("Failed to close sink: {}", err);
                }
                return Err(SourceError::Acquisition(err));
            }
        };

        let mut ticker = Ticker::new(Instant::now(), self.config.publish_period());
        let reason = loop {
            match self.rx.recv_deadline(ticker.deadline()) {
                Err(RecvTimeoutError::Timeout) => {
                    self.flush(&mut state, sink, &mut report);
                    let skipped = ticker.advance(Instant::now());
                    if skipped > 0 {
                        log::debug!("Flush loop fell behind, collapsed {} ticks", skipped);
                        report.skipped_ticks += skipped;
                    }
                }
                Ok(reason) => break reason,
                Err(RecvTimeoutError::Disconnected) => break ShutdownReason::Requested,
            }
        };

        // Stop acquisition and wait for it to release the source
        self.stop.store(true, Ordering::Release);
        let stats = acquisition.join().unwrap_or_else(|_| {
            log::error!("Acquisition thread panicked");
            AcquisitionStats::default()
        });
        report.frames_analyzed = stats.analyzed;
        report.frames_dropped = stats.dropped;

        self.flush(&mut state, sink, &mut report);
        if let Err(err) = sink.close() {
            log::warn!("Failed to close sink: {}", err);
        }

        log::info!(
            "Pipeline stopped ({}): {} frames analyzed, {} dropped, {} summaries published, {} publish failures, {} empty ticks",
            describe(&reason),
            report.frames_analyzed,
            report.frames_dropped,
            report.summaries_published,
            report.publish_failures,
            report.empty_ticks
        );

        match reason {
            ShutdownReason::SourceLost(err) => Err(err),
            ShutdownReason::Requested | ShutdownReason::SourceExhausted => Ok(report),
        }
    }

    fn flush<K: Sink + ?Sized>(&self, state: &mut PipelineState, sink: &mut K, report: &mut RunReport) {
        let frames = state.buffer.drain_and_reset();
        let summary = fusion::combine(
            &frames,
            &mut state.normalizer,
            &self.config.fusion,
            state.next_seq,
            Utc::now(),
        );

        let Some(summary) = summary else {
            report.empty_ticks += 1;
            log::trace!("Empty tick, nothing to publish");
            return;
        };

        state.next_seq += 1;
        log::debug!(
            "Summary {}: {} frames, volume={:.3}, bpm={:.1}, pitch={:.1}Hz",
            summary.seq,
            summary.frames,
            summary.volume,
            summary.bpm,
            summary.pitch.value
        );

        match sink.publish(&summary) {
            Ok(()) => report.summaries_published += 1,
            Err(_) => report.publish_failures += 1,
        }
    }
}

fn describe(reason: &ShutdownReason) -> String {
    match reason {
        ShutdownReason::Requested => "shutdown requested".into(),
        ShutdownReason::SourceExhausted => "source exhausted".into(),
        ShutdownReason::SourceLost(err) => err.to_string(),
    }
}

fn acquire<S: FrameSource, A: Analyzer>(
    mut source: S,
    mut analyzer: A,
    buffer: &FrameBuffer,
    stop: &AtomicBool,
    tx: &Sender<ShutdownReason>,
) -> AcquisitionStats {
    let mut stats = AcquisitionStats::default();
    let mut index = 0u64;

    let reason = loop {
        if stop.load(Ordering::Acquire) {
            break None;
        }
        match source.next_frame() {
            Ok(Some(samples)) => {
                match analyzer.analyze(&samples) {
                    Ok(result) => {
                        buffer.append(result);
                        stats.analyzed += 1;
                    }
                    Err(err) => {
                        log::warn!("Dropping frame {}: {}", index, err);
                        stats.dropped += 1;
                    }
                }
                index += 1;
            }
            Ok(None) => {
                log::info!("Source exhausted after {} frames", index);
                break Some(ShutdownReason::SourceExhausted);
            }
            Err(err) => {
                log::error!("Frame source failed: {}", err);
                break Some(ShutdownReason::SourceLost(err));
            }
        }
    };

    drop(source);
    if let Some(reason) = reason {
        let _ = tx.send(reason);
    }
    stats
}
