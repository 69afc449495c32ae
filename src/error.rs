use thiserror::Error;

/// Rejected configuration. Raised before any pipeline activity starts.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("publish rate must be a positive number of Hz with a representable period, got {0}")]
    PublishRate(f32),
    #[error("frame length must be non-zero")]
    FrameLength,
    #[error("sample rate must be non-zero")]
    SampleRate,
    #[error("replay speed must be positive with a representable frame period, got {0}")]
    ReplaySpeed(f32),
    #[error("loudness history capacity must be non-zero")]
    HistoryCapacity,
    #[error("{name} must be a finite non-negative number, got {value}")]
    Threshold { name: &'static str, value: f32 },
    #[error("gain smoothing factor must be in [0, 1), got {0}")]
    Smoothing(f32),
    #[error("gain bounds invalid: min={min}, max={max}")]
    GainBounds { min: f32, max: f32 },
    #[error("gain window must be positive, got {0}s")]
    GainWindow(f32),
    #[error("sink '{kind}' requires {field}")]
    SinkTarget { kind: String, field: &'static str },
    #[error("unknown sink kind '{0}' (expected stdout, file or http)")]
    SinkKind(String),
}

/// Failure of the frame source. Exhaustion is not an error.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to open source: {0}")]
    Open(String),
    #[error("source lost: {0}")]
    Lost(String),
    #[error("failed to start acquisition: {0}")]
    Acquisition(std::io::Error),
}

/// Per-frame analyzer failure. The offending frame is dropped.
#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("frame has {actual} samples, expected {expected}")]
    FrameLength { expected: usize, actual: usize },
    #[error("non-finite sample at index {0}")]
    NonFinite(usize),
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize summary: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("HTTP delivery failed: {0}")]
    Http(String),
    #[error("HTTP endpoint answered {0}")]
    Status(u16),
}
