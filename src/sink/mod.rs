use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::time::Duration;

use crate::audio::features::FusedSummary;
use crate::config::SinkConfig;
use crate::error::SinkError;

/// Destination for fused summaries. Called once per non-empty flush; the
/// pipeline does not retry or re-queue a failed publish.
pub trait Sink {
    fn publish(&mut self, summary: &FusedSummary) -> Result<(), SinkError>;

    /// Release the connection or flush the file. Called once at shutdown.
    fn close(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

impl<S: Sink + ?Sized> Sink for Box<S> {
    fn publish(&mut self, summary: &FusedSummary) -> Result<(), SinkError> {
        (**self).publish(summary)
    }

    fn close(&mut self) -> Result<(), SinkError> {
        (**self).close()
    }
}

/// One JSON object per line.
pub struct JsonLinesSink<W: Write> {
    writer: W,
    label: String,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W, label: impl Into<String>) -> Self {
        Self {
            writer,
            label: label.into(),
        }
    }

    fn write_line(&mut self, summary: &FusedSummary) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(summary)?;
        line.push(b'\n');
        self.writer.write_all(&line)?;
        self.writer.flush()?;
        Ok(())
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> Sink for JsonLinesSink<W> {
    fn publish(&mut self, summary: &FusedSummary) -> Result<(), SinkError> {
        self.write_line(summary).inspect_err(|err| {
            log::warn!("Failed to write summary {} to {}: {}", summary.seq, self.label, err);
        })
    }

    fn close(&mut self) -> Result<(), SinkError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// POSTs each summary as JSON.
pub struct HttpSink {
    client: reqwest::blocking::Client,
    url: String,
}

impl HttpSink {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    fn post(&self, summary: &FusedSummary) -> Result<(), SinkError> {
        let body = serde_json::to_vec(summary)?;
        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .map_err(|e| SinkError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SinkError::Status(status.as_u16()));
        }
        Ok(())
    }
}

impl Sink for HttpSink {
    fn publish(&mut self, summary: &FusedSummary) -> Result<(), SinkError> {
        self.post(summary).inspect_err(|err| {
            log::warn!("Failed to deliver summary {} to {}: {}", summary.seq, self.url, err);
        })
    }
}

pub fn build_sink(config: &SinkConfig) -> Result<Box<dyn Sink>> {
    config.validate()?;
    let sink: Box<dyn Sink> = match config.kind.as_str() {
        "file" => {
            let path = config.path.as_ref().context("File sink requires a path")?;
            let file = File::create(path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            log::info!("Writing summaries to {}", path.display());
            Box::new(JsonLinesSink::new(BufWriter::new(file), path.display().to_string()))
        }
        "http" => {
            let url = config.url.as_deref().context("HTTP sink requires a url")?;
            log::info!("Posting summaries to {}", url);
            Box::new(HttpSink::new(url, Duration::from_millis(config.timeout_ms))?)
        }
        _ => Box::new(JsonLinesSink::new(std::io::stdout(), "stdout")),
    };
    Ok(sink)
}
