//! Frame sources and the producer loop
//!
//! A [`FrameSource`] yields raw text frames; [`run_producer`] decodes them
//! and pushes records into the live channel until EOF or cancellation.

use super::FrameDecoder;
use crate::config::defaults;
use crate::types::MeasurementRecord;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Events produced by a frame source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    /// One frame of text, without the line terminator.
    Frame(String),
    /// Source reached end of data.
    Eof,
}

/// Where frames come from (radio bridge serial line, mesh coordinator, stdin).
#[async_trait]
pub trait FrameSource: Send + 'static {
    /// Read the next frame. `Err` on source I/O errors; the producer
    /// retries a few times before giving up on the source.
    async fn next_frame(&mut self) -> Result<FrameEvent>;

    /// Human-readable name for logging (e.g. "stdin", "/dev/ttyAMA0").
    fn source_name(&self) -> &str;
}

// ============================================================================
// Line Source (stdin, serial device, file)
// ============================================================================

/// One frame per non-empty line. Lines that are not valid UTF-8 (line
/// noise on a serial port) are logged and skipped.
pub struct LineSource<R> {
    reader: BufReader<R>,
    line_buffer: Vec<u8>,
    name: String,
}

impl<R: AsyncRead + Unpin + Send + 'static> LineSource<R> {
    pub fn new(reader: R, name: impl Into<String>) -> Self {
        Self {
            reader: BufReader::new(reader),
            line_buffer: Vec::with_capacity(256),
            name: name.into(),
        }
    }
}

impl LineSource<tokio::io::Stdin> {
    pub fn stdin() -> Self {
        Self::new(tokio::io::stdin(), "stdin")
    }
}

impl LineSource<tokio::fs::File> {
    /// Open a device node or capture file.
    pub async fn open(path: &Path) -> Result<Self> {
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("Failed to open frame source {}", path.display()))?;
        Ok(Self::new(file, path.display().to_string()))
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send + 'static> FrameSource for LineSource<R> {
    async fn next_frame(&mut self) -> Result<FrameEvent> {
        loop {
            self.line_buffer.clear();
            let bytes = self.reader.read_until(b'\n', &mut self.line_buffer).await?;
            if bytes == 0 {
                return Ok(FrameEvent::Eof);
            }
            let line = match std::str::from_utf8(&self.line_buffer) {
                Ok(line) => line.trim(),
                Err(e) => {
                    warn!(source = %self.name, bytes, error = %e, "Non-UTF-8 line from source, skipping");
                    continue;
                }
            };
            if !line.is_empty() {
                return Ok(FrameEvent::Frame(line.to_string()));
            }
        }
    }

    fn source_name(&self) -> &str {
        &self.name
    }
}

// ============================================================================
// Producer
// ============================================================================

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct ProducerStats {
    pub frames: u64,
    pub decoded: u64,
    pub rejected: u64,
    pub source_errors: u64,
}

/// Read, decode and forward frames until EOF, cancellation, or the live
/// channel closing.
///
/// Source errors are retried after a short pause; only
/// `SOURCE_ERROR_LIMIT` consecutive failures end the producer with `Err`.
pub async fn run_producer<S, D>(
    mut source: S,
    decoder: D,
    sender: UnboundedSender<MeasurementRecord>,
    cancel: CancellationToken,
) -> Result<ProducerStats>
where
    S: FrameSource,
    D: FrameDecoder,
{
    let mut stats = ProducerStats::default();
    let mut consecutive_errors = 0u32;
    let name = source.source_name().to_string();
    let retry = Duration::from_millis(defaults::SOURCE_RETRY_MS);
    info!(source = %name, decoder = decoder.name(), "Producer started");

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = source.next_frame() => event,
        };

        let event = match event {
            Ok(event) => {
                consecutive_errors = 0;
                event
            }
            Err(e) => {
                stats.source_errors += 1;
                consecutive_errors += 1;
                if consecutive_errors >= defaults::SOURCE_ERROR_LIMIT {
                    return Err(e).with_context(|| {
                        format!("Frame source {} failed {} times in a row", name, consecutive_errors)
                    });
                }
                warn!(
                    source = %name,
                    error = %e,
                    attempt = consecutive_errors,
                    retry_ms = retry.as_millis() as u64,
                    "Frame source error, retrying"
                );
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(retry) => continue,
                }
            }
        };

        let frame = match event {
            FrameEvent::Frame(frame) => frame,
            FrameEvent::Eof => {
                info!(source = %name, "Frame source reached EOF");
                break;
            }
        };
        stats.frames += 1;

        match decoder.decode(&frame) {
            Ok(record) => {
                debug!(device = record.device_id(), kind = record.type_tag(), "Frame decoded");
                if sender.send(record).is_err() {
                    warn!("Live channel closed, stopping producer");
                    break;
                }
                stats.decoded += 1;
            }
            Err(e) => {
                stats.rejected += 1;
                warn!(
                    source = %name,
                    error = %e,
                    frame = %frame,
                    "Frame rejected"
                );
            }
        }
    }

    info!(
        frames = stats.frames,
        decoded = stats.decoded,
        rejected = stats.rejected,
        source_errors = stats.source_errors,
        "Producer stopped"
    );
    Ok(stats)
}
