use std::io::Write;

use anyhow::Error;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Destination for drained ring buffer messages.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn log_event(&self, event: Value) -> Result<(), Error>;
    async fn flush(&self) -> Result<(), Error>;
}

/// One ring buffer message as written to the sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageJson {
    pub seq: u64,
    pub timestamp: String,
    pub len: usize,
    /// Raw message bytes, base64 encoded.
    pub payload: String,
}

impl MessageJson {
    pub fn new(seq: u64, payload: &[u8]) -> Self {
        MessageJson {
            seq,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            len: payload.len(),
            payload: STANDARD.encode(payload),
        }
    }
}

/// Writes events as JSON lines, buffering up to `flush_every` of them.
pub struct JsonLinesSink<W> {
    writer: Mutex<W>,
    pending: Mutex<Vec<Value>>,
    flush_every: usize,
}

impl<W: Write + Send> JsonLinesSink<W> {
    /// A `flush_every` of 0 or 1 writes every event immediately.
    pub fn new(writer: W, flush_every: usize) -> Self {
        JsonLinesSink {
            writer: Mutex::new(writer),
            pending: Mutex::new(Vec::new()),
            flush_every: flush_every.max(1),
        }
    }

    /// Hands back the writer. Events still pending are dropped.
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait]
impl<W: Write + Send> EventSink for JsonLinesSink<W> {
    async fn log_event(&self, event: Value) -> Result<(), Error> {
        let pending = {
            let mut batch = self.pending.lock().await;
            batch.push(event);
            batch.len()
        };
        if pending >= self.flush_every {
            self.flush().await?;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), Error> {
        let batch = std::mem::take(&mut *self.pending.lock().await);
        if batch.is_empty() {
            return Ok(());
        }
        let mut writer = self.writer.lock().await;
        for event in &batch {
            serde_json::to_writer(&mut *writer, event)?;
            writer.write_all(b"\n")?;
        }
        if let Err(e) = writer.flush() {
            warn!("Failed to flush event writer: {}", e);
            return Err(e.into());
        }
        debug!("Flushed {} events", batch.len());
        Ok(())
    }
}
