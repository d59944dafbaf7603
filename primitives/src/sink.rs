//! Stream sinks: `write(event)` / `close()` endpoints for fanned-out events.
//!
//! Each sink is owned uniquely by the stream runner, so its lifetime ends
//! deterministically at `close`.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::SinkExt;
use serde::Deserialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("file sink io at '{path}': {reason}")]
    File { path: String, reason: String },
    #[error("websocket sink: {0}")]
    WebSocket(String),
}

/// A write endpoint for streamed events.
#[async_trait]
pub trait Sink: Send {
    /// Deliver one event payload.
    async fn write(&mut self, event: &str) -> Result<(), SinkError>;
    /// Flush and release. Called exactly once, even after write errors.
    async fn close(&mut self) -> Result<(), SinkError>;
    /// Stable kind name used in `stream_destinations`.
    fn kind(&self) -> &'static str;
}

// ---------------------------------------------------------------------------
// ReturnSink
// ---------------------------------------------------------------------------

/// Default bound on the return buffer.
pub const DEFAULT_RETURN_BUFFER: usize = 10_000;

/// Shared view of a [`ReturnSink`]'s buffer, held by the caller that needs
/// the events back after the stream closes.
#[derive(Debug, Clone, Default)]
pub struct ReturnBuffer {
    events: Arc<Mutex<Vec<String>>>,
}

impl ReturnBuffer {
    #[must_use]
    pub fn snapshot(&self) -> Vec<String> {
        self.events.lock().expect("return buffer poisoned").clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().expect("return buffer poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory bounded buffer; drops events silently past `max_size`.
pub struct ReturnSink {
    buffer: ReturnBuffer,
    max_size: usize,
}

impl ReturnSink {
    /// Returns the sink and the handle the caller keeps.
    #[must_use]
    pub fn new(max_size: usize) -> (Self, ReturnBuffer) {
        let buffer = ReturnBuffer::default();
        (
            Self {
                buffer: buffer.clone(),
                max_size,
            },
            buffer.clone(),
        )
    }
}

#[async_trait]
impl Sink for ReturnSink {
    async fn write(&mut self, event: &str) -> Result<(), SinkError> {
        let mut events = self.buffer.events.lock().expect("return buffer poisoned");
        if events.len() < self.max_size {
            events.push(event.to_string());
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "return"
    }
}

// ---------------------------------------------------------------------------
// FileSink
// ---------------------------------------------------------------------------

/// On-disk event format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileFormat {
    #[default]
    Jsonl,
    Raw,
}

/// Appends events to a file, flushing every `flush_every` events and on
/// close. `jsonl` re-serializes each event as canonical JSON, falling back
/// to the raw line when the event is not valid JSON.
pub struct FileSink {
    path: PathBuf,
    format: FileFormat,
    flush_every: usize,
    pending: usize,
    writer: Option<tokio::io::BufWriter<tokio::fs::File>>,
}

impl FileSink {
    pub const DEFAULT_FLUSH_EVERY: usize = 10;

    #[must_use]
    pub fn new(path: PathBuf, format: FileFormat, flush_every: usize) -> Self {
        Self {
            path,
            format,
            flush_every: flush_every.max(1),
            pending: 0,
            writer: None,
        }
    }

    fn io_err(&self, e: std::io::Error) -> SinkError {
        SinkError::File {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        }
    }

    async fn writer(&mut self) -> Result<&mut tokio::io::BufWriter<tokio::fs::File>, SinkError> {
        if self.writer.is_none() {
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| self.io_err(e))?;
            }
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .map_err(|e| self.io_err(e))?;
            self.writer = Some(tokio::io::BufWriter::new(file));
        }
        Ok(self.writer.as_mut().expect("writer just created"))
    }
}

#[async_trait]
impl Sink for FileSink {
    async fn write(&mut self, event: &str) -> Result<(), SinkError> {
        let line = match self.format {
            FileFormat::Jsonl => serde_json::from_str::<serde_json::Value>(event)
                .map(|v| v.to_string())
                .unwrap_or_else(|_| event.to_string()),
            FileFormat::Raw => event.to_string(),
        };
        let flush_every = self.flush_every;
        let pending = self.pending + 1;
        let path = self.path.display().to_string();
        let writer = self.writer().await?;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| SinkError::File {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        writer
            .write_all(b"\n")
            .await
            .map_err(|e| SinkError::File {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        self.pending = pending;
        if self.pending >= flush_every {
            let writer = self.writer.as_mut().expect("writer present");
            writer.flush().await.map_err(|e| SinkError::File {
                path,
                reason: e.to_string(),
            })?;
            self.pending = 0;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        if let Some(mut writer) = self.writer.take() {
            let path = self.path.display().to_string();
            writer.flush().await.map_err(|e| SinkError::File {
                path: path.clone(),
                reason: e.to_string(),
            })?;
            writer
                .shutdown()
                .await
                .map_err(|e| SinkError::File {
                    path,
                    reason: e.to_string(),
                })?;
        }
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "file"
    }
}

// ---------------------------------------------------------------------------
// NullSink
// ---------------------------------------------------------------------------

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

#[async_trait]
impl Sink for NullSink {
    async fn write(&mut self, _event: &str) -> Result<(), SinkError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "null"
    }
}

// ---------------------------------------------------------------------------
// WebSocketSink
// ---------------------------------------------------------------------------

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Forwards events over a websocket with lazy connect, bounded buffering
/// while disconnected, and reconnect attempts on the next write.
pub struct WebSocketSink {
    url: String,
    reconnect_attempts: u32,
    buffer_on_disconnect: bool,
    buffer_max_size: usize,
    buffered: Vec<String>,
    connection: Option<WsStream>,
    /// Set once the configured attempts are exhausted; later writes only
    /// buffer (or drop) without hammering the endpoint.
    gave_up: bool,
}

impl WebSocketSink {
    pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 3;
    pub const DEFAULT_BUFFER_MAX: usize = 1000;

    #[must_use]
    pub fn new(
        url: String,
        reconnect_attempts: u32,
        buffer_on_disconnect: bool,
        buffer_max_size: usize,
    ) -> Self {
        Self {
            url,
            reconnect_attempts,
            buffer_on_disconnect,
            buffer_max_size,
            buffered: Vec::new(),
            connection: None,
            gave_up: false,
        }
    }

    async fn connect(&mut self) -> bool {
        if self.connection.is_some() {
            return true;
        }
        if self.gave_up {
            return false;
        }
        for attempt in 0..self.reconnect_attempts.max(1) {
            match tokio_tungstenite::connect_async(self.url.as_str()).await {
                Ok((stream, _response)) => {
                    debug!(url = %self.url, "websocket sink connected");
                    self.connection = Some(stream);
                    return true;
                }
                Err(e) => {
                    warn!(url = %self.url, attempt, "websocket connect failed: {e}");
                    tokio::time::sleep(Duration::from_millis(250 * 2u64.pow(attempt))).await;
                }
            }
        }
        self.gave_up = true;
        false
    }

    fn buffer_event(&mut self, event: &str) {
        if self.buffer_on_disconnect && self.buffered.len() < self.buffer_max_size {
            self.buffered.push(event.to_string());
        }
        // Past the cap events drop silently.
    }

    async fn drain_buffered(&mut self) -> Result<(), SinkError> {
        while let Some(event) = self.buffered.first().cloned() {
            let Some(connection) = self.connection.as_mut() else {
                return Ok(());
            };
            match connection.send(Message::text(event)).await {
                Ok(()) => {
                    self.buffered.remove(0);
                }
                Err(e) => {
                    self.connection = None;
                    return Err(SinkError::WebSocket(e.to_string()));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Sink for WebSocketSink {
    async fn write(&mut self, event: &str) -> Result<(), SinkError> {
        // Reconnect (and flush the disconnect buffer) before this event.
        if !self.connect().await {
            self.buffer_event(event);
            return Ok(());
        }
        if self.drain_buffered().await.is_err() {
            self.buffer_event(event);
            return Ok(());
        }

        let connection = self.connection.as_mut().expect("connected above");
        if let Err(e) = connection.send(Message::text(event.to_string())).await {
            warn!(url = %self.url, "websocket send failed, buffering: {e}");
            self.connection = None;
            self.gave_up = false;
            self.buffer_event(event);
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        if !self.buffered.is_empty() && self.connect().await {
            let _ = self.drain_buffered().await;
        }
        if let Some(mut connection) = self.connection.take() {
            connection
                .close(None)
                .await
                .map_err(|e| SinkError::WebSocket(e.to_string()))?;
        }
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "websocket"
    }
}

#[cfg(test)]
mod tests {
    use super::{FileFormat, FileSink, NullSink, ReturnSink, Sink};

    #[tokio::test]
    async fn return_sink_buffers_up_to_its_cap() {
        let (mut sink, buffer) = ReturnSink::new(3);
        for i in 0..5 {
            sink.write(&format!("event-{i}")).await.unwrap();
        }
        sink.close().await.unwrap();
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.snapshot()[0], "event-0");
    }

    #[tokio::test]
    async fn file_sink_writes_jsonl_with_raw_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/events.jsonl");
        let mut sink = FileSink::new(path.clone(), FileFormat::Jsonl, 2);

        sink.write(r#"{"i": 1}"#).await.unwrap();
        sink.write("not json").await.unwrap();
        sink.close().await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines, vec![r#"{"i":1}"#, "not json"]);
    }

    #[tokio::test]
    async fn file_sink_appends_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.log");

        let mut sink = FileSink::new(path.clone(), FileFormat::Raw, 1);
        sink.write("first").await.unwrap();
        sink.close().await.unwrap();

        let mut sink = FileSink::new(path.clone(), FileFormat::Raw, 1);
        sink.write("second").await.unwrap();
        sink.close().await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "first\nsecond\n");
    }

    #[tokio::test]
    async fn null_sink_accepts_everything() {
        let mut sink = NullSink;
        sink.write("anything").await.unwrap();
        sink.close().await.unwrap();
        assert_eq!(sink.kind(), "null");
    }
}
