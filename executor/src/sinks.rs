//! Sink instantiation from caller-declared destinations.
//!
//! The streaming primitive never constructs sinks; this module maps each
//! declared `type` to its implementation and hands the primitive a ready
//! set.

use std::path::PathBuf;

use kiwi_primitives::sink::{
    DEFAULT_RETURN_BUFFER, FileFormat, FileSink, NullSink, ReturnBuffer, ReturnSink, Sink,
    WebSocketSink,
};
use serde::Deserialize;

/// One declared destination for a streaming execution.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DestinationSpec {
    Return {
        #[serde(default)]
        max_buffer_size: Option<usize>,
    },
    File {
        path: PathBuf,
        #[serde(default)]
        format: Option<FileFormat>,
        #[serde(default)]
        flush_every: Option<usize>,
    },
    Null,
    Websocket {
        url: String,
        #[serde(default)]
        reconnect_attempts: Option<u32>,
        #[serde(default)]
        buffer_on_disconnect: Option<bool>,
        #[serde(default)]
        buffer_max_size: Option<usize>,
    },
}

/// Build the sink set. Returns the handle of the first `return` sink so the
/// caller can recover the buffered events after the stream closes.
#[must_use]
pub fn instantiate_sinks(specs: &[DestinationSpec]) -> (Vec<Box<dyn Sink>>, Option<ReturnBuffer>) {
    let mut sinks: Vec<Box<dyn Sink>> = Vec::with_capacity(specs.len());
    let mut return_buffer = None;

    for spec in specs {
        match spec {
            DestinationSpec::Return { max_buffer_size } => {
                let (sink, buffer) =
                    ReturnSink::new(max_buffer_size.unwrap_or(DEFAULT_RETURN_BUFFER));
                if return_buffer.is_none() {
                    return_buffer = Some(buffer);
                }
                sinks.push(Box::new(sink));
            }
            DestinationSpec::File {
                path,
                format,
                flush_every,
            } => {
                sinks.push(Box::new(FileSink::new(
                    path.clone(),
                    format.unwrap_or_default(),
                    flush_every.unwrap_or(FileSink::DEFAULT_FLUSH_EVERY),
                )));
            }
            DestinationSpec::Null => sinks.push(Box::new(NullSink)),
            DestinationSpec::Websocket {
                url,
                reconnect_attempts,
                buffer_on_disconnect,
                buffer_max_size,
            } => {
                sinks.push(Box::new(WebSocketSink::new(
                    url.clone(),
                    reconnect_attempts.unwrap_or(WebSocketSink::DEFAULT_RECONNECT_ATTEMPTS),
                    buffer_on_disconnect.unwrap_or(true),
                    buffer_max_size.unwrap_or(WebSocketSink::DEFAULT_BUFFER_MAX),
                )));
            }
        }
    }
    (sinks, return_buffer)
}
