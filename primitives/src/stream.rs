//! The streaming HTTP primitive: SSE line parsing and sink fan-out.
//!
//! Sinks arrive already instantiated; this primitive never constructs one.
//! Events are delivered to each sink in declaration order, and every sink
//! receives exactly one `close` on teardown, even when earlier sinks fail.

use std::time::Instant;

use futures_util::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::http::{HttpRequest, HttpResult, build_client, response_headers};
use crate::sink::{ReturnBuffer, Sink};

/// Maximum bytes buffered while waiting for an event boundary (4 MiB).
/// Aborts runaway streams from misbehaving servers.
const MAX_SSE_BUFFER_BYTES: usize = 4 * 1024 * 1024;

fn find_sse_event_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n");
    let crlf = buffer.windows(4).position(|w| w == b"\r\n\r\n");
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a <= b { (a, 2) } else { (b, 4) }),
        (Some(a), None) => Some((a, 2)),
        (None, Some(b)) => Some((b, 4)),
        (None, None) => None,
    }
}

fn drain_next_sse_event(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    let (pos, delim_len) = find_sse_event_boundary(buffer)?;
    let event = buffer[..pos].to_vec();
    buffer.drain(..pos + delim_len);
    Some(event)
}

/// The `data:` payload of one SSE event block. Multiple `data:` lines join
/// with `\n`; `event:`, `id:`, `retry:`, and comment lines are ignored.
fn extract_sse_data(event: &str) -> Option<String> {
    let mut data = String::new();
    let mut found = false;

    for line in event.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if let Some(mut rest) = line.strip_prefix("data:") {
            if let Some(stripped) = rest.strip_prefix(' ') {
                rest = stripped;
            }

            if found {
                data.push('\n');
            }
            data.push_str(rest);
            found = true;
        }
    }

    if found { Some(data) } else { None }
}

async fn fan_out(sinks: &mut [Box<dyn Sink>], payload: &str) {
    for sink in sinks.iter_mut() {
        if let Err(e) = sink.write(payload).await {
            warn!(kind = sink.kind(), "sink write failed: {e}");
        }
    }
}

/// Close every sink in iteration order, even if earlier closes fail.
async fn close_all(sinks: &mut [Box<dyn Sink>]) {
    for sink in sinks.iter_mut() {
        if let Err(e) = sink.close().await {
            warn!(kind = sink.kind(), "sink close failed: {e}");
        }
    }
}

/// Run the streaming HTTP primitive, fanning SSE events out to `sinks`.
///
/// `return_buffer` is the handle of the caller-instantiated `ReturnSink`,
/// when one is among the sinks; its contents become the result body.
pub async fn run_stream(
    request: &HttpRequest,
    mut sinks: Vec<Box<dyn Sink>>,
    return_buffer: Option<&ReturnBuffer>,
    cancel: &CancellationToken,
) -> HttpResult {
    let started = Instant::now();
    let destinations: Vec<String> = sinks.iter().map(|s| s.kind().to_string()).collect();

    let fail = |message: String, started: Instant, destinations: &[String]| {
        let mut result = HttpResult::transport_error(message, started);
        result.stream_events_count = Some(0);
        result.stream_destinations = Some(destinations.to_vec());
        result
    };

    let method = match reqwest::Method::from_bytes(request.method.to_uppercase().as_bytes()) {
        Ok(method) => method,
        Err(_) => {
            close_all(&mut sinks).await;
            return fail(
                format!("invalid HTTP method '{}'", request.method),
                started,
                &destinations,
            );
        }
    };

    // No total timeout: streams legitimately run for a long time.
    let client = match build_client(None, request.verify_ssl.unwrap_or(true)) {
        Ok(client) => client,
        Err(e) => {
            close_all(&mut sinks).await;
            return fail(format!("client build failed: {e}"), started, &destinations);
        }
    };

    let mut builder = client.request(method, &request.url);
    for (name, value) in &request.headers {
        builder = builder.header(name, value);
    }
    if let Some(auth) = &request.auth {
        let (name, value) = crate::http::AuthSpec::header(auth);
        builder = builder.header(name, value);
    }
    if let Some(body) = &request.body {
        builder = builder.json(body);
    }

    let response = match builder.send().await {
        Ok(response) => response,
        Err(e) => {
            close_all(&mut sinks).await;
            return fail(format!("stream connect failed: {e}"), started, &destinations);
        }
    };

    let status = response.status();
    let headers = response_headers(&response);
    if !status.is_success() {
        close_all(&mut sinks).await;
        let mut result = fail(format!("HTTP {status}"), started, &destinations);
        result.status_code = Some(status.as_u16());
        result.headers = headers;
        return result;
    }

    let mut body_stream = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();
    let mut events: u64 = 0;
    let mut error: Option<String> = None;

    'read: loop {
        let chunk = tokio::select! {
            chunk = body_stream.next() => chunk,
            () = cancel.cancelled() => {
                debug!("stream cancelled");
                break 'read;
            }
        };
        let Some(chunk) = chunk else {
            break; // upstream EOF
        };
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                error = Some(format!("stream read failed: {e}"));
                break;
            }
        };
        buffer.extend_from_slice(&chunk);
        if buffer.len() > MAX_SSE_BUFFER_BYTES {
            error = Some("SSE buffer limit exceeded".to_string());
            break;
        }

        while let Some(event) = drain_next_sse_event(&mut buffer) {
            let event = String::from_utf8_lossy(&event);
            if let Some(payload) = extract_sse_data(&event) {
                fan_out(&mut sinks, &payload).await;
                events += 1;
            }
        }
    }

    // A final event without a trailing blank line still counts.
    if error.is_none() && !buffer.is_empty() {
        let event = String::from_utf8_lossy(&buffer).into_owned();
        if let Some(payload) = extract_sse_data(&event) {
            fan_out(&mut sinks, &payload).await;
            events += 1;
        }
    }

    close_all(&mut sinks).await;

    let body = return_buffer.map_or(Value::Null, |buffer| {
        Value::Array(buffer.snapshot().into_iter().map(Value::String).collect())
    });

    debug!(events, destinations = ?destinations, "stream complete");
    HttpResult {
        success: error.is_none(),
        status_code: Some(status.as_u16()),
        body,
        headers,
        duration_ms: started.elapsed().as_millis() as u64,
        error,
        stream_events_count: Some(events),
        stream_destinations: Some(destinations),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::{extract_sse_data, run_stream};
    use crate::http::HttpRequest;
    use crate::sink::{FileFormat, FileSink, ReturnSink, Sink, SinkError};

    #[derive(Default, Clone)]
    struct Probe {
        writes: Arc<Mutex<Vec<String>>>,
        closes: Arc<Mutex<u32>>,
        fail_writes: bool,
    }

    struct ProbeSink(Probe);

    #[async_trait]
    impl Sink for ProbeSink {
        async fn write(&mut self, event: &str) -> Result<(), SinkError> {
            self.0.writes.lock().unwrap().push(event.to_string());
            if self.0.fail_writes {
                return Err(SinkError::WebSocket("probe failure".to_string()));
            }
            Ok(())
        }

        async fn close(&mut self) -> Result<(), SinkError> {
            *self.0.closes.lock().unwrap() += 1;
            Ok(())
        }

        fn kind(&self) -> &'static str {
            "probe"
        }
    }

    fn sse_body(count: usize) -> String {
        (1..=count)
            .map(|i| format!("data: {{\"i\":{i}}}\n\n"))
            .collect()
    }

    fn stream_request(url: String) -> HttpRequest {
        HttpRequest {
            method: "GET".to_string(),
            url,
            headers: BTreeMap::new(),
            body: None,
            params: BTreeMap::new(),
            timeout_s: None,
            retry_max: None,
            verify_ssl: None,
            auth: None,
        }
    }

    #[tokio::test]
    async fn fans_out_to_return_and_file_sinks() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/stream"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(sse_body(5), "text/event-stream"),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("x.jsonl");
        let (return_sink, buffer) = ReturnSink::new(10_000);
        let sinks: Vec<Box<dyn Sink>> = vec![
            Box::new(return_sink),
            Box::new(FileSink::new(file_path.clone(), FileFormat::Jsonl, 10)),
        ];

        let result = run_stream(
            &stream_request(format!("{}/stream", server.uri())),
            sinks,
            Some(&buffer),
            &CancellationToken::new(),
        )
        .await;

        assert!(result.success, "error: {:?}", result.error);
        assert_eq!(result.stream_events_count, Some(5));
        assert_eq!(
            result.stream_destinations,
            Some(vec!["return".to_string(), "file".to_string()])
        );
        assert_eq!(buffer.len(), 5);
        assert_eq!(result.body.as_array().unwrap().len(), 5);

        let content = std::fs::read_to_string(&file_path).unwrap();
        assert_eq!(content.lines().count(), 5);
        assert_eq!(content.lines().next().unwrap(), r#"{"i":1}"#);
    }

    #[tokio::test]
    async fn every_sink_sees_every_event_and_one_close() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(sse_body(3), "text/event-stream"),
            )
            .mount(&server)
            .await;

        let a = Probe::default();
        let b = Probe {
            fail_writes: true,
            ..Probe::default()
        };
        let sinks: Vec<Box<dyn Sink>> =
            vec![Box::new(ProbeSink(a.clone())), Box::new(ProbeSink(b.clone()))];

        let result = run_stream(
            &stream_request(server.uri()),
            sinks,
            None,
            &CancellationToken::new(),
        )
        .await;

        assert!(result.success);
        // Writes are at-most-once per event, even for the failing sink.
        assert_eq!(a.writes.lock().unwrap().len(), 3);
        assert_eq!(b.writes.lock().unwrap().len(), 3);
        assert_eq!(*a.closes.lock().unwrap(), 1);
        assert_eq!(*b.closes.lock().unwrap(), 1);
        assert_eq!(result.body, serde_json::Value::Null);
    }

    #[tokio::test]
    async fn non_data_lines_are_ignored() {
        let server = MockServer::start().await;
        let body = ": comment\nevent: tick\nid: 7\ndata: first\n\nretry: 100\n\ndata: second\n\n";
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let probe = Probe::default();
        let result = run_stream(
            &stream_request(server.uri()),
            vec![Box::new(ProbeSink(probe.clone()))],
            None,
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(result.stream_events_count, Some(2));
        assert_eq!(*probe.writes.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn http_error_closes_sinks_without_events() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let probe = Probe::default();
        let result = run_stream(
            &stream_request(server.uri()),
            vec![Box::new(ProbeSink(probe.clone()))],
            None,
            &CancellationToken::new(),
        )
        .await;

        assert!(!result.success);
        assert_eq!(result.status_code, Some(500));
        assert_eq!(result.stream_events_count, Some(0));
        assert!(probe.writes.lock().unwrap().is_empty());
        assert_eq!(*probe.closes.lock().unwrap(), 1);
    }

    #[test]
    fn multi_data_lines_join_with_newline() {
        let payload = extract_sse_data("data: line one\ndata: line two").unwrap();
        assert_eq!(payload, "line one\nline two");
        assert!(extract_sse_data("event: tick\nid: 3").is_none());
    }
}
