//! Terminal execution primitives.
//!
//! Primitives never raise for execution failures: a failed subprocess or
//! HTTP call comes back as a result object with `success = false`. The
//! harness promotes those into `on_error` events; only programming errors
//! (not execution outcomes) surface as `Err`.

pub mod http;
pub mod process;
pub mod retry;
pub mod sink;
pub mod stream;
pub mod subprocess;

pub use http::{AuthSpec, HttpRequest, HttpResult, run_http};
pub use sink::{FileFormat, FileSink, NullSink, ReturnBuffer, ReturnSink, Sink, SinkError, WebSocketSink};
pub use stream::run_stream;
pub use subprocess::{EnvSanitizer, SubprocessRequest, SubprocessResult, run_subprocess};
