//! The subprocess primitive: spawn, env merge, timeout, stdio capture.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use kiwi_utils::template::expand_str;

use crate::process::{ChildGuard, set_new_session};

/// Hard ceiling on a declared timeout.
pub const MAX_TIMEOUT_S: u64 = 3600;
/// Default timeout when the caller declares none.
pub const DEFAULT_TIMEOUT_S: u64 = 300;
/// Callers passing more keys than this have produced a complete
/// environment; it is used as-is instead of merged.
const FULL_ENV_THRESHOLD: usize = 50;
/// Per-stream capture bound.
const MAX_CAPTURE_BYTES: u64 = 1024 * 1024;

const TRUNCATION_MARKER: &str = "\n... [output truncated]";

/// Inputs to the subprocess primitive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubprocessRequest {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_output: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
}

/// Outcome of one subprocess execution. Failures are data, never panics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubprocessResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_code: Option<i32>,
    pub duration_ms: u64,
}

impl SubprocessResult {
    fn failed(stderr: impl Into<String>, started: Instant) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
            return_code: None,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// Strips dynamic-linker variables before a child sees the environment.
#[derive(Debug, Clone)]
pub struct EnvSanitizer {
    denylist: globset::GlobSet,
}

impl EnvSanitizer {
    /// Patterns stripped from every child environment.
    pub const DEFAULT_DENYLIST: &'static [&'static str] =
        &["LD_PRELOAD", "LD_LIBRARY_PATH", "DYLD_*"];

    pub fn new(patterns: &[String]) -> Result<Self, globset::Error> {
        let mut builder = globset::GlobSetBuilder::new();
        for pat in patterns {
            let mut glob = globset::GlobBuilder::new(pat);
            glob.case_insensitive(true);
            builder.add(glob.build()?);
        }
        Ok(Self {
            denylist: builder.build()?,
        })
    }

    #[must_use]
    pub fn default_denylist() -> Self {
        let patterns: Vec<String> = Self::DEFAULT_DENYLIST
            .iter()
            .map(ToString::to_string)
            .collect();
        Self::new(&patterns).expect("static denylist patterns are valid")
    }

    #[must_use]
    pub fn sanitize(&self, env: BTreeMap<String, String>) -> BTreeMap<String, String> {
        env.into_iter()
            .filter(|(k, _)| !self.denylist.is_match(k))
            .collect()
    }
}

/// Merge the caller's env over the process environment, unless the caller
/// already produced a complete one.
fn effective_env(declared: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    if declared.len() > FULL_ENV_THRESHOLD {
        return declared.clone();
    }
    let mut merged: BTreeMap<String, String> = std::env::vars().collect();
    merged.extend(declared.clone());
    merged
}

async fn read_capped(
    reader: Option<impl tokio::io::AsyncRead + Unpin + Send + 'static>,
) -> String {
    let Some(reader) = reader else {
        return String::new();
    };
    let mut buf = Vec::new();
    let mut capped = reader.take(MAX_CAPTURE_BYTES + 1);
    let _ = capped.read_to_end(&mut buf).await;
    let truncated = buf.len() as u64 > MAX_CAPTURE_BYTES;
    if truncated {
        buf.truncate(MAX_CAPTURE_BYTES as usize);
    }
    let mut text = String::from_utf8_lossy(&buf).into_owned();
    if truncated {
        text.push_str(TRUNCATION_MARKER);
    }
    text
}

/// Run the subprocess primitive.
///
/// Errors (missing binary, permission denied) are returned as a failed
/// result, never raised. On timeout the process group is killed and
/// `stderr` gains a "timed out" marker. Cancellation kills the child and
/// reports a failed result.
pub async fn run_subprocess(
    request: &SubprocessRequest,
    sanitizer: &EnvSanitizer,
    cancel: &CancellationToken,
) -> SubprocessResult {
    let started = Instant::now();

    let env = sanitizer.sanitize(effective_env(&request.env));
    let lookup = |name: &str| env.get(name).cloned();

    let command = expand_str(&request.command, lookup);
    let args: Vec<String> = request
        .args
        .iter()
        .map(|a| expand_str(a, lookup))
        .collect();
    let cwd = request.cwd.as_ref().map(|c| expand_str(c, lookup));

    let timeout_s = request
        .timeout_s
        .unwrap_or(DEFAULT_TIMEOUT_S)
        .min(MAX_TIMEOUT_S);
    let capture = request.capture_output.unwrap_or(true);

    let mut cmd = Command::new(&command);
    cmd.args(&args).env_clear().envs(&env);
    if let Some(cwd) = &cwd {
        cmd.current_dir(cwd);
    }
    let stdio = || if capture { Stdio::piped() } else { Stdio::null() };
    cmd.stdout(stdio()).stderr(stdio());
    cmd.stdin(if request.stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    set_new_session(&mut cmd);
    cmd.kill_on_drop(true);

    debug!(command = %command, args = ?args, timeout_s, "spawning subprocess");

    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => return SubprocessResult::failed(format!("failed to spawn '{command}': {e}"), started),
    };
    let mut guard = ChildGuard::new(child);

    if let Some(stdin) = &request.stdin {
        if let Some(mut pipe) = guard.child_mut().stdin.take() {
            let bytes = stdin.clone().into_bytes();
            let _ = pipe.write_all(&bytes).await;
            drop(pipe);
        }
    }

    // Pipe readers own their pipes, so waiting and killing never contend
    // with them for the child.
    let stdout_task = tokio::spawn(read_capped(guard.child_mut().stdout.take()));
    let stderr_task = tokio::spawn(read_capped(guard.child_mut().stderr.take()));

    enum Waited {
        Done(std::io::Result<std::process::ExitStatus>),
        TimedOut,
        Cancelled,
    }

    let waited = tokio::select! {
        result = tokio::time::timeout(
            Duration::from_secs(timeout_s),
            guard.child_mut().wait(),
        ) => match result {
            Ok(status) => Waited::Done(status),
            Err(_) => Waited::TimedOut,
        },
        () = cancel.cancelled() => Waited::Cancelled,
    };

    if !matches!(waited, Waited::Done(_)) {
        guard.kill_now().await;
    }
    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();
    let duration_ms = started.elapsed().as_millis() as u64;

    match waited {
        Waited::Done(Ok(status)) => {
            guard.disarm();
            SubprocessResult {
                success: status.success(),
                stdout,
                stderr,
                return_code: status.code(),
                duration_ms,
            }
        }
        Waited::Done(Err(e)) => {
            guard.disarm();
            SubprocessResult {
                success: false,
                stdout,
                stderr: format!("{stderr}\nwait failed: {e}"),
                return_code: None,
                duration_ms,
            }
        }
        Waited::TimedOut => SubprocessResult {
            success: false,
            stdout,
            stderr: format!("{stderr}timed out after {timeout_s}s"),
            return_code: None,
            duration_ms,
        },
        Waited::Cancelled => SubprocessResult {
            success: false,
            stdout,
            stderr: "cancelled".to_string(),
            return_code: None,
            duration_ms,
        },
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use tokio_util::sync::CancellationToken;

    use super::{EnvSanitizer, SubprocessRequest, run_subprocess};

    fn request(command: &str, args: &[&str]) -> SubprocessRequest {
        SubprocessRequest {
            command: command.to_string(),
            args: args.iter().map(ToString::to_string).collect(),
            ..SubprocessRequest::default()
        }
    }

    async fn run(request: &SubprocessRequest) -> super::SubprocessResult {
        run_subprocess(
            request,
            &EnvSanitizer::default_denylist(),
            &CancellationToken::new(),
        )
        .await
    }

    #[tokio::test]
    async fn echo_captures_stdout() {
        let result = run(&request("echo", &["hello"])).await;
        assert!(result.success);
        assert_eq!(result.stdout, "hello\n");
        assert_eq!(result.return_code, Some(0));
    }

    #[tokio::test]
    async fn missing_binary_is_a_failed_result() {
        let result = run(&request("kiwi-definitely-not-a-binary", &[])).await;
        assert!(!result.success);
        assert!(result.stderr.contains("failed to spawn"));
        assert!(result.return_code.is_none());
    }

    #[tokio::test]
    async fn nonzero_exit_reports_failure_with_code() {
        let result = run(&request("sh", &["-c", "exit 3"])).await;
        assert!(!result.success);
        assert_eq!(result.return_code, Some(3));
    }

    #[tokio::test]
    async fn timeout_kills_and_marks_stderr() {
        let mut req = request("sleep", &["30"]);
        req.timeout_s = Some(1);
        let result = run(&req).await;
        assert!(!result.success);
        assert!(result.stderr.contains("timed out"));
    }

    #[tokio::test]
    async fn env_templates_expand_against_merged_env() {
        let mut req = request("sh", &["-c", "echo ${GREETING} ${MISSING:-fallback}"]);
        req.env = BTreeMap::from([("GREETING".to_string(), "hi".to_string())]);
        let result = run(&req).await;
        assert!(result.success);
        // The shell sees the already-expanded argument.
        assert_eq!(result.stdout, "hi fallback\n");
    }

    #[tokio::test]
    async fn declared_env_overrides_process_env() {
        // SAFETY: test-local env mutation.
        unsafe { std::env::set_var("KIWI_TEST_MERGE", "process") };
        let mut req = request("sh", &["-c", "echo $KIWI_TEST_MERGE"]);
        req.env = BTreeMap::from([("KIWI_TEST_MERGE".to_string(), "declared".to_string())]);
        let result = run(&req).await;
        assert_eq!(result.stdout, "declared\n");
    }

    #[tokio::test]
    async fn stdin_is_fed_to_the_child() {
        let mut req = request("cat", &[]);
        req.stdin = Some("fed via stdin".to_string());
        let result = run(&req).await;
        assert!(result.success);
        assert_eq!(result.stdout, "fed via stdin");
    }

    #[tokio::test]
    async fn linker_vars_are_stripped() {
        let mut req = request("sh", &["-c", "echo \"${LD_PRELOAD:-clean}\""]);
        req.env = BTreeMap::from([("LD_PRELOAD".to_string(), "/evil.so".to_string())]);
        let result = run(&req).await;
        assert_eq!(result.stdout, "clean\n");
    }

    #[tokio::test]
    async fn cancellation_kills_the_child() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = run_subprocess(
            &request("sleep", &["30"]),
            &EnvSanitizer::default_denylist(),
            &cancel,
        )
        .await;
        assert!(!result.success);
        assert!(result.stderr.contains("cancelled"));
    }
}
