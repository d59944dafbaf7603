//! The chain walk and terminal dispatch.
//!
//! The walk is a bounded loop, not deep recursion: extract metadata, follow
//! `executor_id` through the tool roots, resolve runtime environments as
//! they are visited, and dispatch to a compiled-in primitive at the end.
//! Integrity, chain, and lockfile failures are fatal to one execution and
//! propagate unchanged; primitive failures are data in the result.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use kiwi_primitives::{
    EnvSanitizer, HttpRequest, HttpResult, SubprocessRequest, SubprocessResult, run_http,
    run_stream, run_subprocess,
};
use kiwi_telemetry::{ExecutionRecord, Outcome, TelemetryStore};
use kiwi_tools::{
    LockfileError, LockfileStore, MetadataError, ResolveError, ToolRoots, extract_manifest,
    resolve_executor, validate_chain, verify_signature,
};
use kiwi_types::{
    ChainEntry, ExecutorBinding, FailureKind, MAX_CHAIN_DEPTH, PrimitiveKind, ResolvedChain,
    ToolManifest,
};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::env::resolve_env;
use crate::sinks::{DestinationSpec, instantiate_sinks};

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error("integrity check failed for '{tool_id}': {reason}")]
    Integrity { tool_id: String, reason: String },
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("executor chain from '{tool_id}' exceeds {MAX_CHAIN_DEPTH} hops")]
    ChainTooDeep { tool_id: String },
    #[error("chain validation failed: {}", issues.join("; "))]
    ChainInvalid { issues: Vec<String> },
    #[error("lockfile is stale: {}", issues.join("; "))]
    LockfileStale { issues: Vec<String> },
    #[error("parameters do not match config_schema: {message}")]
    SchemaValidation { message: String },
    #[error(transparent)]
    Lockfile(#[from] LockfileError),
    #[error("bad parameters: {0}")]
    BadParameters(String),
}

impl ExecutorError {
    #[must_use]
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Metadata(MetadataError::Integrity(_)) | Self::Integrity { .. } => {
                FailureKind::Integrity
            }
            Self::Metadata(_) | Self::BadParameters(_) => FailureKind::BadInput,
            Self::Resolve(_) => FailureKind::ExecutorNotFound,
            Self::ChainTooDeep { .. } => FailureKind::ChainTooDeep,
            Self::ChainInvalid { .. } => FailureKind::ChainInvalid,
            Self::LockfileStale { .. } | Self::Lockfile(_) => FailureKind::LockfileStale,
            Self::SchemaValidation { .. } => FailureKind::SchemaValidation,
        }
    }
}

/// Result of a terminal dispatch.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    Subprocess(SubprocessResult),
    Http(HttpResult),
}

impl ExecutionOutcome {
    #[must_use]
    pub fn success(&self) -> bool {
        match self {
            Self::Subprocess(r) => r.success,
            Self::Http(r) => r.success,
        }
    }

    #[must_use]
    pub fn duration_ms(&self) -> u64 {
        match self {
            Self::Subprocess(r) => r.duration_ms,
            Self::Http(r) => r.duration_ms,
        }
    }

    #[must_use]
    pub fn error_summary(&self) -> Option<String> {
        match self {
            Self::Subprocess(r) => {
                (!r.success).then(|| r.stderr.lines().last().unwrap_or("failed").to_string())
            }
            Self::Http(r) => r.error.clone(),
        }
    }

    fn telemetry_outcome(&self) -> Outcome {
        if self.success() {
            return Outcome::Success;
        }
        let timed_out = match self {
            Self::Subprocess(r) => r.stderr.contains("timed out"),
            Self::Http(r) => r
                .error
                .as_deref()
                .is_some_and(|e| e.contains("timed out") || e.contains("timeout")),
        };
        if timed_out { Outcome::Timeout } else { Outcome::Failure }
    }

    /// The result as a JSON value for transcript injection.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::Subprocess(r) => serde_json::to_value(r).unwrap_or(Value::Null),
            Self::Http(r) => serde_json::to_value(r).unwrap_or(Value::Null),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Regenerate a stale lockfile instead of failing.
    pub allow_lockfile_refresh: bool,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            allow_lockfile_refresh: true,
        }
    }
}

/// The integrating component: resolves, verifies, and runs tool chains.
pub struct UniversalExecutor {
    roots: ToolRoots,
    lockfiles: LockfileStore,
    telemetry: TelemetryStore,
    sanitizer: EnvSanitizer,
    options: ExecutorOptions,
}

impl UniversalExecutor {
    #[must_use]
    pub fn new(roots: ToolRoots, telemetry: TelemetryStore, options: ExecutorOptions) -> Self {
        Self {
            lockfiles: LockfileStore::new(roots.clone()),
            roots,
            telemetry,
            sanitizer: EnvSanitizer::default_denylist(),
            options,
        }
    }

    /// Replace the subprocess env denylist.
    #[must_use]
    pub fn with_sanitizer(mut self, sanitizer: EnvSanitizer) -> Self {
        self.sanitizer = sanitizer;
        self
    }

    /// Execute the tool at `tool_path` with `parameters`.
    pub async fn execute(
        &self,
        tool_path: &Path,
        parameters: Value,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, ExecutorError> {
        let walk = self.walk_chain(tool_path)?;
        let leaf = walk.manifests.first().expect("walk yields at least one hop");

        let validation = validate_chain(&walk.chain);
        if !validation.is_valid {
            return Err(ExecutorError::ChainInvalid {
                issues: validation.issues,
            });
        }
        for warning in &validation.warnings {
            warn!(tool = %leaf.tool_id, "chain warning: {warning}");
        }

        self.check_lockfile(leaf, &walk.chain)?;

        let params = assemble_parameters(&walk, parameters);
        if let Some(schema) = &leaf.config_schema {
            validate_schema(schema, &params)?;
        }

        let outcome = self.dispatch(walk.kind, params, cancel).await?;
        self.record(leaf, tool_path, &outcome).await;
        Ok(outcome)
    }

    fn walk_chain(&self, tool_path: &Path) -> Result<ChainWalk, ExecutorError> {
        let mut chain = ResolvedChain::new();
        let mut manifests = Vec::new();
        let mut runtime_env: BTreeMap<String, String> = BTreeMap::new();
        let mut current = tool_path.to_path_buf();

        let kind = loop {
            if chain.len() >= MAX_CHAIN_DEPTH {
                return Err(ExecutorError::ChainTooDeep {
                    tool_id: manifests
                        .first()
                        .map_or_else(String::new, |m: &ToolManifest| m.tool_id.clone()),
                });
            }

            let manifest = extract_manifest(&current)?;
            if verify_signature(&current).map_err(MetadataError::Integrity)? == Some(false) {
                return Err(ExecutorError::Integrity {
                    tool_id: manifest.tool_id.clone(),
                    reason: "signature does not match content".to_string(),
                });
            }

            chain.push(ChainEntry::from_manifest(&manifest));
            let binding = manifest.binding().map_err(|e| ExecutorError::Metadata(e.into()))?;
            manifests.push(manifest);

            match binding {
                ExecutorBinding::Primitive(kind) => break kind,
                ExecutorBinding::Runtime {
                    executor_id,
                    env_config,
                } => {
                    // Env resolution happens at the hop, at execution time.
                    runtime_env.extend(resolve_env(&env_config, &self.roots));
                    current = resolve_executor(&executor_id, &self.roots)?.1;
                }
                ExecutorBinding::Delegated { executor_id } => {
                    current = resolve_executor(&executor_id, &self.roots)?.1;
                }
            }
        };

        runtime_env.insert(
            "KIWI_TOOL_PATH".to_string(),
            tool_path.display().to_string(),
        );
        debug!(
            tool = %manifests[0].tool_id,
            depth = chain.len(),
            terminal = kind.as_str(),
            "resolved chain"
        );
        Ok(ChainWalk {
            chain,
            manifests,
            runtime_env,
            kind,
        })
    }

    fn check_lockfile(
        &self,
        leaf: &ToolManifest,
        chain: &ResolvedChain,
    ) -> Result<(), ExecutorError> {
        let existing =
            self.lockfiles
                .get_lockfile(&leaf.tool_id, &leaf.version, &leaf.category)?;
        match existing {
            Some(lockfile) => {
                let validation = self.lockfiles.validate_lockfile(&lockfile, chain);
                if validation.is_valid {
                    return Ok(());
                }
                if !self.options.allow_lockfile_refresh {
                    return Err(ExecutorError::LockfileStale {
                        issues: validation.issues,
                    });
                }
                warn!(tool = %leaf.tool_id, "regenerating stale lockfile");
                self.lockfiles.freeze_chain(chain, &leaf.category)?;
                Ok(())
            }
            None => {
                self.lockfiles.freeze_chain(chain, &leaf.category)?;
                Ok(())
            }
        }
    }

    async fn dispatch(
        &self,
        kind: PrimitiveKind,
        mut params: Value,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, ExecutorError> {
        match kind {
            PrimitiveKind::Subprocess => {
                let request: SubprocessRequest = serde_json::from_value(params)
                    .map_err(|e| ExecutorError::BadParameters(e.to_string()))?;
                let result = run_subprocess(&request, &self.sanitizer, cancel).await;
                Ok(ExecutionOutcome::Subprocess(result))
            }
            PrimitiveKind::HttpClient => {
                let is_stream = params.get("mode").and_then(Value::as_str) == Some("stream");
                if !is_stream {
                    let request: HttpRequest = serde_json::from_value(params)
                        .map_err(|e| ExecutorError::BadParameters(e.to_string()))?;
                    return Ok(ExecutionOutcome::Http(run_http(&request).await));
                }

                // Sinks are instantiated here; the primitive never builds one.
                let destinations = params
                    .as_object_mut()
                    .and_then(|map| {
                        map.remove("mode");
                        map.remove("destinations")
                    })
                    .unwrap_or(Value::Array(Vec::new()));
                let specs: Vec<DestinationSpec> = serde_json::from_value(destinations)
                    .map_err(|e| ExecutorError::BadParameters(format!("destinations: {e}")))?;
                let (sinks, return_buffer) = instantiate_sinks(&specs);

                let request: HttpRequest = serde_json::from_value(params)
                    .map_err(|e| ExecutorError::BadParameters(e.to_string()))?;
                let result = run_stream(&request, sinks, return_buffer.as_ref(), cancel).await;
                Ok(ExecutionOutcome::Http(result))
            }
        }
    }

    async fn record(&self, leaf: &ToolManifest, tool_path: &Path, outcome: &ExecutionOutcome) {
        if !self.telemetry.is_enabled() {
            return;
        }
        let record = ExecutionRecord {
            // Stable id: the local tool id, content hash as a fallback.
            item_id: if leaf.tool_id.is_empty() {
                leaf.content_hash.clone()
            } else {
                leaf.tool_id.clone()
            },
            item_type: leaf.tool_type.as_str().to_string(),
            outcome: outcome.telemetry_outcome(),
            duration_ms: outcome.duration_ms(),
            http_calls: matches!(outcome, ExecutionOutcome::Http(_)).into(),
            subprocess_calls: matches!(outcome, ExecutionOutcome::Subprocess(_)).into(),
            error: outcome.error_summary(),
            path: Some(tool_path.to_path_buf()),
        };
        let telemetry = self.telemetry.clone();
        let result =
            tokio::task::spawn_blocking(move || telemetry.record_execution(&record)).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("telemetry write failed: {e}"),
            Err(e) => warn!("telemetry task failed: {e}"),
        }
    }
}

struct ChainWalk {
    chain: ResolvedChain,
    manifests: Vec<ToolManifest>,
    runtime_env: BTreeMap<String, String>,
    kind: PrimitiveKind,
}

/// Merge hop configs (deepest first) under the caller's parameters, then
/// overlay runtime-resolved env. `env` objects merge key-wise; everything
/// else merges shallowly with later layers winning.
fn assemble_parameters(walk: &ChainWalk, caller: Value) -> Value {
    let mut merged = Map::new();
    let mut env: BTreeMap<String, String> = BTreeMap::new();

    let mut layers: Vec<&Value> = Vec::new();
    for manifest in walk.manifests.iter().rev() {
        if let Some(config) = &manifest.config {
            layers.push(config);
        }
    }
    let caller_layer = caller;
    layers.push(&caller_layer);

    for layer in layers {
        let Some(object) = layer.as_object() else {
            continue;
        };
        for (key, value) in object {
            if key == "env" {
                if let Some(map) = value.as_object() {
                    for (k, v) in map {
                        let v = match v {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        env.insert(k.clone(), v);
                    }
                }
            } else {
                merged.insert(key.clone(), value.clone());
            }
        }
    }

    // Runtime-resolved env is authoritative for the hop it came from.
    env.extend(walk.runtime_env.clone());
    if !env.is_empty() {
        merged.insert(
            "env".to_string(),
            Value::Object(env.into_iter().map(|(k, v)| (k, Value::String(v))).collect()),
        );
    }
    Value::Object(merged)
}

fn validate_schema(schema: &Value, params: &Value) -> Result<(), ExecutorError> {
    let validator =
        jsonschema::validator_for(schema).map_err(|e| ExecutorError::SchemaValidation {
            message: format!("invalid config_schema: {e}"),
        })?;
    validator
        .validate(params)
        .map_err(|e| ExecutorError::SchemaValidation {
            message: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};

    use kiwi_telemetry::TelemetryStore;
    use kiwi_tools::ToolRoots;
    use serde_json::{Value, json};
    use tokio_util::sync::CancellationToken;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::{ExecutionOutcome, ExecutorError, ExecutorOptions, UniversalExecutor};

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        executor: UniversalExecutor,
        telemetry: TelemetryStore,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = dir.path().to_path_buf();
            let user_scope = root.join("user/.kiwi");
            fs::create_dir_all(user_scope.join("tools")).unwrap();
            let roots = ToolRoots::new(None, user_scope.clone());
            let telemetry = TelemetryStore::at_user_scope(&user_scope, true);
            let executor = UniversalExecutor::new(
                roots,
                telemetry.clone(),
                ExecutorOptions::default(),
            );
            Self {
                _dir: dir,
                root,
                executor,
                telemetry,
            }
        }

        fn tool(&self, name: &str, content: &str) -> PathBuf {
            let path = self.root.join("user/.kiwi/tools").join(name);
            fs::write(&path, content).unwrap();
            path
        }

        async fn execute(&self, path: &Path, params: Value) -> Result<ExecutionOutcome, ExecutorError> {
            self.executor
                .execute(path, params, &CancellationToken::new())
                .await
        }
    }

    fn echo_primitive() -> &'static str {
        "# tool_type: primitive\n\
         # executor_id: null\n\
         # category: demo\n\
         # version: 1.0.0\n\
         # config: {\"command\": \"echo\", \"args\": [\"hello\"]}\n"
    }

    #[tokio::test]
    async fn primitive_execution_runs_and_records_telemetry() {
        let fixture = Fixture::new();
        let path = fixture.tool("echo.py", echo_primitive());

        let outcome = fixture.execute(&path, json!({})).await.unwrap();
        let ExecutionOutcome::Subprocess(result) = &outcome else {
            panic!("expected subprocess outcome");
        };
        assert!(result.success);
        assert_eq!(result.stdout, "hello\n");
        assert_eq!(result.return_code, Some(0));

        let stats = fixture.telemetry.get("echo").unwrap().expect("stats");
        assert_eq!(stats.total_runs, 1);
        assert_eq!(stats.success_count, 1);
        assert_eq!(stats.subprocess_calls, 1);
    }

    #[tokio::test]
    async fn three_hop_chain_resolves_env_and_writes_lockfile() {
        let fixture = Fixture::new();
        fixture.tool(
            "subprocess.py",
            "# tool_type: primitive\n# executor_id: null\n# category: core\n# version: 1.0.0\n",
        );
        fixture.tool(
            "python_runtime.py",
            "# tool_type: runtime\n\
             # executor_id: subprocess\n\
             # category: core\n\
             # version: 1.0.0\n\
             # env_config: {\"interpreter\": {\"type\": \"path_binary\", \"var\": \"RYE_PYTHON\", \"binary\": \"sh\", \"fallback\": \"sh\"}}\n\
             # config: {\"command\": \"${RYE_PYTHON}\", \"args\": [\"${KIWI_TOOL_PATH}\"]}\n",
        );
        let leaf = fixture.tool(
            "my_tool.py",
            "# tool_type: python\n\
             # executor_id: python_runtime\n\
             # category: analysis\n\
             # version: 1.0.0\n\
             echo from-my-tool\n",
        );

        let outcome = fixture.execute(&leaf, json!({})).await.unwrap();
        let ExecutionOutcome::Subprocess(result) = &outcome else {
            panic!("expected subprocess outcome");
        };
        assert!(result.success, "stderr: {}", result.stderr);
        assert_eq!(result.stdout, "from-my-tool\n");

        // Lockfile written with all three entries.
        let lockfile = fixture
            .executor
            .lockfiles
            .get_lockfile("my_tool", &semver::Version::new(1, 0, 0), "analysis")
            .unwrap()
            .expect("lockfile");
        let ids: Vec<&str> = lockfile
            .resolved_chain
            .iter()
            .map(|e| e.tool_id.as_str())
            .collect();
        assert_eq!(ids, vec!["my_tool", "python_runtime", "subprocess"]);
    }

    #[tokio::test]
    async fn stale_lockfile_fails_closed_when_refresh_is_disallowed() {
        let fixture = Fixture::new();
        fixture.tool(
            "subprocess.py",
            "# tool_type: primitive\n# executor_id: null\n# category: core\n# version: 1.0.0\n",
        );
        let runtime_src = "# tool_type: runtime\n\
             # executor_id: subprocess\n\
             # category: core\n\
             # version: 1.0.0\n\
             # config: {\"command\": \"true\"}\n";
        fixture.tool("python_runtime.py", runtime_src);
        let leaf = fixture.tool(
            "my_tool.py",
            "# tool_type: python\n# executor_id: python_runtime\n# category: analysis\n# version: 1.0.0\n",
        );

        // First run freezes the chain.
        fixture.execute(&leaf, json!({})).await.unwrap();

        // Drift the runtime on disk.
        fixture.tool(
            "python_runtime.py",
            &format!("{runtime_src}# drifted\n"),
        );

        let strict = UniversalExecutor::new(
            ToolRoots::new(None, fixture.root.join("user/.kiwi")),
            TelemetryStore::at_user_scope(&fixture.root.join("user/.kiwi"), false),
            ExecutorOptions {
                allow_lockfile_refresh: false,
            },
        );
        let err = strict
            .execute(&leaf, json!({}), &CancellationToken::new())
            .await
            .unwrap_err();
        let ExecutorError::LockfileStale { issues } = err else {
            panic!("expected stale lockfile, got {err:?}");
        };
        assert!(
            issues
                .iter()
                .any(|i| i.contains("python_runtime") && i.contains("integrity hash mismatch")),
            "issues: {issues:?}"
        );
    }

    #[tokio::test]
    async fn chain_too_deep_is_rejected() {
        let fixture = Fixture::new();
        // a -> b -> a -> b -> ... never terminates.
        fixture.tool(
            "loop_a.py",
            "# tool_type: library\n# executor_id: loop_b\n# version: 1.0.0\n",
        );
        let leaf = fixture.tool(
            "loop_b.py",
            "# tool_type: library\n# executor_id: loop_a\n# version: 1.0.0\n",
        );
        let err = fixture.execute(&leaf, json!({})).await.unwrap_err();
        assert!(matches!(err, ExecutorError::ChainTooDeep { .. }));
    }

    #[tokio::test]
    async fn missing_executor_is_rejected() {
        let fixture = Fixture::new();
        let leaf = fixture.tool(
            "orphan.py",
            "# tool_type: python\n# executor_id: ghost_runtime\n# version: 1.0.0\n",
        );
        let err = fixture.execute(&leaf, json!({})).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Resolve(_)));
    }

    #[tokio::test]
    async fn schema_validation_gates_dispatch() {
        let fixture = Fixture::new();
        let path = fixture.tool(
            "strict.py",
            "# tool_type: primitive\n\
             # executor_id: null\n\
             # version: 1.0.0\n\
             # config: {\"command\": \"echo\"}\n\
             # config_schema: {\"type\": \"object\", \"properties\": {\"args\": {\"type\": \"array\"}}, \"required\": [\"args\"]}\n",
        );
        let err = fixture.execute(&path, json!({})).await.unwrap_err();
        assert!(matches!(err, ExecutorError::SchemaValidation { .. }));

        let outcome = fixture
            .execute(&path, json!({"args": ["ok"]}))
            .await
            .unwrap();
        assert!(outcome.success());
    }

    #[tokio::test]
    async fn caller_parameters_override_tool_config() {
        let fixture = Fixture::new();
        let path = fixture.tool("echo.py", echo_primitive());
        let outcome = fixture
            .execute(&path, json!({"args": ["overridden"]}))
            .await
            .unwrap();
        let ExecutionOutcome::Subprocess(result) = &outcome else {
            panic!("expected subprocess outcome");
        };
        assert_eq!(result.stdout, "overridden\n");
    }

    #[tokio::test]
    async fn tampered_signature_is_an_integrity_error() {
        let fixture = Fixture::new();
        let bogus = "0".repeat(64);
        let path = fixture.tool(
            "signed.py",
            &format!(
                "# kiwi-mcp:validated:2025-06-01T00:00:00Z:{bogus}\n\
                 # tool_type: primitive\n\
                 # executor_id: null\n\
                 # version: 1.0.0\n\
                 # config: {{\"command\": \"echo\"}}\n"
            ),
        );
        let err = fixture.execute(&path, json!({})).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Integrity { .. }));
    }

    #[tokio::test]
    async fn streaming_dispatch_instantiates_declared_sinks() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/stream"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "data: {\"i\":1}\n\ndata: {\"i\":2}\n\ndata: {\"i\":3}\n\n",
                "text/event-stream",
            ))
            .mount(&server)
            .await;

        let fixture = Fixture::new();
        let out_file = fixture.root.join("out/x.jsonl");
        let path = fixture.tool(
            "http_client.py",
            "# tool_type: primitive\n# executor_id: null\n# category: core\n# version: 1.0.0\n",
        );

        let outcome = fixture
            .execute(
                &path,
                json!({
                    "mode": "stream",
                    "method": "GET",
                    "url": format!("{}/stream", server.uri()),
                    "destinations": [
                        { "type": "return" },
                        { "type": "file", "path": out_file },
                    ]
                }),
            )
            .await
            .unwrap();

        let ExecutionOutcome::Http(result) = &outcome else {
            panic!("expected http outcome");
        };
        assert!(result.success, "error: {:?}", result.error);
        assert_eq!(result.stream_events_count, Some(3));
        assert_eq!(
            result.stream_destinations,
            Some(vec!["return".to_string(), "file".to_string()])
        );
        assert_eq!(result.body.as_array().unwrap().len(), 3);
        assert_eq!(
            std::fs::read_to_string(fixture.root.join("out/x.jsonl"))
                .unwrap()
                .lines()
                .count(),
            3
        );

        let stats = fixture.telemetry.get("http_client").unwrap().unwrap();
        assert_eq!(stats.http_calls, 1);
    }
}
