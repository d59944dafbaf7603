//! Atomic YAML telemetry counters keyed by stable tool id.
//!
//! Telemetry is opt-in and lives centrally (never inside tool files). Every
//! update happens under an advisory file lock and lands via temp-file plus
//! atomic rename, mode 0600, so concurrent writers serialize and readers
//! always see a consistent snapshot.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use kiwi_utils::{AtomicWriteOptions, FileLock, atomic_write_with_options, recover_bak_file};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Telemetry file schema version.
pub const TELEMETRY_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("telemetry io at '{path}': {reason}")]
    Io { path: String, reason: String },
    #[error("telemetry file at '{path}' is malformed: {reason}")]
    Malformed { path: String, reason: String },
}

/// How one execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
    Timeout,
}

/// One execution observation.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub item_id: String,
    pub item_type: String,
    pub outcome: Outcome,
    pub duration_ms: u64,
    pub http_calls: u64,
    pub subprocess_calls: u64,
    pub error: Option<String>,
    pub path: Option<PathBuf>,
}

/// Per-item counters as persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemStats {
    #[serde(rename = "type")]
    pub item_type: String,
    pub total_runs: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub timeout_count: u64,
    pub avg_duration_ms: f64,
    pub http_calls: u64,
    pub subprocess_calls: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_outcome: Option<Outcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<String>,
}

impl ItemStats {
    fn observe(&mut self, record: &ExecutionRecord, now: DateTime<Utc>) {
        self.item_type = record.item_type.clone();
        self.total_runs += 1;
        match record.outcome {
            Outcome::Success => self.success_count += 1,
            Outcome::Failure => self.failure_count += 1,
            Outcome::Timeout => self.timeout_count += 1,
        }
        // Welford's running mean keeps the average stable over long
        // histories without storing totals.
        let delta = record.duration_ms as f64 - self.avg_duration_ms;
        self.avg_duration_ms += delta / self.total_runs as f64;

        self.http_calls += record.http_calls;
        self.subprocess_calls += record.subprocess_calls;
        self.last_run = Some(now);
        self.last_outcome = Some(record.outcome);
        self.last_error = record.error.clone();
        if let Some(path) = &record.path {
            let path = path.display().to_string();
            if !self.paths.contains(&path) {
                self.paths.push(path);
            }
        }
    }
}

/// On-disk document.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TelemetryFile {
    version: u32,
    updated: DateTime<Utc>,
    #[serde(default)]
    items: BTreeMap<String, ItemStats>,
}

impl Default for TelemetryFile {
    fn default() -> Self {
        Self {
            version: TELEMETRY_VERSION,
            updated: Utc::now(),
            items: BTreeMap::new(),
        }
    }
}

/// The central telemetry store.
#[derive(Debug, Clone)]
pub struct TelemetryStore {
    path: PathBuf,
    enabled: bool,
}

impl TelemetryStore {
    #[must_use]
    pub fn new(path: PathBuf, enabled: bool) -> Self {
        Self { path, enabled }
    }

    /// Conventional location under a user scope dir.
    #[must_use]
    pub fn at_user_scope(user_dir: &Path, enabled: bool) -> Self {
        Self::new(user_dir.join("telemetry.yaml"), enabled)
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn io_err(&self, e: impl std::fmt::Display) -> TelemetryError {
        TelemetryError::Io {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        }
    }

    fn load_unlocked(&self) -> Result<TelemetryFile, TelemetryError> {
        recover_bak_file(&self.path);
        if !self.path.exists() {
            return Ok(TelemetryFile::default());
        }
        let content = std::fs::read_to_string(&self.path).map_err(|e| self.io_err(e))?;
        serde_yaml::from_str(&content).map_err(|e| TelemetryError::Malformed {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        })
    }

    fn store_unlocked(&self, file: &TelemetryFile) -> Result<(), TelemetryError> {
        let yaml = serde_yaml::to_string(file).map_err(|e| self.io_err(e))?;
        atomic_write_with_options(&self.path, yaml.as_bytes(), AtomicWriteOptions::sensitive())
            .map_err(|e| self.io_err(e))
    }

    /// Record one execution. A no-op when telemetry is disabled.
    ///
    /// Callers on an async runtime should wrap this in `spawn_blocking`.
    pub fn record_execution(&self, record: &ExecutionRecord) -> Result<(), TelemetryError> {
        if !self.enabled {
            return Ok(());
        }
        let _lock = FileLock::acquire(&self.path).map_err(|e| self.io_err(e))?;
        let mut file = self.load_unlocked()?;
        file.updated = Utc::now();
        file.items
            .entry(record.item_id.clone())
            .or_default()
            .observe(record, file.updated);
        self.store_unlocked(&file)?;
        debug!(item = %record.item_id, outcome = ?record.outcome, "recorded execution");
        Ok(())
    }

    /// Stats for one item, if any were recorded.
    pub fn get(&self, item_id: &str) -> Result<Option<ItemStats>, TelemetryError> {
        Ok(self.load_unlocked()?.items.remove(item_id))
    }

    /// Remove one item's stats, or the whole file when `item_id` is `None`.
    pub fn clear(&self, item_id: Option<&str>) -> Result<(), TelemetryError> {
        if !self.enabled {
            return Ok(());
        }
        let _lock = FileLock::acquire(&self.path).map_err(|e| self.io_err(e))?;
        match item_id {
            Some(item_id) => {
                let mut file = self.load_unlocked()?;
                file.items.remove(item_id);
                file.updated = Utc::now();
                self.store_unlocked(&file)?;
            }
            None => {
                if self.path.exists() {
                    std::fs::remove_file(&self.path).map_err(|e| self.io_err(e))?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::{ExecutionRecord, Outcome, TelemetryStore};

    fn record(item_id: &str, outcome: Outcome, duration_ms: u64) -> ExecutionRecord {
        ExecutionRecord {
            item_id: item_id.to_string(),
            item_type: "tool".to_string(),
            outcome,
            duration_ms,
            http_calls: 0,
            subprocess_calls: 1,
            error: None,
            path: Some(PathBuf::from("/tools/echo.py")),
        }
    }

    fn store(dir: &std::path::Path) -> TelemetryStore {
        TelemetryStore::at_user_scope(dir, true)
    }

    #[test]
    fn records_counters_and_last_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        store
            .record_execution(&record("echo", Outcome::Success, 12))
            .unwrap();
        store
            .record_execution(&record("echo", Outcome::Failure, 20))
            .unwrap();

        let stats = store.get("echo").unwrap().expect("stats");
        assert_eq!(stats.total_runs, 2);
        assert_eq!(stats.success_count, 1);
        assert_eq!(stats.failure_count, 1);
        assert_eq!(stats.subprocess_calls, 2);
        assert_eq!(stats.last_outcome, Some(Outcome::Failure));
        assert_eq!(stats.paths, vec!["/tools/echo.py"]);
    }

    #[test]
    fn welford_average_over_durations() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        for duration in [100, 200, 300] {
            store
                .record_execution(&record("t", Outcome::Success, duration))
                .unwrap();
        }
        let stats = store.get("t").unwrap().unwrap();
        assert!((stats.avg_duration_ms - 200.0).abs() < 1e-9);
    }

    #[test]
    fn concurrent_writers_lose_no_runs() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let n = 16;

        std::thread::scope(|scope| {
            for _ in 0..n {
                let store = store.clone();
                scope.spawn(move || {
                    store
                        .record_execution(&record("hot", Outcome::Success, 5))
                        .unwrap();
                });
            }
        });

        let stats = store.get("hot").unwrap().unwrap();
        assert_eq!(stats.total_runs, n);
    }

    #[test]
    fn disabled_store_never_touches_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = TelemetryStore::at_user_scope(dir.path(), false);
        store
            .record_execution(&record("echo", Outcome::Success, 1))
            .unwrap();
        assert!(!dir.path().join("telemetry.yaml").exists());
        assert!(store.get("echo").unwrap().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn telemetry_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store
            .record_execution(&record("echo", Outcome::Success, 1))
            .unwrap();
        let mode = std::fs::metadata(dir.path().join("telemetry.yaml"))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn clear_one_item_and_all() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store
            .record_execution(&record("a", Outcome::Success, 1))
            .unwrap();
        store
            .record_execution(&record("b", Outcome::Timeout, 1))
            .unwrap();

        store.clear(Some("a")).unwrap();
        assert!(store.get("a").unwrap().is_none());
        assert_eq!(store.get("b").unwrap().unwrap().timeout_count, 1);

        store.clear(None).unwrap();
        assert!(store.get("b").unwrap().is_none());
    }
}
