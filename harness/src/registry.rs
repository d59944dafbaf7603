//! Persistent record of running agent threads.
//!
//! Hydrates harness state across process restarts and gives the
//! intervention surface (`pause`, `resume`, `inject_message`) a
//! deterministic address for every thread. Writes serialize through an
//! advisory lock and land atomically.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use kiwi_types::{CostSnapshot, DirectiveId, Limits, ThreadId};
use kiwi_utils::{AtomicWriteOptions, FileLock, atomic_write_with_options, recover_bak_file};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ThreadRegistryError {
    #[error("registry io at '{path}': {reason}")]
    Io { path: String, reason: String },
    #[error("registry file at '{path}' is malformed: {reason}")]
    Malformed { path: String, reason: String },
    #[error("no thread '{0}' in the registry")]
    UnknownThread(ThreadId),
}

/// Lifecycle state of one thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    Init,
    Running,
    Paused,
    Succeeded,
    Failed,
    Aborted,
}

impl ThreadStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Aborted)
    }
}

/// One persisted thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadRecord {
    pub thread_id: ThreadId,
    pub directive_id: DirectiveId,
    pub status: ThreadStatus,
    pub cost_budget: Limits,
    pub total_usage: CostSnapshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_thread_id: Option<ThreadId>,
    pub created_at: DateTime<Utc>,
    pub last_event_at: DateTime<Utc>,
    /// Messages injected from outside, drained by the agent loop at the
    /// next checkpoint.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub injected_messages: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    threads: BTreeMap<String, ThreadRecord>,
}

/// The thread registry, one JSON file per kernel.
#[derive(Debug, Clone)]
pub struct ThreadRegistry {
    path: PathBuf,
}

impl ThreadRegistry {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Conventional location under a user scope dir.
    #[must_use]
    pub fn at_user_scope(user_dir: &Path) -> Self {
        Self::new(user_dir.join("threads.json"))
    }

    fn io_err(&self, e: impl std::fmt::Display) -> ThreadRegistryError {
        ThreadRegistryError::Io {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        }
    }

    fn load(&self) -> Result<RegistryFile, ThreadRegistryError> {
        recover_bak_file(&self.path);
        if !self.path.exists() {
            return Ok(RegistryFile::default());
        }
        let content = std::fs::read_to_string(&self.path).map_err(|e| self.io_err(e))?;
        serde_json::from_str(&content).map_err(|e| ThreadRegistryError::Malformed {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        })
    }

    fn store(&self, file: &RegistryFile) -> Result<(), ThreadRegistryError> {
        let json = serde_json::to_vec_pretty(file).map_err(|e| self.io_err(e))?;
        atomic_write_with_options(&self.path, &json, AtomicWriteOptions::sensitive())
            .map_err(|e| self.io_err(e))
    }

    fn mutate<R>(
        &self,
        f: impl FnOnce(&mut RegistryFile) -> Result<R, ThreadRegistryError>,
    ) -> Result<R, ThreadRegistryError> {
        let _lock = FileLock::acquire(&self.path).map_err(|e| self.io_err(e))?;
        let mut file = self.load()?;
        let result = f(&mut file)?;
        self.store(&file)?;
        Ok(result)
    }

    fn mutate_thread<R>(
        &self,
        thread_id: ThreadId,
        f: impl FnOnce(&mut ThreadRecord) -> R,
    ) -> Result<R, ThreadRegistryError> {
        self.mutate(|file| {
            let record = file
                .threads
                .get_mut(&thread_id.to_string())
                .ok_or(ThreadRegistryError::UnknownThread(thread_id))?;
            record.last_event_at = Utc::now();
            Ok(f(record))
        })
    }

    /// Register a freshly started thread.
    pub fn register(
        &self,
        thread_id: ThreadId,
        directive_id: DirectiveId,
        cost_budget: Limits,
        parent_thread_id: Option<ThreadId>,
    ) -> Result<ThreadRecord, ThreadRegistryError> {
        let now = Utc::now();
        let record = ThreadRecord {
            thread_id,
            directive_id,
            status: ThreadStatus::Init,
            cost_budget,
            total_usage: CostSnapshot::default(),
            parent_thread_id,
            created_at: now,
            last_event_at: now,
            injected_messages: Vec::new(),
        };
        self.mutate(|file| {
            file.threads.insert(thread_id.to_string(), record.clone());
            Ok(())
        })?;
        Ok(record)
    }

    pub fn get(&self, thread_id: ThreadId) -> Result<Option<ThreadRecord>, ThreadRegistryError> {
        Ok(self.load()?.threads.remove(&thread_id.to_string()))
    }

    pub fn list(&self) -> Result<Vec<ThreadRecord>, ThreadRegistryError> {
        Ok(self.load()?.threads.into_values().collect())
    }

    pub fn set_status(
        &self,
        thread_id: ThreadId,
        status: ThreadStatus,
    ) -> Result<(), ThreadRegistryError> {
        self.mutate_thread(thread_id, |record| {
            record.status = status;
        })
    }

    pub fn update_usage(
        &self,
        thread_id: ThreadId,
        usage: CostSnapshot,
    ) -> Result<(), ThreadRegistryError> {
        self.mutate_thread(thread_id, |record| {
            record.total_usage = usage;
        })
    }

    /// Pause a running thread; it holds before its next `before_step`.
    pub fn pause(&self, thread_id: ThreadId) -> Result<(), ThreadRegistryError> {
        self.mutate_thread(thread_id, |record| {
            if record.status == ThreadStatus::Running || record.status == ThreadStatus::Init {
                record.status = ThreadStatus::Paused;
            }
        })
    }

    pub fn resume(&self, thread_id: ThreadId) -> Result<(), ThreadRegistryError> {
        self.mutate_thread(thread_id, |record| {
            if record.status == ThreadStatus::Paused {
                record.status = ThreadStatus::Running;
            }
        })
    }

    /// Queue a message for the thread's next checkpoint.
    pub fn inject_message(
        &self,
        thread_id: ThreadId,
        message: impl Into<String>,
    ) -> Result<(), ThreadRegistryError> {
        let message = message.into();
        self.mutate_thread(thread_id, move |record| {
            record.injected_messages.push(message);
        })
    }

    /// Take all queued messages for a thread.
    pub fn drain_messages(&self, thread_id: ThreadId) -> Result<Vec<String>, ThreadRegistryError> {
        self.mutate_thread(thread_id, |record| std::mem::take(&mut record.injected_messages))
    }
}
