//! Advisory file locking for the kernel's shared mutable stores.
//!
//! Writers take an exclusive lock on a sidecar `.lock` file; readers stay
//! lock-free and rely on atomic-rename snapshots.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;

/// An exclusive advisory lock, released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Block until the exclusive lock on `target`'s sidecar is held.
    ///
    /// Callers on an async runtime should wrap this in `spawn_blocking`.
    pub fn acquire(target: &Path) -> io::Result<Self> {
        let path = Self::sidecar(target);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        file.lock_exclusive()?;
        Ok(Self { file, path })
    }

    /// Try the lock without blocking; `None` when another writer holds it.
    pub fn try_acquire(target: &Path) -> io::Result<Option<Self>> {
        let path = Self::sidecar(target);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { file, path })),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sidecar(target: &Path) -> PathBuf {
        let mut name = target
            .file_name()
            .map_or_else(|| "state".to_string(), |n| n.to_string_lossy().into_owned());
        name.push_str(".lock");
        target.with_file_name(name)
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = fs2::FileExt::unlock(&self.file) {
            tracing::debug!(path = %self.path.display(), "Failed to release advisory lock: {e}");
        }
    }
}
