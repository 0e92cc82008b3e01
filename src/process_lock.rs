//! Cross-process named lock
//!
//! An advisory lock used when one database is shared between processes,
//! e.g. on a networked filesystem. The lock name is derived
//! deterministically from the database path with a namespace UUID, so
//! every process contending for the same path agrees on the same lock
//! file without coordination.

use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::warn;
use uuid::Uuid;

/// Poll interval while waiting for the lock.
const ACQUIRE_POLL: Duration = Duration::from_millis(50);

/// Default bound on how long acquisition may wait.
const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// A lock file untouched for this long is considered abandoned by a
/// dead process and is broken.
const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(60);

/// Derive the lock name for a database path.
pub fn graph_lock_name(db_path: &str) -> String {
    format!(
        "graph-lock-{}",
        Uuid::new_v5(&Uuid::NAMESPACE_OID, db_path.as_bytes())
    )
}

/// A named lock living in a shared lock directory.
#[derive(Debug, Clone)]
pub struct NamedProcessLock {
    lock_path: PathBuf,
    acquire_timeout: Duration,
    stale_after: Duration,
}

/// Held lock; released on drop or via [`ProcessLockGuard::release`].
#[derive(Debug)]
pub struct ProcessLockGuard {
    lock_path: PathBuf,
    released: bool,
}

impl NamedProcessLock {
    pub fn new(locks_dir: impl AsRef<Path>, name: &str) -> Self {
        Self {
            lock_path: locks_dir.as_ref().join(format!("{name}.lock")),
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            stale_after: DEFAULT_STALE_AFTER,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Acquire the lock, blocking the current thread.
    ///
    /// Intended to be called from a worker thread (the adapter runs it
    /// inside its blocking query closure). Stale lock files left behind
    /// by dead processes are broken after [`DEFAULT_STALE_AFTER`].
    pub fn acquire_blocking(&self) -> Result<ProcessLockGuard> {
        if let Some(parent) = self.lock_path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create lock directory: {}", parent.display())
            })?;
        }

        let deadline = SystemTime::now() + self.acquire_timeout;
        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.lock_path)
            {
                Ok(mut file) => {
                    let _ = write!(file, "{}", std::process::id());
                    return Ok(ProcessLockGuard {
                        lock_path: self.lock_path.clone(),
                        released: false,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    self.break_if_stale()?;
                    if SystemTime::now() >= deadline {
                        anyhow::bail!(
                            "timed out waiting for process lock: {}",
                            self.lock_path.display()
                        );
                    }
                    std::thread::sleep(ACQUIRE_POLL);
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("failed to create lock file: {}", self.lock_path.display())
                    })
                }
            }
        }
    }

    fn break_if_stale(&self) -> Result<()> {
        let Ok(metadata) = fs::metadata(&self.lock_path) else {
            return Ok(()); // Holder released between our attempts.
        };
        let Ok(modified) = metadata.modified() else {
            return Ok(());
        };
        if SystemTime::now()
            .duration_since(modified)
            .map(|age| age > self.stale_after)
            .unwrap_or(false)
        {
            warn!(
                "breaking stale process lock: {}",
                self.lock_path.display()
            );
            let _ = fs::remove_file(&self.lock_path);
        }
        Ok(())
    }
}

impl ProcessLockGuard {
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            let _ = fs::remove_file(&self.lock_path);
        }
    }
}

impl Drop for ProcessLockGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_name_is_deterministic() {
        let a = graph_lock_name("/data/graph.db");
        let b = graph_lock_name("/data/graph.db");
        let c = graph_lock_name("/data/other.db");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_acquire_and_release() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let lock = NamedProcessLock::new(dir.path(), "test");

        let guard = lock.acquire_blocking()?;
        assert!(dir.path().join("test.lock").exists());
        guard.release();
        assert!(!dir.path().join("test.lock").exists());
        Ok(())
    }

    #[test]
    fn test_contention_times_out() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let lock = NamedProcessLock::new(dir.path(), "contended")
            .with_timeout(Duration::from_millis(200));

        let _held = lock.acquire_blocking()?;
        let err = lock.acquire_blocking().unwrap_err();
        assert!(err.to_string().contains("timed out"));
        Ok(())
    }

    #[test]
    fn test_guard_releases_on_drop() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let lock = NamedProcessLock::new(dir.path(), "dropped");
        {
            let _guard = lock.acquire_blocking()?;
            assert!(dir.path().join("dropped.lock").exists());
        }
        assert!(!dir.path().join("dropped.lock").exists());

        // A second acquisition now succeeds immediately.
        let _guard = lock.acquire_blocking()?;
        Ok(())
    }
}
