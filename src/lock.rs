//! On-disk store lock.
//!
//! Serializes all mutating operations against one store, including across
//! processes. The lock is a file inside the store's git directory created
//! with exclusive-create semantics and holding a small JSON owner blob
//! `{pid, created_at_ms}`.
//!
//! Contention retries every 50 ms until a deadline (default 10 s) and then
//! surfaces [`Error::Busy`]. A lock older than 10 minutes is presumed
//! abandoned by a crashed process and reclaimed.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Lock file name inside `<store>/.git/`.
pub const LOCK_FILE_NAME: &str = ".hivemind-memory.lock";

const RETRY_INTERVAL: Duration = Duration::from_millis(50);
const STALE_AFTER_MS: i64 = 10 * 60 * 1000;

/// Default acquisition deadline.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(10);

/// Owner metadata written into the lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockOwner {
    pid: u32,
    created_at_ms: i64,
}

impl LockOwner {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            created_at_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    fn is_stale(&self) -> bool {
        chrono::Utc::now().timestamp_millis() - self.created_at_ms > STALE_AFTER_MS
    }
}

/// File-based lock over one store directory.
#[derive(Debug, Clone)]
pub struct StoreLock {
    lock_path: PathBuf,
}

impl StoreLock {
    /// Lock for the store whose git directory is `git_dir`.
    pub fn new(git_dir: &Path) -> Self {
        Self {
            lock_path: git_dir.join(LOCK_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.lock_path
    }

    /// Acquire with the default 10 s deadline.
    pub async fn acquire(&self) -> Result<LockGuard> {
        self.acquire_with_deadline(DEFAULT_DEADLINE).await
    }

    /// Acquire the lock, retrying until `deadline` elapses.
    pub async fn acquire_with_deadline(&self, deadline: Duration) -> Result<LockGuard> {
        let started = Instant::now();

        loop {
            if let Some(parent) = self.lock_path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.lock_path)
            {
                Ok(file) => {
                    let owner = LockOwner::current();
                    serde_json::to_writer(&file, &owner)?;
                    let waited = started.elapsed();
                    if waited > Duration::from_secs(1) {
                        warn!(path = %self.lock_path.display(), ?waited, "slow lock acquisition");
                    } else {
                        debug!(path = %self.lock_path.display(), "lock acquired");
                    }
                    return Ok(LockGuard {
                        lock_path: self.lock_path.clone(),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let holder = self.read_owner();

                    if let Some(ref owner) = holder {
                        if owner.is_stale() {
                            warn!(
                                pid = owner.pid,
                                path = %self.lock_path.display(),
                                "reclaiming stale lock"
                            );
                            let _ = std::fs::remove_file(&self.lock_path);
                            continue;
                        }
                    } else if !self.lock_path.exists() {
                        // Holder released between our create attempt and the
                        // owner read.
                        continue;
                    }

                    if started.elapsed() >= deadline {
                        return Err(Error::Busy {
                            path: self.lock_path.display().to_string(),
                            held_by: holder.map(|o| o.pid).unwrap_or(0),
                        });
                    }

                    tokio::time::sleep(RETRY_INTERVAL).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn read_owner(&self) -> Option<LockOwner> {
        let content = std::fs::read_to_string(&self.lock_path).ok()?;
        serde_json::from_str(&content).ok()
    }
}

/// RAII guard; releasing is removing the lock file.
#[derive(Debug)]
pub struct LockGuard {
    lock_path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.lock_path) {
            warn!(path = %self.lock_path.display(), error = %e, "failed to release lock");
        }
    }
}
