//! Single-instance guard.
//!
//! An advisory lock file stops a second process from double-submitting
//! orders. The lock records the holder's pid and start time; a lock older
//! than the stale timeout may be reclaimed (the previous holder died
//! without cleanup).

use crate::domain::errors::EngineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

pub const STALE_LOCK_TIMEOUT: Duration = Duration::from_secs(3600);

#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    started_at: DateTime<Utc>,
}

pub struct InstanceLock {
    path: PathBuf,
    held: bool,
}

impl InstanceLock {
    /// Acquire the lock or fail with `LockHeld`. A stale lock (older than
    /// `stale_after`) is reclaimed once.
    pub fn acquire(path: impl AsRef<Path>, stale_after: Duration) -> Result<Self, EngineError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| EngineError::Config(format!("cannot create lock dir: {}", e)))?;
        }

        match Self::try_create(&path) {
            Ok(lock) => Ok(lock),
            Err(EngineError::LockHeld(holder)) => {
                if Self::is_stale(&path, stale_after) {
                    warn!("[LOCK] reclaiming stale lock at {}", path.display());
                    let _ = std::fs::remove_file(&path);
                    Self::try_create(&path)
                } else {
                    Err(EngineError::LockHeld(holder))
                }
            }
            Err(e) => Err(e),
        }
    }

    fn try_create(path: &Path) -> Result<InstanceLock, EngineError> {
        let mut options = std::fs::OpenOptions::new();
        options.write(true).create_new(true);
        match options.open(path) {
            Ok(file) => {
                let info = LockInfo {
                    pid: std::process::id(),
                    started_at: Utc::now(),
                };
                serde_json::to_writer(&file, &info)
                    .map_err(|e| EngineError::Config(format!("cannot write lock file: {}", e)))?;
                info!("[LOCK] instance lock acquired: pid={}", info.pid);
                Ok(InstanceLock {
                    path: path.to_path_buf(),
                    held: true,
                })
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let holder = std::fs::read_to_string(path)
                    .ok()
                    .and_then(|text| serde_json::from_str::<LockInfo>(&text).ok())
                    .map(|i| format!("pid {} since {}", i.pid, i.started_at))
                    .unwrap_or_else(|| "unknown holder".to_string());
                Err(EngineError::LockHeld(holder))
            }
            Err(e) => Err(EngineError::Config(format!("cannot create lock file: {}", e))),
        }
    }

    fn is_stale(path: &Path, stale_after: Duration) -> bool {
        let Some(info) = std::fs::read_to_string(path)
            .ok()
            .and_then(|text| serde_json::from_str::<LockInfo>(&text).ok())
        else {
            // Unreadable lock: treat as stale, it cannot identify a holder.
            return true;
        };
        let age = Utc::now() - info.started_at;
        age.to_std().map(|a| a >= stale_after).unwrap_or(false)
    }

    pub fn release(&mut self) {
        if self.held {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!("[LOCK] failed to remove lock file: {}", e);
            } else {
                info!("[LOCK] instance lock released");
            }
            self.held = false;
        }
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        self.release();
    }
}
