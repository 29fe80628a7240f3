//! Exclusive lock guarding the collect phase of a step
//!
//! Two collect runs of the same step would clean up and re-aggregate the
//! same hierarchy concurrently. The lock is a file created atomically under
//! the lock directory and removed when the guard is dropped; a lock left by
//! a process that no longer runs is treated as stale and replaced.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Metadata stored in the lock file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectLockData {
    pub step: String,
    pub process_id: u32,
    pub hostname: String,
    pub acquired_at: DateTime<Utc>,
}

impl CollectLockData {
    fn new(step: &str) -> Self {
        Self {
            step: step.to_string(),
            process_id: std::process::id(),
            hostname: get_hostname(),
            acquired_at: Utc::now(),
        }
    }
}

fn get_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// RAII guard for the collect lock of one step
#[derive(Debug)]
pub struct CollectLock {
    step: String,
    lock_path: PathBuf,
}

impl CollectLock {
    pub fn lock_path(lock_dir: &Path, step: &str) -> PathBuf {
        lock_dir.join(format!("{}.collect.lock", step))
    }

    /// Acquires the lock, replacing a stale one. Fails with a lock error
    /// while another live process holds it.
    pub async fn acquire(lock_dir: &Path, step: &str) -> Result<Self> {
        tokio::fs::create_dir_all(lock_dir).await?;
        let lock_path = Self::lock_path(lock_dir, step);
        if let Some(lock) = Self::try_create(&lock_path, step).await? {
            return Ok(lock);
        }
        if !Self::remove_if_stale(&lock_path, step).await? {
            let holder = read_lock_info(&lock_path)
                .await
                .unwrap_or_else(|_| "unknown process".to_string());
            return Err(Error::Lock(format!(
                "Collect of step \"{}\" already in progress, lock held by {}",
                step, holder
            )));
        }
        Self::try_create(&lock_path, step).await?.ok_or_else(|| {
            Error::Lock(format!(
                "Collect lock of step \"{}\" was taken concurrently",
                step
            ))
        })
    }

    async fn try_create(lock_path: &Path, step: &str) -> Result<Option<Self>> {
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(lock_path)
            .await
        {
            Ok(mut file) => {
                let json = serde_json::to_string_pretty(&CollectLockData::new(step))?;
                file.write_all(json.as_bytes()).await?;
                info!("Acquired collect lock for step {}", step);
                Ok(Some(Self {
                    step: step.to_string(),
                    lock_path: lock_path.to_path_buf(),
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Returns true if the lock belonged to a dead process and was removed
    async fn remove_if_stale(lock_path: &Path, step: &str) -> Result<bool> {
        let contents = tokio::fs::read_to_string(lock_path).await?;
        let data: CollectLockData = serde_json::from_str(&contents)
            .map_err(|e| Error::Lock(format!("Unreadable lock file {}: {}", lock_path.display(), e)))?;
        if is_process_running(data.process_id) {
            return Ok(false);
        }
        warn!(
            "Removing stale collect lock of step {} (PID {} no longer running)",
            step, data.process_id
        );
        tokio::fs::remove_file(lock_path).await?;
        Ok(true)
    }
}

impl Drop for CollectLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.lock_path) {
            warn!("Failed to release collect lock for {}: {}", self.step, e);
        } else {
            info!("Released collect lock for step {}", self.step);
        }
    }
}

async fn read_lock_info(lock_path: &Path) -> Result<String> {
    let contents = tokio::fs::read_to_string(lock_path).await?;
    let data: CollectLockData = serde_json::from_str(&contents)?;
    Ok(format!(
        "PID {} on {} (acquired {})",
        data.process_id,
        data.hostname,
        data.acquired_at.format("%Y-%m-%d %H:%M:%S UTC")
    ))
}

/// Signal 0 probes for the process without affecting it
pub fn is_process_running(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_lock_is_exclusive_and_released() {
        let dir = TempDir::new().unwrap();
        let lock = CollectLock::acquire(dir.path(), "segmentation").await.unwrap();
        let err = CollectLock::acquire(dir.path(), "segmentation")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Lock(_)));
        assert!(err.to_string().contains("already in progress"));

        // other steps are independent
        let other = CollectLock::acquire(dir.path(), "measurement").await.unwrap();
        drop(other);

        drop(lock);
        assert!(!CollectLock::lock_path(dir.path(), "segmentation").exists());
        CollectLock::acquire(dir.path(), "segmentation").await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_lock_is_replaced() {
        let dir = TempDir::new().unwrap();
        let stale = CollectLockData {
            step: "segmentation".into(),
            process_id: 999_999_999,
            hostname: "elsewhere".into(),
            acquired_at: Utc::now(),
        };
        std::fs::write(
            CollectLock::lock_path(dir.path(), "segmentation"),
            serde_json::to_string(&stale).unwrap(),
        )
        .unwrap();
        let lock = CollectLock::acquire(dir.path(), "segmentation").await;
        assert!(lock.is_ok());
    }

    #[test]
    fn test_current_process_is_running() {
        assert!(is_process_running(std::process::id()));
    }
}
