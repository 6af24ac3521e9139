//! Log file retention management
//!
//! Deletes files under a store root whose modification time is older than the
//! retention period, either once or on a cancellable schedule.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::StoreError;

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// Delete every regular file under `root` older than `retain_days` days
///
/// Returns the number of files deleted.
pub fn sweep_expired(root: &Path, retain_days: u64) -> Result<usize> {
    let retention = Duration::from_secs(retain_days.saturating_mul(SECS_PER_DAY));
    let cutoff = SystemTime::now()
        .checked_sub(retention)
        .unwrap_or(SystemTime::UNIX_EPOCH);
    sweep_before(root, cutoff)
}

/// Delete every regular file under `root` last modified before `cutoff`
///
/// Unreadable sub-directories and failed deletions are logged and skipped;
/// only a failure to read `root` itself is an error.
pub fn sweep_before(root: &Path, cutoff: SystemTime) -> Result<usize> {
    if !root.exists() {
        return Ok(0);
    }

    let mut stack: Vec<PathBuf> = vec![root.to_path_buf()];
    let mut deleted_count = 0;

    while let Some(dir) = stack.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if dir == root => {
                return Err(e).with_context(|| format!("Failed to read {}", root.display()))
            }
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Skipping unreadable directory");
                continue;
            }
        };

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "Failed to read directory entry");
                    continue;
                }
            };
            let path = entry.path();

            // Symlinks are neither followed nor deleted
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_dir() {
                stack.push(path);
                continue;
            }
            if !file_type.is_file() {
                continue;
            }

            let modified = match entry.metadata().and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to read modification time");
                    continue;
                }
            };
            if modified >= cutoff {
                continue;
            }

            match fs::remove_file(&path) {
                Ok(()) => {
                    debug!(path = %path.display(), "Deleted expired log file");
                    deleted_count += 1;
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to delete expired log file"),
            }
        }
    }

    Ok(deleted_count)
}

/// Background task sweeping a store root on a fixed interval
///
/// The first sweep runs immediately. The next one is scheduled only after the
/// previous sweep finished, so sweeps never overlap. Dropping the task stops it.
#[derive(Debug)]
pub struct RetentionTask {
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl RetentionTask {
    /// Spawn the sweep loop on the current tokio runtime
    pub fn spawn(root: PathBuf, retain_days: u64, interval: Duration) -> Result<Self, StoreError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            StoreError::Runtime("retention sweep requires a running tokio runtime".to_string())
        })?;

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = runtime.spawn(async move {
            loop {
                let sweep_root = root.clone();
                let outcome =
                    tokio::task::spawn_blocking(move || sweep_expired(&sweep_root, retain_days))
                        .await;
                match outcome {
                    Ok(Ok(0)) => debug!(root = %root.display(), "Retention sweep found nothing to delete"),
                    Ok(Ok(count)) => info!(root = %root.display(), count, "Retention sweep deleted expired files"),
                    Ok(Err(e)) => warn!(root = %root.display(), error = %e, "Retention sweep failed"),
                    Err(e) => warn!(root = %root.display(), error = %e, "Retention sweep task aborted"),
                }

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    // Fires on explicit stop and when the sender is dropped
                    _ = &mut shutdown_rx => break,
                }
            }
            debug!(root = %root.display(), "Retention task stopped");
        });

        Ok(Self {
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    /// Ask the loop to stop after the sweep in progress, if any
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            // Ignore error if the loop already exited
            let _ = tx.send(());
        }
    }

    /// Stop the loop and wait for it to exit
    pub async fn shutdown(mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    /// Check whether the loop has exited
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }
}

impl Drop for RetentionTask {
    fn drop(&mut self) {
        self.stop();
    }
}
