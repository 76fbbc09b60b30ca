use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::sleep;
use tracing::{debug, warn};
use utoipa::ToSchema;

/// How hard to try before giving up on a delete.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Delay after attempt `n` (1-based) is `backoff * n`
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Removed,
    /// Nothing to delete; the target state was already reached
    AlreadyAbsent,
}

#[derive(Debug, Error)]
#[error("Failed to delete {path} after {attempts} attempts: {source}")]
pub struct CleanupError {
    pub path: PathBuf,
    pub attempts: u32,
    pub source: std::io::Error,
}

/// Deletes `path`, retrying transient failures with linear backoff.
/// A missing file counts as success on every attempt.
pub async fn delete_with_retry(path: &Path, policy: RetryPolicy) -> Result<DeleteOutcome, CleanupError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match tokio::fs::remove_file(path).await {
            Ok(()) => return Ok(DeleteOutcome::Removed),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(DeleteOutcome::AlreadyAbsent),
            Err(e) if attempt >= max_attempts => {
                return Err(CleanupError {
                    path: path.to_path_buf(),
                    attempts: attempt,
                    source: e,
                });
            }
            Err(e) => {
                debug!(
                    path = %path.display(),
                    attempt,
                    error = %e,
                    "Delete failed, retrying"
                );
                sleep(policy.backoff * attempt).await;
                attempt += 1;
            }
        }
    }
}

/// A batch of paths created by one request.
#[derive(Debug, Clone)]
pub struct CleanupJob {
    pub paths: Vec<PathBuf>,
}

#[derive(Debug, Default)]
pub struct CleanupStats {
    scheduled: AtomicU64,
    pending: AtomicU64,
    removed: AtomicU64,
    already_absent: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
pub struct CleanupSnapshot {
    /// Paths handed to the cleanup manager since startup
    pub scheduled: u64,
    /// Paths not yet processed
    pub pending: u64,
    pub removed: u64,
    pub already_absent: u64,
    /// Paths still on disk after all retries
    pub failed: u64,
}

impl CleanupStats {
    pub fn snapshot(&self) -> CleanupSnapshot {
        CleanupSnapshot {
            scheduled: self.scheduled.load(Ordering::Relaxed),
            pending: self.pending.load(Ordering::Relaxed),
            removed: self.removed.load(Ordering::Relaxed),
            already_absent: self.already_absent.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    fn enqueued(&self, count: u64) {
        self.scheduled.fetch_add(count, Ordering::Relaxed);
        self.pending.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record(&self, result: &Result<DeleteOutcome, CleanupError>) {
        match result {
            Ok(DeleteOutcome::Removed) => self.removed.fetch_add(1, Ordering::Relaxed),
            Ok(DeleteOutcome::AlreadyAbsent) => self.already_absent.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.failed.fetch_add(1, Ordering::Relaxed),
        };
        self.pending.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Handle used by request handlers to hand files over for deletion.
///
/// Cheap to clone. `schedule` never blocks and never fails the caller; the
/// actual deletes happen on the [`CleanupWorker`](super::worker::CleanupWorker).
#[derive(Debug, Clone)]
pub struct CleanupManager {
    tx: mpsc::Sender<CleanupJob>,
    stats: Arc<CleanupStats>,
}

impl CleanupManager {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<CleanupJob>, Arc<CleanupStats>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let stats = Arc::new(CleanupStats::default());
        (
            Self {
                tx,
                stats: stats.clone(),
            },
            rx,
            stats,
        )
    }

    pub fn schedule(&self, paths: Vec<PathBuf>) {
        if paths.is_empty() {
            return;
        }

        self.stats.enqueued(paths.len() as u64);
        let job = CleanupJob { paths };

        match self.tx.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(job)) => {
                warn!("Cleanup queue full, deferring job with {} paths", job.paths.len());
                let tx = self.tx.clone();
                let stats = self.stats.clone();
                tokio::spawn(async move {
                    if let Err(e) = tx.send(job).await {
                        orphaned(&stats, e.0);
                    }
                });
            }
            Err(TrySendError::Closed(job)) => orphaned(&self.stats, job),
        }
    }

    pub fn stats(&self) -> CleanupSnapshot {
        self.stats.snapshot()
    }

    /// Waits until every scheduled path has been processed or `timeout` passes.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.stats.pending.load(Ordering::Relaxed) > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            sleep(Duration::from_millis(5)).await;
        }
        true
    }
}

fn orphaned(stats: &CleanupStats, job: CleanupJob) {
    for path in job.paths {
        tracing::error!(
            path = %path.display(),
            "Cleanup worker is gone, file left on disk"
        );
        stats.failed.fetch_add(1, Ordering::Relaxed);
        stats.pending.fetch_sub(1, Ordering::Relaxed);
    }
}
