use crate::models::RequestStage;
use crate::services::cleanup::{CleanupJob, CleanupStats, DeleteOutcome, RetryPolicy, delete_with_retry};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::sleep;

/// Background task that drains the cleanup queue.
///
/// Each job runs in its own task so a retry backoff on one request's files
/// never delays another's.
pub struct CleanupWorker {
    rx: mpsc::Receiver<CleanupJob>,
    stats: Arc<CleanupStats>,
    policy: RetryPolicy,
    delay: Duration,
    shutdown: watch::Receiver<bool>,
}

impl CleanupWorker {
    pub fn new(
        rx: mpsc::Receiver<CleanupJob>,
        stats: Arc<CleanupStats>,
        policy: RetryPolicy,
        delay: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            rx,
            stats,
            policy,
            delay,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        tracing::info!("🧹 Cleanup worker started");
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    tracing::info!("🛑 Cleanup worker shutting down");
                    break;
                }
                job = self.rx.recv() => {
                    match job {
                        Some(job) => {
                            in_flight.spawn(process_job(
                                job,
                                self.stats.clone(),
                                self.policy,
                                self.delay,
                                self.shutdown.clone(),
                            ));
                        }
                        None => break,
                    }
                }
                // Reap finished jobs so the set does not grow unbounded
                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
            }
        }

        // Files already handed over still get deleted before exit
        self.rx.close();
        while let Some(job) = self.rx.recv().await {
            in_flight.spawn(process_job(
                job,
                self.stats.clone(),
                self.policy,
                Duration::ZERO,
                self.shutdown.clone(),
            ));
        }
        while in_flight.join_next().await.is_some() {}

        let stats = self.stats.snapshot();
        tracing::info!(
            removed = stats.removed,
            already_absent = stats.already_absent,
            failed = stats.failed,
            "✅ Cleanup worker drained"
        );
    }
}

async fn process_job(
    job: CleanupJob,
    stats: Arc<CleanupStats>,
    policy: RetryPolicy,
    delay: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    // Settle time for file handles still held by the response path,
    // cut short once shutdown starts
    if !delay.is_zero() && !*shutdown.borrow() {
        tokio::select! {
            _ = sleep(delay) => {}
            _ = shutdown.changed() => {}
        }
    }

    let files = job.paths.len();
    for path in job.paths {
        let result = delete_with_retry(&path, policy).await;
        match &result {
            Ok(DeleteOutcome::Removed) => {
                tracing::debug!(path = %path.display(), "Removed temp file");
            }
            Ok(DeleteOutcome::AlreadyAbsent) => {
                tracing::debug!(path = %path.display(), "Temp file already absent");
            }
            Err(e) => {
                tracing::error!(
                    path = %e.path.display(),
                    attempts = e.attempts,
                    error = %e.source,
                    "Failed to delete temp file"
                );
            }
        }
        stats.record(&result);
    }
    tracing::debug!(stage = %RequestStage::CleanedUp, files, "Cleanup job finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::cleanup::CleanupManager;
    use std::path::PathBuf;

    fn spawn_worker(delay: Duration) -> (CleanupManager, watch::Sender<bool>, tokio::task::JoinHandle<()>) {
        let (manager, rx, stats) = CleanupManager::new(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff: Duration::from_millis(1),
        };
        let worker = CleanupWorker::new(rx, stats, policy, delay, shutdown_rx);
        let handle = tokio::spawn(worker.run());
        (manager, shutdown_tx, handle)
    }

    #[tokio::test]
    async fn test_worker_deletes_scheduled_files() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.jpg");
        let output = dir.path().join("output.webp");
        std::fs::write(&input, b"in").unwrap();
        std::fs::write(&output, b"out").unwrap();

        let (manager, _shutdown, _handle) = spawn_worker(Duration::from_millis(5));
        manager.schedule(vec![input.clone(), output.clone()]);

        assert!(manager.wait_idle(Duration::from_secs(5)).await);
        assert!(!input.exists());
        assert!(!output.exists());

        let stats = manager.stats();
        assert_eq!(stats.scheduled, 2);
        assert_eq!(stats.removed, 2);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test]
    async fn test_worker_treats_missing_files_as_done() {
        let (manager, _shutdown, _handle) = spawn_worker(Duration::ZERO);
        manager.schedule(vec![PathBuf::from("/nonexistent/optimizer/output.webp")]);

        assert!(manager.wait_idle(Duration::from_secs(5)).await);
        let stats = manager.stats();
        assert_eq!(stats.already_absent, 1);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test]
    async fn test_worker_contains_delete_failures() {
        let dir = tempfile::tempdir().unwrap();
        let stubborn = dir.path().join("stubborn");
        std::fs::create_dir(&stubborn).unwrap();
        let normal = dir.path().join("normal.png");
        std::fs::write(&normal, b"x").unwrap();

        let (manager, _shutdown, _handle) = spawn_worker(Duration::ZERO);
        manager.schedule(vec![stubborn.clone(), normal.clone()]);

        assert!(manager.wait_idle(Duration::from_secs(5)).await);
        let stats = manager.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.removed, 1);
        assert!(!normal.exists());
    }

    #[tokio::test]
    async fn test_shutdown_drains_queued_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("late.avif");
        std::fs::write(&path, b"x").unwrap();

        let (manager, shutdown, handle) = spawn_worker(Duration::from_millis(50));
        manager.schedule(vec![path.clone()]);
        shutdown.send(true).unwrap();

        handle.await.unwrap();
        assert!(!path.exists());
        assert_eq!(manager.stats().pending, 0);
    }
}
