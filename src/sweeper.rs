//! Cleanup sweeper: retention-based deletion of terminal jobs.
//!
//! Deletion is a periodic, idempotent sweep rather than an in-process
//! delayed task, so a restart never loses a pending deletion. Two passes
//! per tick:
//!
//! - completed jobs go after a short grace period, just long enough for a
//!   polling observer to see the terminal state at least once
//! - failed and cancelled jobs are kept for a longer diagnostics window
//!
//! Pending and running jobs are never deleted regardless of age; the
//! heartbeat monitor or explicit cancellation must move them to a terminal
//! state first.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::job::{Job, JobStatus};
use crate::metrics;
use crate::store::{JobStore, StoreError};

/// Sweeper tuning knobs.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Sweep interval.
    pub interval: Duration,
    /// How long completed jobs stay visible.
    pub completion_grace_period: Duration,
    /// How long failed/cancelled jobs stay for diagnostics.
    pub retention_period: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            completion_grace_period: Duration::from_secs(30),
            retention_period: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// Outcome of one cleanup sweep.
#[derive(Debug, Clone, Copy, Default)]
pub struct CleanupReport {
    /// Completed jobs deleted past the grace period.
    pub completed_deleted: usize,
    /// Failed/cancelled jobs deleted past the retention window.
    pub expired_deleted: usize,
    /// Jobs whose deletion errored (logged, sweep continued).
    pub errors: usize,
}

impl CleanupReport {
    pub fn total_deleted(&self) -> usize {
        self.completed_deleted + self.expired_deleted
    }
}

/// Periodic retention sweep over terminal jobs.
pub struct CleanupSweeper {
    store: Arc<dyn JobStore>,
    config: SweeperConfig,
}

impl CleanupSweeper {
    pub fn new(store: Arc<dyn JobStore>, config: SweeperConfig) -> Self {
        Self { store, config }
    }

    /// Runs the sweep loop until a shutdown signal arrives.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            grace_secs = self.config.completion_grace_period.as_secs(),
            retention_secs = self.config.retention_period.as_secs(),
            "Cleanup sweeper started"
        );
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.sweep_at(Utc::now()).await;
                    if report.total_deleted() > 0 || report.errors > 0 {
                        info!(
                            completed = report.completed_deleted,
                            expired = report.expired_deleted,
                            errors = report.errors,
                            "Cleanup sweep finished"
                        );
                    } else {
                        debug!("Cleanup sweep finished, nothing to delete");
                    }
                }
                _ = shutdown.recv() => {
                    info!("Cleanup sweeper stopped");
                    break;
                }
            }
        }
    }

    /// Sweeps once, evaluating retention against the given instant.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> CleanupReport {
        let mut report = CleanupReport::default();

        let grace = to_chrono(self.config.completion_grace_period);
        let retention = to_chrono(self.config.retention_period);

        let deleted = self
            .delete_past(JobStatus::Completed, grace, now, &mut report.errors)
            .await;
        report.completed_deleted = deleted;

        for status in [JobStatus::Failed, JobStatus::Cancelled] {
            report.expired_deleted += self
                .delete_past(status, retention, now, &mut report.errors)
                .await;
        }

        report
    }

    /// Deletes jobs in `status` whose terminal instant is at least `window`
    /// old. Jobs are processed independently; one failed delete never
    /// aborts the rest.
    async fn delete_past(
        &self,
        status: JobStatus,
        window: ChronoDuration,
        now: DateTime<Utc>,
        errors: &mut usize,
    ) -> usize {
        let jobs = match self.store.list_by_status(status, None).await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(status = %status, error = %e, "Cleanup sweep could not list jobs");
                *errors += 1;
                return 0;
            }
        };

        let mut deleted = 0;
        for job in jobs {
            if !is_past_window(&job, window, now) {
                continue;
            }
            match self.store.delete(job.id).await {
                Ok(()) => {
                    deleted += 1;
                    metrics::record_cleanup(status);
                    debug!(job_id = %job.id, status = %status, "Job deleted");
                }
                Err(StoreError::NotFound(_)) => {
                    // Raced another sweep; already gone.
                }
                Err(e) => {
                    *errors += 1;
                    error!(job_id = %job.id, error = %e, "Failed to delete job");
                }
            }
        }
        deleted
    }
}

fn is_past_window(job: &Job, window: ChronoDuration, now: DateTime<Utc>) -> bool {
    match job.completed_at {
        Some(completed_at) => now - completed_at >= window,
        // Terminal without a completion instant is a corrupt record; hold it
        // for diagnostics instead of deleting.
        None => false,
    }
}

fn to_chrono(duration: Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or(ChronoDuration::MAX)
}
