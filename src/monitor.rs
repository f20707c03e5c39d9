//! Heartbeat monitor: staleness detection for running jobs.
//!
//! A worker that crashes or partitions away stops heartbeating but leaves
//! its job `Running`, holding the idempotency key and stalling user-visible
//! progress forever. The monitor sweeps on a fixed interval and fails any
//! running job whose owner has been silent longer than the stale timeout,
//! through the dispatcher's fail path so the normal retry policy applies.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::dispatch::Dispatcher;
use crate::job::Job;
use crate::metrics;
use crate::store::StoreError;

/// Error recorded on jobs failed by the monitor.
pub const STALE_ERROR: &str = "stale: no heartbeat";

/// Monitor tuning knobs.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Sweep interval.
    pub interval: Duration,
    /// Silence longer than this marks a running job stale.
    pub stale_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            stale_timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// Outcome of one staleness sweep.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaleSweepReport {
    /// Running jobs examined.
    pub examined: usize,
    /// Jobs marked failed as stale.
    pub failed: usize,
    /// Jobs whose update errored (logged, sweep continued).
    pub errors: usize,
}

/// Periodic staleness sweep over running jobs.
pub struct HeartbeatMonitor {
    dispatcher: Dispatcher,
    config: MonitorConfig,
}

impl HeartbeatMonitor {
    pub fn new(dispatcher: Dispatcher, config: MonitorConfig) -> Self {
        Self { dispatcher, config }
    }

    /// Runs the sweep loop until a shutdown signal arrives.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            stale_timeout_secs = self.config.stale_timeout.as_secs(),
            "Heartbeat monitor started"
        );
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.sweep_at(Utc::now()).await;
                    if report.failed > 0 || report.errors > 0 {
                        info!(
                            examined = report.examined,
                            failed = report.failed,
                            errors = report.errors,
                            "Staleness sweep finished"
                        );
                    } else {
                        debug!(examined = report.examined, "Staleness sweep finished");
                    }
                }
                _ = shutdown.recv() => {
                    info!("Heartbeat monitor stopped");
                    break;
                }
            }
        }
    }

    /// Sweeps once, evaluating staleness against the given instant.
    ///
    /// Jobs are processed independently: one job's failure to update never
    /// aborts the sweep of the rest.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> StaleSweepReport {
        let mut report = StaleSweepReport::default();

        let running = match self
            .dispatcher
            .store()
            .list_by_status(crate::job::JobStatus::Running, None)
            .await
        {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(error = %e, "Staleness sweep could not list running jobs");
                report.errors += 1;
                return report;
            }
        };

        report.examined = running.len();

        for job in running {
            if !self.is_stale(&job, now) {
                continue;
            }

            let Some(owner) = job.worker_instance_id.clone() else {
                // Running without an owner should be unreachable; leave the
                // record for inspection rather than guessing an owner id.
                warn!(job_id = %job.id, "Running job has no recorded owner, skipping");
                report.errors += 1;
                continue;
            };

            match self.dispatcher.fail(job.id, &owner, STALE_ERROR, true).await {
                Ok(outcome) => {
                    report.failed += 1;
                    metrics::record_stale(job.job_type);
                    warn!(
                        job_id = %job.id,
                        worker = %owner,
                        retry = outcome.retry.is_some(),
                        "Stale job failed"
                    );
                }
                Err(StoreError::NotFound(_)) => {
                    // Deleted between listing and update; nothing to do.
                }
                Err(e) => {
                    report.errors += 1;
                    error!(job_id = %job.id, error = %e, "Failed to mark stale job");
                }
            }
        }

        report
    }

    fn is_stale(&self, job: &Job, now: DateTime<Utc>) -> bool {
        let threshold = ChronoDuration::from_std(self.config.stale_timeout)
            .unwrap_or_else(|_| ChronoDuration::MAX);
        match job.liveness_instant() {
            Some(last) => now - last > threshold,
            // No claim time at all: malformed record, not our call to make.
            None => false,
        }
    }
}
