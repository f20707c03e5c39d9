//! Job dispatcher: idempotent submission, worker hand-off, retry policy.
//!
//! `submit` is the only entry point that creates jobs; the worker callback
//! surface (`claim`/`heartbeat`/`complete`/`fail`/`cancel`) delegates to
//! the store and layers the retry policy on top of `fail` so worker-reported
//! failures and monitor-detected stale failures share one retry path.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::job::{
    idempotency_key, Checkpoints, Job, JobStatus, JobType, Metadata, NewJob,
};
use crate::metrics;
use crate::store::{JobStore, StoreError};

use super::queue::{DispatchError, DispatchMessage};
use super::DispatchSink;

/// Ceiling for the exponential redelivery backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Errors surfaced by `submit`.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// Malformed submission, rejected before any job is created.
    #[error("Invalid submission: {0}")]
    Validation(String),

    /// Store failure during create-or-get.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Client-facing submission payload.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub job_type: JobType,
    pub entity_id: String,
    pub params: serde_json::Value,
    pub metadata: Metadata,
}

impl SubmitRequest {
    pub fn new(job_type: JobType, entity_id: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            job_type,
            entity_id: entity_id.into(),
            params,
            metadata: Metadata::new(),
        }
    }
}

/// What a submission caller gets back, immediately.
///
/// Submission never waits for processing; completion is observed by polling
/// the query API.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SubmitReceipt {
    pub job_id: Uuid,
    pub status: JobStatus,
    /// Whether this call created the job. Exactly one of a set of
    /// concurrent identical submissions observes `true`.
    pub created: bool,
}

/// Result of a failure report.
#[derive(Debug, Clone)]
pub struct FailOutcome {
    /// The failed job.
    pub job: Job,
    /// Retry successor, when the policy produced one.
    pub retry: Option<Job>,
}

/// Per-class automatic retry flags.
///
/// Whether a failed job respawns automatically or waits for manual
/// resubmission is a per-class choice; training runs, for example, are
/// expensive enough that operators may prefer to resubmit by hand.
#[derive(Debug, Clone, Copy)]
pub struct AutoRetry {
    pub analysis: bool,
    pub generation: bool,
    pub training: bool,
}

impl Default for AutoRetry {
    fn default() -> Self {
        Self {
            analysis: true,
            generation: true,
            training: false,
        }
    }
}

impl AutoRetry {
    pub fn enabled_for(&self, class: JobType) -> bool {
        match class {
            JobType::Analysis => self.analysis,
            JobType::Generation => self.generation,
            JobType::Training => self.training,
        }
    }
}

/// Dispatcher tuning knobs.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum automatic retries per logical request after worker failures.
    pub max_retries: u32,
    /// Maximum enqueue attempts before a job is marked `dispatch_failed`.
    pub max_dispatch_retries: u32,
    /// Base delay between enqueue attempts; doubles per attempt.
    pub dispatch_backoff: Duration,
    /// Per-class automatic retry flags.
    pub auto_retry: AutoRetry,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_dispatch_retries: 3,
            dispatch_backoff: Duration::from_secs(2),
            auto_retry: AutoRetry::default(),
        }
    }
}

/// The scheduler's write path: submission, hand-off, worker callbacks.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    sink: Arc<dyn DispatchSink>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        sink: Arc<dyn DispatchSink>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            sink,
            config,
        }
    }

    /// Submits a logical request.
    ///
    /// Computes the idempotency key and creates-or-finds the job; when an
    /// existing job is returned no new dispatch occurs, which is what
    /// enforces at-most-one concurrent job per key. The call suspends only
    /// for validation and the create-or-get; it never waits on processing.
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitReceipt, SubmitError> {
        validate(&request)?;

        let key = idempotency_key(request.job_type, &request.entity_id, &request.params);
        let new = NewJob::from_submission(
            request.job_type,
            request.entity_id,
            key,
            request.params,
            request.metadata,
        );

        let (job, created) = self.store.create_or_get(new).await?;
        if created {
            info!(job_id = %job.id, job_type = %job.job_type, entity_id = %job.entity_id, "Job created");
            self.dispatch(&job);
        }

        Ok(SubmitReceipt {
            job_id: job.id,
            status: job.status,
            created,
        })
    }

    /// Hands a freshly created job to its worker class.
    ///
    /// The first enqueue attempt and any redelivery run in a background
    /// task so callers return immediately; after exhausting
    /// `max_dispatch_retries` the job is marked `Failed("dispatch_failed")`.
    fn dispatch(&self, job: &Job) {
        let dispatcher = self.clone();
        let job = job.clone();
        tokio::spawn(async move {
            dispatcher.deliver_with_retries(job).await;
        });
    }

    async fn deliver_with_retries(&self, job: Job) {
        let max_attempts = self.config.max_dispatch_retries.max(1);

        for attempt in 1..=max_attempts {
            let message = DispatchMessage::for_job(&job, attempt);
            match self.sink.enqueue(&message).await {
                Ok(()) => {
                    metrics::record_dispatched(job.job_type);
                    info!(job_id = %job.id, attempt, "Job dispatched");
                    return;
                }
                Err(e) => {
                    warn!(job_id = %job.id, attempt, error = %e, "Dispatch attempt failed");
                    if attempt < max_attempts {
                        tokio::time::sleep(backoff_delay(self.config.dispatch_backoff, attempt))
                            .await;
                    }
                }
            }
        }

        metrics::record_dispatch_failed(job.job_type);
        match self.store.fail_dispatch(job.id, "dispatch_failed").await {
            Ok((_, applied)) if applied => {
                warn!(job_id = %job.id, attempts = max_attempts, "Job marked dispatch_failed");
            }
            Ok(_) => {
                // A worker claimed the job despite our delivery failures
                // (e.g. an earlier duplicate got through); nothing to do.
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Failed to record dispatch failure");
            }
        }
    }

    /// Worker callback: claim a pending job. First claim wins.
    pub async fn claim(&self, job_id: Uuid, worker_instance_id: &str) -> Result<Job, StoreError> {
        let job = self.store.claim(job_id, worker_instance_id).await?;
        info!(job_id = %job.id, worker = worker_instance_id, "Job claimed");
        Ok(job)
    }

    /// Worker callback: liveness and progress.
    pub async fn heartbeat(
        &self,
        job_id: Uuid,
        worker_instance_id: &str,
        current_step: Option<String>,
        checkpoints: Checkpoints,
    ) -> Result<Job, StoreError> {
        self.store
            .heartbeat(job_id, worker_instance_id, current_step, checkpoints)
            .await
    }

    /// Worker callback: successful completion.
    pub async fn complete(
        &self,
        job_id: Uuid,
        worker_instance_id: &str,
        result_metadata: Metadata,
    ) -> Result<Job, StoreError> {
        let (job, applied) = self
            .store
            .complete(job_id, worker_instance_id, result_metadata)
            .await?;
        if applied {
            info!(job_id = %job.id, worker = worker_instance_id, "Job completed");
        }
        Ok(job)
    }

    /// Failure report, from a worker or from the heartbeat monitor.
    ///
    /// When the report is retryable and the class allows automatic retries
    /// and the retry budget is not exhausted, a successor job is created
    /// (same logical request, incremented retry count) and dispatched. The
    /// successor creation is itself idempotent: a duplicate failure report
    /// finds the already-active successor and does not dispatch again.
    pub async fn fail(
        &self,
        job_id: Uuid,
        worker_instance_id: &str,
        error: &str,
        retryable: bool,
    ) -> Result<FailOutcome, StoreError> {
        let (job, applied) = self.store.fail(job_id, worker_instance_id, error).await?;

        let mut retry = None;
        if applied
            && retryable
            && self.config.auto_retry.enabled_for(job.job_type)
            && job.retry_count < self.config.max_retries
        {
            let (successor, created) = self.store.create_or_get(NewJob::retry_of(&job)).await?;
            if created {
                info!(
                    job_id = %job.id,
                    successor_id = %successor.id,
                    retry_count = successor.retry_count,
                    "Retry job created"
                );
                metrics::record_retry(job.job_type);
                self.dispatch(&successor);
                retry = Some(successor);
            }
        }

        Ok(FailOutcome { job, retry })
    }

    /// Best-effort cancellation: flips state immediately and rejects
    /// subsequent owner callbacks; the worker process itself discovers the
    /// cancellation on its next (rejected) callback.
    pub async fn cancel(&self, job_id: Uuid) -> Result<Job, StoreError> {
        let job = self.store.cancel(job_id).await?;
        info!(job_id = %job.id, "Job cancelled");
        Ok(job)
    }

    /// The store this dispatcher writes through.
    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }
}

fn validate(request: &SubmitRequest) -> Result<(), SubmitError> {
    if request.entity_id.trim().is_empty() {
        return Err(SubmitError::Validation("entity_id must not be empty".into()));
    }
    if !(request.params.is_object() || request.params.is_null()) {
        return Err(SubmitError::Validation(
            "params must be a JSON object or null".into(),
        ));
    }
    Ok(())
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(5);
    (base * factor).min(MAX_BACKOFF)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validation_rejects_empty_entity() {
        let request = SubmitRequest::new(JobType::Analysis, "  ", json!({}));
        assert!(matches!(
            validate(&request),
            Err(SubmitError::Validation(_))
        ));
    }

    #[test]
    fn test_validation_rejects_non_object_params() {
        let request = SubmitRequest::new(JobType::Analysis, "file-a", json!([1, 2]));
        assert!(matches!(
            validate(&request),
            Err(SubmitError::Validation(_))
        ));

        let request = SubmitRequest::new(JobType::Analysis, "file-a", json!(null));
        assert!(validate(&request).is_ok());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = Duration::from_secs(2);
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(4));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(8));
        assert_eq!(backoff_delay(base, 20), MAX_BACKOFF);
    }

    #[test]
    fn test_auto_retry_defaults() {
        let retry = AutoRetry::default();
        assert!(retry.enabled_for(JobType::Analysis));
        assert!(retry.enabled_for(JobType::Generation));
        assert!(!retry.enabled_for(JobType::Training));
    }
}
