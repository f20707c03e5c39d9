//! Job store: the single source of truth for job state.
//!
//! All coordination between the dispatcher, the workers, the heartbeat
//! monitor, the cleanup sweeper, and the autoscaler is mediated through the
//! atomic operations on this store. Two implementations are provided:
//!
//! - `PostgresJobStore`: production store backed by PostgreSQL, using
//!   row-level locking for single-writer-per-record mutations and a partial
//!   unique index for idempotency enforcement
//! - `InMemoryJobStore`: mutex-guarded map with the same semantics, used by
//!   tests and local development
//!
//! The state machine itself lives in [`transition`], shared by both
//! implementations so the transition rules cannot drift apart.

pub mod memory;
pub mod migrations;
pub mod postgres;
pub mod schema;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::job::{Checkpoints, Job, JobStatus, JobType, Metadata, NewJob};

pub use memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;

/// Errors that can occur during job store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No job with the given id exists.
    #[error("Job {0} not found")]
    NotFound(Uuid),

    /// A callback arrived from a worker that does not own the job.
    #[error("Worker '{worker}' does not own job {job_id}")]
    Ownership { job_id: Uuid, worker: String },

    /// The operation is not valid in the job's current state.
    #[error("Job {job_id} is {status}, cannot {operation}")]
    InvalidState {
        job_id: Uuid,
        status: JobStatus,
        operation: &'static str,
    },

    /// Lost a race against a concurrent mutation of the same record.
    #[error("Concurrent modification of job {0}")]
    Conflict(Uuid),

    /// Underlying database failure.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored value could not be decoded.
    #[error("Corrupt job record: {0}")]
    Decode(String),

    /// JSON serialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Filter for the paged listing query.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub job_type: Option<JobType>,
    pub skip: u64,
    pub take: u64,
}

impl JobFilter {
    /// Effective page size; a zero `take` falls back to a sane default.
    pub fn limit(&self) -> u64 {
        if self.take == 0 {
            50
        } else {
            self.take.min(500)
        }
    }
}

/// Pending/running totals for one worker class, read by the autoscaler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActiveCounts {
    pub pending: u64,
    pub running: u64,
}

impl ActiveCounts {
    /// Offered load: everything queued plus everything in flight.
    pub fn load(&self) -> u64 {
        self.pending + self.running
    }
}

/// Aggregate statistics over the whole job table.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct JobStats {
    /// Counts keyed by worker class, then status.
    pub counts: BTreeMap<JobType, BTreeMap<JobStatus, u64>>,
    /// Mean wall-clock seconds from claim to completion, over completed jobs.
    pub avg_completion_seconds: Option<f64>,
}

impl JobStats {
    /// Total jobs across all classes and states.
    pub fn total(&self) -> u64 {
        self.counts
            .values()
            .flat_map(|by_status| by_status.values())
            .sum()
    }
}

/// Persistent repository of job records.
///
/// Every mutation is atomic with respect to concurrent callers; callers
/// never observe a half-applied transition.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Atomically creates a job for the given idempotency key, or returns
    /// the existing active job for that key. Under concurrent identical
    /// submissions exactly one row is created; every caller observes the
    /// same id, and exactly one observes `created = true`.
    async fn create_or_get(&self, new: NewJob) -> Result<(Job, bool), StoreError>;

    /// Fetches a job by id.
    async fn get(&self, id: Uuid) -> Result<Job, StoreError>;

    /// All jobs recorded against a resource, newest first.
    async fn list_by_entity(&self, entity_id: &str) -> Result<Vec<Job>, StoreError>;

    /// All jobs in one state, optionally restricted to one worker class.
    async fn list_by_status(
        &self,
        status: JobStatus,
        job_type: Option<JobType>,
    ) -> Result<Vec<Job>, StoreError>;

    /// Paged listing, newest first.
    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError>;

    /// Attaches a worker to a pending job: `Pending → Running`. First
    /// claim wins; a second claim for the same job is a `Conflict`. This is
    /// the idempotent-handling half of at-least-once dispatch.
    async fn claim(&self, id: Uuid, worker_instance_id: &str) -> Result<Job, StoreError>;

    /// Liveness/progress update from the owning worker. Rejected unless the
    /// job is `Running` and `worker_instance_id` matches the recorded owner.
    /// Checkpoints merge into the existing map.
    async fn heartbeat(
        &self,
        id: Uuid,
        worker_instance_id: &str,
        current_step: Option<String>,
        checkpoints: Checkpoints,
    ) -> Result<Job, StoreError>;

    /// `Running → Completed`, owner-gated. Repeating the call on an
    /// already-completed job is a no-op returning the current state with
    /// `applied = false`.
    async fn complete(
        &self,
        id: Uuid,
        worker_instance_id: &str,
        result_metadata: Metadata,
    ) -> Result<(Job, bool), StoreError>;

    /// `Running → Failed`, owner-gated. Repeating the call on an
    /// already-failed job is a no-op returning the current state with
    /// `applied = false`. Retry successors are the dispatcher's concern.
    async fn fail(
        &self,
        id: Uuid,
        worker_instance_id: &str,
        error: &str,
    ) -> Result<(Job, bool), StoreError>;

    /// Marks a job that could never be handed to a worker as failed:
    /// `Pending → Failed`. A no-op if a worker claimed the job in the
    /// meantime. Used only by the dispatcher after exhausting redelivery.
    async fn fail_dispatch(&self, id: Uuid, error: &str) -> Result<(Job, bool), StoreError>;

    /// `Pending/Running → Cancelled`. Subsequent owner callbacks for the
    /// job are rejected. Cancelling a cancelled job is a no-op.
    async fn cancel(&self, id: Uuid) -> Result<Job, StoreError>;

    /// Removes a record. Used only by the cleanup sweeper.
    async fn delete(&self, id: Uuid) -> Result<(), StoreError>;

    /// Pending/running totals for one worker class.
    async fn count_active(&self, job_type: JobType) -> Result<ActiveCounts, StoreError>;

    /// Aggregate statistics over the whole table.
    async fn stats(&self) -> Result<JobStats, StoreError>;
}

/// Pure state machine transitions, shared by every store implementation.
///
/// Each function validates the transition against the current record,
/// mutates the record in place on success, and reports whether anything
/// changed. Store implementations are responsible only for atomicity
/// (row lock or mutex) around read-apply-write.
pub mod transition {
    use super::*;

    /// Whether a transition mutated the record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Outcome {
        Applied,
        /// Idempotent repeat of an already-applied terminal transition.
        Unchanged,
    }

    fn check_owner(job: &Job, worker: &str) -> Result<(), StoreError> {
        match job.worker_instance_id.as_deref() {
            Some(owner) if owner == worker => Ok(()),
            _ => Err(StoreError::Ownership {
                job_id: job.id,
                worker: worker.to_string(),
            }),
        }
    }

    /// `Pending → Running`, attaching the worker and starting the
    /// liveness clock.
    pub fn claim(job: &mut Job, worker: &str, now: DateTime<Utc>) -> Result<Outcome, StoreError> {
        match job.status {
            JobStatus::Pending => {
                job.status = JobStatus::Running;
                job.worker_instance_id = Some(worker.to_string());
                job.started_at = Some(now);
                job.last_heartbeat = Some(now);
                Ok(Outcome::Applied)
            }
            _ => Err(StoreError::Conflict(job.id)),
        }
    }

    /// Owner-gated liveness/progress update while `Running`.
    pub fn heartbeat(
        job: &mut Job,
        worker: &str,
        current_step: Option<String>,
        checkpoints: Checkpoints,
        now: DateTime<Utc>,
    ) -> Result<Outcome, StoreError> {
        if job.status != JobStatus::Running {
            return Err(StoreError::InvalidState {
                job_id: job.id,
                status: job.status,
                operation: "heartbeat",
            });
        }
        check_owner(job, worker)?;

        job.last_heartbeat = Some(now);
        if current_step.is_some() {
            job.current_step = current_step;
        }
        job.merge_checkpoints(checkpoints);
        Ok(Outcome::Applied)
    }

    /// Owner-gated `Running → Completed`; repeat completes are no-ops.
    pub fn complete(
        job: &mut Job,
        worker: &str,
        result_metadata: Metadata,
        now: DateTime<Utc>,
    ) -> Result<Outcome, StoreError> {
        match job.status {
            JobStatus::Running => {
                check_owner(job, worker)?;
                job.status = JobStatus::Completed;
                job.completed_at = Some(now);
                job.worker_instance_id = None;
                for (key, value) in result_metadata {
                    job.metadata.insert(key, value);
                }
                Ok(Outcome::Applied)
            }
            JobStatus::Completed => Ok(Outcome::Unchanged),
            status => Err(StoreError::InvalidState {
                job_id: job.id,
                status,
                operation: "complete",
            }),
        }
    }

    /// Owner-gated `Running → Failed`; repeat fails are no-ops.
    pub fn fail(
        job: &mut Job,
        worker: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Outcome, StoreError> {
        match job.status {
            JobStatus::Running => {
                check_owner(job, worker)?;
                job.status = JobStatus::Failed;
                job.completed_at = Some(now);
                job.error_message = Some(error.to_string());
                job.worker_instance_id = None;
                Ok(Outcome::Applied)
            }
            JobStatus::Failed => Ok(Outcome::Unchanged),
            status => Err(StoreError::InvalidState {
                job_id: job.id,
                status,
                operation: "fail",
            }),
        }
    }

    /// `Pending → Failed` for jobs that never reached a worker. A no-op in
    /// any other state: if a worker claimed the job between the last
    /// redelivery attempt and this marking, the claim stands.
    pub fn fail_dispatch(
        job: &mut Job,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Outcome, StoreError> {
        match job.status {
            JobStatus::Pending => {
                job.status = JobStatus::Failed;
                job.completed_at = Some(now);
                job.error_message = Some(error.to_string());
                Ok(Outcome::Applied)
            }
            _ => Ok(Outcome::Unchanged),
        }
    }

    /// `Pending/Running → Cancelled`; cancelling twice is a no-op.
    pub fn cancel(job: &mut Job, now: DateTime<Utc>) -> Result<Outcome, StoreError> {
        match job.status {
            JobStatus::Pending | JobStatus::Running => {
                job.status = JobStatus::Cancelled;
                job.completed_at = Some(now);
                job.worker_instance_id = None;
                Ok(Outcome::Applied)
            }
            JobStatus::Cancelled => Ok(Outcome::Unchanged),
            status => Err(StoreError::InvalidState {
                job_id: job.id,
                status,
                operation: "cancel",
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::transition::{self, Outcome};
    use super::*;
    use serde_json::json;

    fn running_job(worker: &str) -> Job {
        let mut job = Job::from_new(
            NewJob::from_submission(
                JobType::Analysis,
                "file-a",
                "key-a",
                json!({}),
                Metadata::new(),
            ),
            Utc::now(),
        );
        transition::claim(&mut job, worker, Utc::now()).expect("claim");
        job
    }

    #[test]
    fn test_claim_attaches_worker_and_liveness_clock() {
        let job = running_job("worker-1");
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.worker_instance_id.as_deref(), Some("worker-1"));
        assert!(job.started_at.is_some());
        assert!(job.last_heartbeat.is_some());
    }

    #[test]
    fn test_second_claim_is_a_conflict() {
        let mut job = running_job("worker-1");
        let err = transition::claim(&mut job, "worker-2", Utc::now()).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(job.worker_instance_id.as_deref(), Some("worker-1"));
    }

    #[test]
    fn test_heartbeat_rejects_non_owner() {
        let mut job = running_job("worker-1");
        let err = transition::heartbeat(
            &mut job,
            "worker-2",
            None,
            Checkpoints::new(),
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::Ownership { .. }));
    }

    #[test]
    fn test_heartbeat_rejects_pending_job() {
        let mut job = Job::from_new(
            NewJob::from_submission(
                JobType::Analysis,
                "file-a",
                "key-a",
                json!({}),
                Metadata::new(),
            ),
            Utc::now(),
        );
        let err = transition::heartbeat(
            &mut job,
            "worker-1",
            None,
            Checkpoints::new(),
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::InvalidState { .. }));
    }

    #[test]
    fn test_heartbeat_merges_checkpoints_and_keeps_step_when_absent() {
        let mut job = running_job("worker-1");
        let mut first = Checkpoints::new();
        first.insert("downloaded".to_string(), json!(true));
        transition::heartbeat(
            &mut job,
            "worker-1",
            Some("separating".to_string()),
            first,
            Utc::now(),
        )
        .expect("heartbeat");

        let mut second = Checkpoints::new();
        second.insert("stems_done".to_string(), json!(3));
        transition::heartbeat(&mut job, "worker-1", None, second, Utc::now()).expect("heartbeat");

        assert_eq!(job.current_step.as_deref(), Some("separating"));
        assert_eq!(job.checkpoints["downloaded"], json!(true));
        assert_eq!(job.checkpoints["stems_done"], json!(3));
    }

    #[test]
    fn test_complete_is_idempotent_and_clears_owner() {
        let mut job = running_job("worker-1");
        let mut result = Metadata::new();
        result.insert("bpm".to_string(), json!(120.5));

        let outcome =
            transition::complete(&mut job, "worker-1", result, Utc::now()).expect("complete");
        assert_eq!(outcome, Outcome::Applied);
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.worker_instance_id.is_none());
        assert_eq!(job.metadata["bpm"], json!(120.5));

        // Zombie worker repeats the call: state unchanged, no error.
        let outcome = transition::complete(&mut job, "worker-1", Metadata::new(), Utc::now())
            .expect("repeat complete");
        assert_eq!(outcome, Outcome::Unchanged);
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[test]
    fn test_fail_records_error_and_is_idempotent() {
        let mut job = running_job("worker-1");
        let outcome =
            transition::fail(&mut job, "worker-1", "model crashed", Utc::now()).expect("fail");
        assert_eq!(outcome, Outcome::Applied);
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some("model crashed"));

        let outcome = transition::fail(&mut job, "worker-1", "again", Utc::now())
            .expect("repeat fail");
        assert_eq!(outcome, Outcome::Unchanged);
        assert_eq!(job.error_message.as_deref(), Some("model crashed"));
    }

    #[test]
    fn test_terminal_states_reject_cross_transitions() {
        let mut job = running_job("worker-1");
        transition::cancel(&mut job, Utc::now()).expect("cancel");
        assert_eq!(job.status, JobStatus::Cancelled);

        // Callbacks after cancellation are rejected, not absorbed.
        assert!(matches!(
            transition::complete(&mut job, "worker-1", Metadata::new(), Utc::now()),
            Err(StoreError::InvalidState { .. })
        ));
        assert!(matches!(
            transition::fail(&mut job, "worker-1", "late", Utc::now()),
            Err(StoreError::InvalidState { .. })
        ));
        assert!(matches!(
            transition::heartbeat(&mut job, "worker-1", None, Checkpoints::new(), Utc::now()),
            Err(StoreError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_fail_dispatch_only_touches_pending() {
        let mut pending = Job::from_new(
            NewJob::from_submission(
                JobType::Generation,
                "file-b",
                "key-b",
                json!({}),
                Metadata::new(),
            ),
            Utc::now(),
        );
        let outcome =
            transition::fail_dispatch(&mut pending, "dispatch_failed", Utc::now()).expect("fail");
        assert_eq!(outcome, Outcome::Applied);
        assert_eq!(pending.status, JobStatus::Failed);

        let mut running = running_job("worker-1");
        let outcome = transition::fail_dispatch(&mut running, "dispatch_failed", Utc::now())
            .expect("no-op");
        assert_eq!(outcome, Outcome::Unchanged);
        assert_eq!(running.status, JobStatus::Running);
    }

    #[test]
    fn test_filter_limit_bounds() {
        assert_eq!(JobFilter::default().limit(), 50);
        let filter = JobFilter {
            take: 10_000,
            ..Default::default()
        };
        assert_eq!(filter.limit(), 500);
    }
}
