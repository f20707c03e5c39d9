//! Job records and the job state machine vocabulary.
//!
//! A `Job` is the single source of truth for one logical processing request.
//! It is created by the dispatcher, mutated by the owning worker through
//! heartbeat/terminal callbacks, swept by the heartbeat monitor and the
//! cleanup sweeper, and never mutated by anything else.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque progress map attached to a running job.
///
/// Updates are merged key-by-key, never replaced wholesale, so a partial
/// progress report cannot erase earlier checkpoint data.
pub type Checkpoints = BTreeMap<String, serde_json::Value>;

/// Opaque descriptive map set at creation and extended at completion.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Worker class that owns a job.
///
/// Each class is backed by its own pool of worker processes and its own
/// dispatch queue, and is scaled independently of the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Source separation and music-information-retrieval analysis.
    Analysis,
    /// Generative audio inference.
    Generation,
    /// Model fine-tuning runs.
    Training,
}

impl JobType {
    /// All worker classes, in a stable order.
    pub const ALL: [JobType; 3] = [JobType::Analysis, JobType::Generation, JobType::Training];

    /// Canonical lowercase name, matching the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Analysis => "analysis",
            JobType::Generation => "generation",
            JobType::Training => "training",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "analysis" => Ok(JobType::Analysis),
            "generation" => Ok(JobType::Generation),
            "training" => Ok(JobType::Training),
            other => Err(format!("unknown job type '{other}'")),
        }
    }
}

/// Job state machine states.
///
/// Transitions are monotonic: `Pending → Running → {Completed, Failed,
/// Cancelled}`. A job never leaves a terminal state; retries are modeled as
/// fresh successor jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, not yet picked up by a worker.
    Pending,
    /// Owned by a worker and actively heartbeating.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully (worker-reported, stale, or dispatch failure).
    Failed,
    /// Cancelled before completion.
    Cancelled,
}

impl JobStatus {
    /// Whether this state ends the job's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether this state releases the job's idempotency key for
    /// reactivation. Failed and cancelled jobs no longer represent the
    /// request; a completed job holds its key until the sweeper removes it,
    /// so a duplicate submission observes the result instead of re-running.
    pub fn releases_key(&self) -> bool {
        matches!(self, JobStatus::Failed | JobStatus::Cancelled)
    }

    /// Canonical lowercase name, matching the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status '{other}'")),
        }
    }
}

/// A single asynchronous processing request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier, generated at creation.
    pub id: Uuid,
    /// Worker class that owns this job.
    pub job_type: JobType,
    /// Identifier of the resource being processed (e.g. a source file id).
    /// Not unique; a resource accumulates a job history.
    pub entity_id: String,
    /// Deterministic fingerprint of (type, entity, normalized params).
    /// Unique among jobs whose status does not release the key.
    pub idempotency_key: String,
    /// Request parameters, carried so retry successors reuse the same
    /// logical request and dispatch messages can be rebuilt.
    pub params: serde_json::Value,
    /// Current state machine state.
    pub status: JobStatus,
    /// Identity of the owning worker while `Running`; `None` otherwise.
    pub worker_instance_id: Option<String>,
    /// Free-form progress marker (e.g. "downloading", "separating").
    pub current_step: Option<String>,
    /// Merged progress map reported by the owning worker.
    pub checkpoints: Checkpoints,
    /// Descriptive map set at creation and extended with the result summary.
    pub metadata: Metadata,
    /// Error recorded on failure.
    pub error_message: Option<String>,
    /// How many predecessor jobs this logical request has burned.
    pub retry_count: u32,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When a worker claimed the job.
    pub started_at: Option<DateTime<Utc>>,
    /// Last liveness signal from the owning worker.
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// When the job reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Materializes a new pending job from a creation payload.
    pub fn from_new(new: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_type: new.job_type,
            entity_id: new.entity_id,
            idempotency_key: new.idempotency_key,
            params: new.params,
            status: JobStatus::Pending,
            worker_instance_id: None,
            current_step: None,
            checkpoints: Checkpoints::new(),
            metadata: new.metadata,
            error_message: None,
            retry_count: new.retry_count,
            created_at: now,
            started_at: None,
            last_heartbeat: None,
            completed_at: None,
        }
    }

    /// Merges a checkpoint update into the job, key by key.
    pub fn merge_checkpoints(&mut self, updates: Checkpoints) {
        for (key, value) in updates {
            self.checkpoints.insert(key, value);
        }
    }

    /// The instant the staleness clock measures from: the last heartbeat,
    /// falling back to the claim time for a worker that died before its
    /// first heartbeat.
    pub fn liveness_instant(&self) -> Option<DateTime<Utc>> {
        self.last_heartbeat.or(self.started_at)
    }
}

/// Creation payload handed to the job store.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: JobType,
    pub entity_id: String,
    pub idempotency_key: String,
    pub params: serde_json::Value,
    pub metadata: Metadata,
    pub retry_count: u32,
}

impl NewJob {
    /// Payload for a first submission of a logical request.
    pub fn from_submission(
        job_type: JobType,
        entity_id: impl Into<String>,
        idempotency_key: impl Into<String>,
        params: serde_json::Value,
        metadata: Metadata,
    ) -> Self {
        Self {
            job_type,
            entity_id: entity_id.into(),
            idempotency_key: idempotency_key.into(),
            params,
            metadata,
            retry_count: 0,
        }
    }

    /// Payload for a retry successor of a failed job: same logical request,
    /// same key (the predecessor's terminal state released it), incremented
    /// retry count.
    pub fn retry_of(failed: &Job) -> Self {
        Self {
            job_type: failed.job_type,
            entity_id: failed.entity_id.clone(),
            idempotency_key: failed.idempotency_key.clone(),
            params: failed.params.clone(),
            metadata: failed.metadata.clone(),
            retry_count: failed.retry_count + 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_job() -> Job {
        Job::from_new(
            NewJob::from_submission(
                JobType::Analysis,
                "file-a",
                "key-a",
                json!({"depth": "full"}),
                Metadata::new(),
            ),
            Utc::now(),
        )
    }

    #[test]
    fn test_status_terminality() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_key_release_states() {
        assert!(JobStatus::Failed.releases_key());
        assert!(JobStatus::Cancelled.releases_key());
        assert!(!JobStatus::Completed.releases_key());
        assert!(!JobStatus::Pending.releases_key());
        assert!(!JobStatus::Running.releases_key());
    }

    #[test]
    fn test_display_matches_serde() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            let serialized = serde_json::to_string(&status).expect("serialize");
            assert_eq!(serialized, format!("\"{status}\""));
            assert_eq!(status.as_str().parse::<JobStatus>(), Ok(status));
        }
        for job_type in JobType::ALL {
            let serialized = serde_json::to_string(&job_type).expect("serialize");
            assert_eq!(serialized, format!("\"{job_type}\""));
            assert_eq!(job_type.as_str().parse::<JobType>(), Ok(job_type));
        }
    }

    #[test]
    fn test_merge_checkpoints_preserves_existing_keys() {
        let mut job = test_job();
        job.checkpoints
            .insert("downloaded_bytes".to_string(), json!(1024));
        job.checkpoints.insert("stage".to_string(), json!("download"));

        let mut update = Checkpoints::new();
        update.insert("stage".to_string(), json!("separate"));
        update.insert("stems_done".to_string(), json!(2));
        job.merge_checkpoints(update);

        assert_eq!(job.checkpoints["downloaded_bytes"], json!(1024));
        assert_eq!(job.checkpoints["stage"], json!("separate"));
        assert_eq!(job.checkpoints["stems_done"], json!(2));
    }

    #[test]
    fn test_retry_payload_carries_logical_request() {
        let mut failed = test_job();
        failed.status = JobStatus::Failed;
        failed.retry_count = 1;

        let retry = NewJob::retry_of(&failed);
        assert_eq!(retry.job_type, failed.job_type);
        assert_eq!(retry.entity_id, failed.entity_id);
        assert_eq!(retry.idempotency_key, failed.idempotency_key);
        assert_eq!(retry.params, failed.params);
        assert_eq!(retry.retry_count, 2);
    }

    #[test]
    fn test_liveness_instant_falls_back_to_start() {
        let mut job = test_job();
        assert!(job.liveness_instant().is_none());

        let started = Utc::now();
        job.started_at = Some(started);
        assert_eq!(job.liveness_instant(), Some(started));

        let beat = started + chrono::Duration::seconds(10);
        job.last_heartbeat = Some(beat);
        assert_eq!(job.liveness_instant(), Some(beat));
    }

    #[test]
    fn test_job_serialization_roundtrip() {
        let job = test_job();
        let json = serde_json::to_string(&job).expect("serialize");
        let parsed: Job = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed.id, job.id);
        assert_eq!(parsed.status, job.status);
        assert_eq!(parsed.params, job.params);
    }
}
