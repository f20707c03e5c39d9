//! In-memory job store.
//!
//! Mutex-guarded map with the same atomicity guarantees as the PostgreSQL
//! store: every operation holds the lock for its whole read-apply-write
//! cycle, so callers never observe a half-applied transition. Used by the
//! test suite and by local development without a database.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::job::{Checkpoints, Job, JobStatus, JobType, Metadata, NewJob};

use super::transition;
use super::{ActiveCounts, JobFilter, JobStats, JobStore, StoreError};

/// Mutex-guarded in-memory job repository.
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<Uuid, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently held.
    pub fn len(&self) -> usize {
        self.jobs.lock().expect("store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with_job<T>(
        &self,
        id: Uuid,
        apply: impl FnOnce(&mut Job) -> Result<T, StoreError>,
    ) -> Result<(Job, T), StoreError> {
        let mut jobs = self.jobs.lock().expect("store lock poisoned");
        let job = jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        let outcome = apply(job)?;
        Ok((job.clone(), outcome))
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_or_get(&self, new: NewJob) -> Result<(Job, bool), StoreError> {
        let mut jobs = self.jobs.lock().expect("store lock poisoned");

        // One active job per idempotency key: released (failed/cancelled)
        // rows do not block reactivation.
        if let Some(existing) = jobs
            .values()
            .find(|job| job.idempotency_key == new.idempotency_key && !job.status.releases_key())
        {
            return Ok((existing.clone(), false));
        }

        let job = Job::from_new(new, Utc::now());
        jobs.insert(job.id, job.clone());
        Ok((job, true))
    }

    async fn get(&self, id: Uuid) -> Result<Job, StoreError> {
        let jobs = self.jobs.lock().expect("store lock poisoned");
        jobs.get(&id).cloned().ok_or(StoreError::NotFound(id))
    }

    async fn list_by_entity(&self, entity_id: &str) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.lock().expect("store lock poisoned");
        let mut matching: Vec<Job> = jobs
            .values()
            .filter(|job| job.entity_id == entity_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matching)
    }

    async fn list_by_status(
        &self,
        status: JobStatus,
        job_type: Option<JobType>,
    ) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.lock().expect("store lock poisoned");
        let mut matching: Vec<Job> = jobs
            .values()
            .filter(|job| job.status == status)
            .filter(|job| job_type.is_none_or(|t| job.job_type == t))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matching)
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.lock().expect("store lock poisoned");
        let mut matching: Vec<Job> = jobs
            .values()
            .filter(|job| filter.status.is_none_or(|s| job.status == s))
            .filter(|job| filter.job_type.is_none_or(|t| job.job_type == t))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matching
            .into_iter()
            .skip(filter.skip as usize)
            .take(filter.limit() as usize)
            .collect())
    }

    async fn claim(&self, id: Uuid, worker_instance_id: &str) -> Result<Job, StoreError> {
        let (job, _) = self.with_job(id, |job| {
            transition::claim(job, worker_instance_id, Utc::now())
        })?;
        Ok(job)
    }

    async fn heartbeat(
        &self,
        id: Uuid,
        worker_instance_id: &str,
        current_step: Option<String>,
        checkpoints: Checkpoints,
    ) -> Result<Job, StoreError> {
        let (job, _) = self.with_job(id, |job| {
            transition::heartbeat(job, worker_instance_id, current_step, checkpoints, Utc::now())
        })?;
        Ok(job)
    }

    async fn complete(
        &self,
        id: Uuid,
        worker_instance_id: &str,
        result_metadata: Metadata,
    ) -> Result<(Job, bool), StoreError> {
        let (job, outcome) = self.with_job(id, |job| {
            transition::complete(job, worker_instance_id, result_metadata, Utc::now())
        })?;
        Ok((job, outcome == transition::Outcome::Applied))
    }

    async fn fail(
        &self,
        id: Uuid,
        worker_instance_id: &str,
        error: &str,
    ) -> Result<(Job, bool), StoreError> {
        let (job, outcome) = self.with_job(id, |job| {
            transition::fail(job, worker_instance_id, error, Utc::now())
        })?;
        Ok((job, outcome == transition::Outcome::Applied))
    }

    async fn fail_dispatch(&self, id: Uuid, error: &str) -> Result<(Job, bool), StoreError> {
        let (job, outcome) =
            self.with_job(id, |job| transition::fail_dispatch(job, error, Utc::now()))?;
        Ok((job, outcome == transition::Outcome::Applied))
    }

    async fn cancel(&self, id: Uuid) -> Result<Job, StoreError> {
        let (job, _) = self.with_job(id, |job| transition::cancel(job, Utc::now()))?;
        Ok(job)
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().expect("store lock poisoned");
        jobs.remove(&id).ok_or(StoreError::NotFound(id))?;
        Ok(())
    }

    async fn count_active(&self, job_type: JobType) -> Result<ActiveCounts, StoreError> {
        let jobs = self.jobs.lock().expect("store lock poisoned");
        let mut counts = ActiveCounts::default();
        for job in jobs.values().filter(|job| job.job_type == job_type) {
            match job.status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Running => counts.running += 1,
                _ => {}
            }
        }
        Ok(counts)
    }

    async fn stats(&self) -> Result<JobStats, StoreError> {
        let jobs = self.jobs.lock().expect("store lock poisoned");
        let mut stats = JobStats::default();

        let mut completion_total = 0.0_f64;
        let mut completion_samples = 0_u64;

        for job in jobs.values() {
            *stats
                .counts
                .entry(job.job_type)
                .or_default()
                .entry(job.status)
                .or_default() += 1;

            if job.status == JobStatus::Completed {
                if let (Some(started), Some(completed)) = (job.started_at, job.completed_at) {
                    completion_total += (completed - started).num_milliseconds() as f64 / 1000.0;
                    completion_samples += 1;
                }
            }
        }

        if completion_samples > 0 {
            stats.avg_completion_seconds = Some(completion_total / completion_samples as f64);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_job(entity: &str, key: &str) -> NewJob {
        NewJob::from_submission(JobType::Analysis, entity, key, json!({}), Metadata::new())
    }

    #[tokio::test]
    async fn test_create_or_get_collapses_duplicates() {
        let store = InMemoryJobStore::new();
        let (first, created) = store.create_or_get(new_job("file-a", "key-a")).await.unwrap();
        assert!(created);

        let (second, created) = store.create_or_get(new_job("file-a", "key-a")).await.unwrap();
        assert!(!created);
        assert_eq!(second.id, first.id);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_job_releases_key_for_reactivation() {
        let store = InMemoryJobStore::new();
        let (job, _) = store.create_or_get(new_job("file-a", "key-a")).await.unwrap();
        store.claim(job.id, "worker-1").await.unwrap();
        store.fail(job.id, "worker-1", "boom").await.unwrap();

        let (successor, created) = store.create_or_get(new_job("file-a", "key-a")).await.unwrap();
        assert!(created);
        assert_ne!(successor.id, job.id);
    }

    #[tokio::test]
    async fn test_completed_job_holds_key_until_deleted() {
        let store = InMemoryJobStore::new();
        let (job, _) = store.create_or_get(new_job("file-a", "key-a")).await.unwrap();
        store.claim(job.id, "worker-1").await.unwrap();
        store
            .complete(job.id, "worker-1", Metadata::new())
            .await
            .unwrap();

        let (existing, created) = store.create_or_get(new_job("file-a", "key-a")).await.unwrap();
        assert!(!created);
        assert_eq!(existing.id, job.id);

        store.delete(job.id).await.unwrap();
        let (_, created) = store.create_or_get(new_job("file-a", "key-a")).await.unwrap();
        assert!(created);
    }

    #[tokio::test]
    async fn test_list_by_status_filters_by_type() {
        let store = InMemoryJobStore::new();
        store.create_or_get(new_job("file-a", "key-a")).await.unwrap();
        store
            .create_or_get(NewJob::from_submission(
                JobType::Generation,
                "file-b",
                "key-b",
                json!({}),
                Metadata::new(),
            ))
            .await
            .unwrap();

        let pending = store.list_by_status(JobStatus::Pending, None).await.unwrap();
        assert_eq!(pending.len(), 2);

        let analysis_pending = store
            .list_by_status(JobStatus::Pending, Some(JobType::Analysis))
            .await
            .unwrap();
        assert_eq!(analysis_pending.len(), 1);
        assert_eq!(analysis_pending[0].entity_id, "file-a");
    }

    #[tokio::test]
    async fn test_count_active_ignores_terminal_jobs() {
        let store = InMemoryJobStore::new();
        let (a, _) = store.create_or_get(new_job("file-a", "key-a")).await.unwrap();
        let (b, _) = store.create_or_get(new_job("file-b", "key-b")).await.unwrap();
        store.create_or_get(new_job("file-c", "key-c")).await.unwrap();

        store.claim(a.id, "worker-1").await.unwrap();
        store.claim(b.id, "worker-2").await.unwrap();
        store
            .complete(b.id, "worker-2", Metadata::new())
            .await
            .unwrap();

        let counts = store.count_active(JobType::Analysis).await.unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.running, 1);
        assert_eq!(counts.load(), 2);
    }

    #[tokio::test]
    async fn test_stats_aggregates_by_type_and_status() {
        let store = InMemoryJobStore::new();
        let (a, _) = store.create_or_get(new_job("file-a", "key-a")).await.unwrap();
        store.create_or_get(new_job("file-b", "key-b")).await.unwrap();
        store.claim(a.id, "worker-1").await.unwrap();
        store
            .complete(a.id, "worker-1", Metadata::new())
            .await
            .unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total(), 2);
        assert_eq!(stats.counts[&JobType::Analysis][&JobStatus::Completed], 1);
        assert_eq!(stats.counts[&JobType::Analysis][&JobStatus::Pending], 1);
        assert!(stats.avg_completion_seconds.is_some());
    }

    #[tokio::test]
    async fn test_list_pagination_newest_first() {
        let store = InMemoryJobStore::new();
        for i in 0..5 {
            store
                .create_or_get(new_job(&format!("file-{i}"), &format!("key-{i}")))
                .await
                .unwrap();
            // Distinct timestamps for a deterministic sort.
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        let filter = JobFilter {
            skip: 1,
            take: 2,
            ..Default::default()
        };
        let page = store.list(&filter).await.unwrap();
        assert_eq!(page.len(), 2);
        assert!(page[0].created_at >= page[1].created_at);
    }
}
