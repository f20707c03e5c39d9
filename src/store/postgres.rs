//! PostgreSQL job store.
//!
//! Idempotency is enforced by a partial unique index on the idempotency key
//! (see `schema.rs`); single-writer-per-record mutations take a row lock,
//! apply the shared transition logic, and write the record back in one
//! transaction.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use crate::job::{Checkpoints, Job, JobStatus, JobType, Metadata, NewJob};

use super::migrations::MigrationRunner;
use super::transition::{self, Outcome};
use super::{ActiveCounts, JobFilter, JobStats, JobStore, StoreError};

/// PostgreSQL-backed job repository.
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    /// Connects to the database and returns a new store.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    /// Creates a store from an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Applies the job table schema.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        MigrationRunner::new(self.pool.clone())
            .run_migrations()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))
    }

    fn row_to_job(row: &sqlx::postgres::PgRow) -> Result<Job, StoreError> {
        let job_type: String = row.get("job_type");
        let status: String = row.get("status");
        let checkpoints_json: serde_json::Value = row.get("checkpoints");
        let metadata_json: serde_json::Value = row.get("metadata");

        let checkpoints: Checkpoints =
            serde_json::from_value(checkpoints_json).map_err(StoreError::Serialization)?;
        let metadata: Metadata =
            serde_json::from_value(metadata_json).map_err(StoreError::Serialization)?;

        Ok(Job {
            id: row.get("id"),
            job_type: job_type.parse().map_err(StoreError::Decode)?,
            entity_id: row.get("entity_id"),
            idempotency_key: row.get("idempotency_key"),
            params: row.get("params"),
            status: status.parse().map_err(StoreError::Decode)?,
            worker_instance_id: row.get("worker_instance_id"),
            current_step: row.get("current_step"),
            checkpoints,
            metadata,
            error_message: row.get("error_message"),
            retry_count: row.get::<i32, _>("retry_count") as u32,
            created_at: row.get("created_at"),
            started_at: row.get("started_at"),
            last_heartbeat: row.get("last_heartbeat"),
            completed_at: row.get("completed_at"),
        })
    }

    /// Row-locked read-apply-write cycle shared by all mutations.
    async fn mutate<F>(&self, id: Uuid, apply: F) -> Result<(Job, Outcome), StoreError>
    where
        F: FnOnce(&mut Job) -> Result<Outcome, StoreError>,
    {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM jobs WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::NotFound(id))?;

        let mut job = Self::row_to_job(&row)?;
        let outcome = apply(&mut job)?;

        if outcome == Outcome::Applied {
            sqlx::query(
                r#"
                UPDATE jobs SET
                    status = $2,
                    worker_instance_id = $3,
                    current_step = $4,
                    checkpoints = $5,
                    metadata = $6,
                    error_message = $7,
                    started_at = $8,
                    last_heartbeat = $9,
                    completed_at = $10
                WHERE id = $1
                "#,
            )
            .bind(job.id)
            .bind(job.status.as_str())
            .bind(&job.worker_instance_id)
            .bind(&job.current_step)
            .bind(serde_json::to_value(&job.checkpoints)?)
            .bind(serde_json::to_value(&job.metadata)?)
            .bind(&job.error_message)
            .bind(job.started_at)
            .bind(job.last_heartbeat)
            .bind(job.completed_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok((job, outcome))
    }

    async fn fetch_active_by_key(&self, key: &str) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM jobs WHERE idempotency_key = $1 AND status NOT IN ('failed', 'cancelled')",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_job).transpose()
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn create_or_get(&self, new: NewJob) -> Result<(Job, bool), StoreError> {
        let job = Job::from_new(new, Utc::now());

        // The partial unique index arbitrates concurrent identical
        // submissions: exactly one INSERT lands, every other caller falls
        // through to the read of the surviving row.
        let inserted = sqlx::query(
            r#"
            INSERT INTO jobs (
                id, job_type, entity_id, idempotency_key, params, status,
                checkpoints, metadata, retry_count, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (idempotency_key)
            WHERE status NOT IN ('failed', 'cancelled')
            DO NOTHING
            "#,
        )
        .bind(job.id)
        .bind(job.job_type.as_str())
        .bind(&job.entity_id)
        .bind(&job.idempotency_key)
        .bind(&job.params)
        .bind(job.status.as_str())
        .bind(serde_json::to_value(&job.checkpoints)?)
        .bind(serde_json::to_value(&job.metadata)?)
        .bind(job.retry_count as i32)
        .bind(job.created_at)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 1 {
            return Ok((job, true));
        }

        match self.fetch_active_by_key(&job.idempotency_key).await? {
            Some(existing) => Ok((existing, false)),
            // The conflicting row was released between our insert and read;
            // surface the race instead of guessing.
            None => Err(StoreError::Conflict(job.id)),
        }
    }

    async fn get(&self, id: Uuid) -> Result<Job, StoreError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound(id))?;
        Self::row_to_job(&row)
    }

    async fn list_by_entity(&self, entity_id: &str) -> Result<Vec<Job>, StoreError> {
        let rows =
            sqlx::query("SELECT * FROM jobs WHERE entity_id = $1 ORDER BY created_at DESC")
                .bind(entity_id)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(Self::row_to_job).collect()
    }

    async fn list_by_status(
        &self,
        status: JobStatus,
        job_type: Option<JobType>,
    ) -> Result<Vec<Job>, StoreError> {
        let rows = match job_type {
            Some(job_type) => {
                sqlx::query(
                    "SELECT * FROM jobs WHERE status = $1 AND job_type = $2 ORDER BY created_at DESC",
                )
                .bind(status.as_str())
                .bind(job_type.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM jobs WHERE status = $1 ORDER BY created_at DESC")
                    .bind(status.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(Self::row_to_job).collect()
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT * FROM jobs WHERE TRUE");

        if let Some(status) = filter.status {
            builder.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(job_type) = filter.job_type {
            builder.push(" AND job_type = ").push_bind(job_type.as_str());
        }
        builder
            .push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(filter.limit() as i64)
            .push(" OFFSET ")
            .push_bind(filter.skip as i64);

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_job).collect()
    }

    async fn claim(&self, id: Uuid, worker_instance_id: &str) -> Result<Job, StoreError> {
        let (job, _) = self
            .mutate(id, |job| transition::claim(job, worker_instance_id, Utc::now()))
            .await?;
        Ok(job)
    }

    async fn heartbeat(
        &self,
        id: Uuid,
        worker_instance_id: &str,
        current_step: Option<String>,
        checkpoints: Checkpoints,
    ) -> Result<Job, StoreError> {
        let (job, _) = self
            .mutate(id, |job| {
                transition::heartbeat(job, worker_instance_id, current_step, checkpoints, Utc::now())
            })
            .await?;
        Ok(job)
    }

    async fn complete(
        &self,
        id: Uuid,
        worker_instance_id: &str,
        result_metadata: Metadata,
    ) -> Result<(Job, bool), StoreError> {
        let (job, outcome) = self
            .mutate(id, |job| {
                transition::complete(job, worker_instance_id, result_metadata, Utc::now())
            })
            .await?;
        Ok((job, outcome == Outcome::Applied))
    }

    async fn fail(
        &self,
        id: Uuid,
        worker_instance_id: &str,
        error: &str,
    ) -> Result<(Job, bool), StoreError> {
        let (job, outcome) = self
            .mutate(id, |job| {
                transition::fail(job, worker_instance_id, error, Utc::now())
            })
            .await?;
        Ok((job, outcome == Outcome::Applied))
    }

    async fn fail_dispatch(&self, id: Uuid, error: &str) -> Result<(Job, bool), StoreError> {
        let (job, outcome) = self
            .mutate(id, |job| transition::fail_dispatch(job, error, Utc::now()))
            .await?;
        Ok((job, outcome == Outcome::Applied))
    }

    async fn cancel(&self, id: Uuid) -> Result<Job, StoreError> {
        let (job, _) = self.mutate(id, |job| transition::cancel(job, Utc::now())).await?;
        Ok(job)
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn count_active(&self, job_type: JobType) -> Result<ActiveCounts, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS count
            FROM jobs
            WHERE job_type = $1 AND status IN ('pending', 'running')
            GROUP BY status
            "#,
        )
        .bind(job_type.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut counts = ActiveCounts::default();
        for row in rows {
            let status: String = row.get("status");
            let count: i64 = row.get("count");
            match status.as_str() {
                "pending" => counts.pending = count as u64,
                "running" => counts.running = count as u64,
                _ => {}
            }
        }
        Ok(counts)
    }

    async fn stats(&self) -> Result<JobStats, StoreError> {
        let mut stats = JobStats::default();

        let rows = sqlx::query(
            "SELECT job_type, status, COUNT(*) AS count FROM jobs GROUP BY job_type, status",
        )
        .fetch_all(&self.pool)
        .await?;

        for row in rows {
            let job_type: JobType = row
                .get::<String, _>("job_type")
                .parse()
                .map_err(StoreError::Decode)?;
            let status: JobStatus = row
                .get::<String, _>("status")
                .parse()
                .map_err(StoreError::Decode)?;
            let count: i64 = row.get("count");
            stats
                .counts
                .entry(job_type)
                .or_default()
                .insert(status, count as u64);
        }

        let avg_row = sqlx::query(
            r#"
            SELECT AVG(EXTRACT(EPOCH FROM (completed_at - started_at))::float8)::float8 AS avg_seconds
            FROM jobs
            WHERE status = 'completed' AND started_at IS NOT NULL AND completed_at IS NOT NULL
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        stats.avg_completion_seconds = avg_row.get("avg_seconds");

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_count_roundtrips_through_i32() {
        // The column is INTEGER; retry counts stay far below i32::MAX but
        // the cast path should be visible and total.
        let as_db = 7u32 as i32;
        assert_eq!(as_db as u32, 7);
    }

    #[test]
    fn test_status_strings_match_schema_predicates() {
        // The partial index predicate names these states literally; the
        // enum serialization must stay in sync with it.
        assert_eq!(JobStatus::Failed.as_str(), "failed");
        assert_eq!(JobStatus::Cancelled.as_str(), "cancelled");
    }
}
