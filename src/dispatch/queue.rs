//! Redis-backed dispatch queues, one per worker class.
//!
//! # Queue structure
//!
//! Each worker class owns two Redis lists:
//!
//! - `{prefix}:{class}`: main queue the dispatcher enqueues into
//! - `{prefix}:{class}:processing`: messages a worker has dequeued but not
//!   yet acknowledged, for crash recovery
//!
//! Dequeue uses BRPOPLPUSH so a message moves atomically into the
//! processing list; a worker that dies between dequeue and claim leaves the
//! message recoverable. Delivery is at-least-once by design — the job
//! store's first-wins claim makes redelivered duplicates harmless.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::job::{Job, JobType};

use super::DispatchSink;

/// Errors that can occur during dispatch operations.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Failed to connect to Redis.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// Failed to serialize a dispatch message.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Every enqueue attempt for a job failed.
    #[error("Dispatch retries exhausted after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
}

/// Hand-off payload for one job.
///
/// Carries everything a worker needs to start processing without a store
/// read; the job id is what the worker claims and reports against.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchMessage {
    /// Id of the job to process.
    pub job_id: Uuid,
    /// Worker class the message is routed to.
    pub job_type: JobType,
    /// Resource under processing.
    pub entity_id: String,
    /// Request parameters.
    pub params: serde_json::Value,
    /// 1-based delivery attempt, for logging on the worker side.
    pub attempt: u32,
}

impl DispatchMessage {
    /// Builds the hand-off message for a job at the given delivery attempt.
    pub fn for_job(job: &Job, attempt: u32) -> Self {
        Self {
            job_id: job.id,
            job_type: job.job_type,
            entity_id: job.entity_id.clone(),
            params: job.params.clone(),
            attempt,
        }
    }
}

/// Redis-backed per-class dispatch queue.
pub struct DispatchQueue {
    /// Connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    /// Prefix for all queue keys.
    prefix: String,
}

impl DispatchQueue {
    /// Connects to Redis and creates the queue handle.
    pub async fn connect(redis_url: &str, prefix: &str) -> Result<Self, DispatchError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| DispatchError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| DispatchError::ConnectionFailed(e.to_string()))?;

        Ok(Self {
            redis,
            prefix: prefix.to_string(),
        })
    }

    /// Creates a queue handle from an existing connection manager.
    pub fn from_connection(redis: ConnectionManager, prefix: &str) -> Self {
        Self {
            redis,
            prefix: prefix.to_string(),
        }
    }

    fn queue_key(&self, class: JobType) -> String {
        format!("{}:{}", self.prefix, class)
    }

    fn processing_key(&self, class: JobType) -> String {
        format!("{}:{}:processing", self.prefix, class)
    }

    /// Dequeues the next message for a class, blocking up to `timeout`.
    ///
    /// The message moves atomically to the processing list; acknowledge it
    /// with [`ack`](Self::ack) once the job is claimed.
    pub async fn dequeue(
        &self,
        class: JobType,
        timeout: Duration,
    ) -> Result<Option<DispatchMessage>, DispatchError> {
        let mut conn = self.redis.clone();
        let timeout_secs = timeout.as_secs().max(1) as usize;

        let result: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(self.queue_key(class))
            .arg(self.processing_key(class))
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await?;

        match result {
            Some(data) => {
                let message: DispatchMessage = serde_json::from_str(&data)?;
                Ok(Some(message))
            }
            None => Ok(None),
        }
    }

    /// Acknowledges a dequeued message, removing it from the processing
    /// list. Missing entries are not an error; the list may already have
    /// been recovered.
    pub async fn ack(
        &self,
        class: JobType,
        message: &DispatchMessage,
    ) -> Result<(), DispatchError> {
        let serialized = serde_json::to_string(message)?;
        let mut conn = self.redis.clone();
        conn.lrem::<_, _, ()>(self.processing_key(class), 1, serialized)
            .await?;
        Ok(())
    }

    /// Moves every message stuck in the processing list back to the main
    /// queue. Called on startup to recover deliveries from crashed
    /// consumers. Returns the number of messages recovered.
    pub async fn recover_processing(&self, class: JobType) -> Result<usize, DispatchError> {
        let mut conn = self.redis.clone();
        let processing = self.processing_key(class);
        let queue = self.queue_key(class);

        let stuck: Vec<String> = conn.lrange(&processing, 0, -1).await?;
        let mut recovered = 0;

        for data in stuck {
            let mut pipe = redis::pipe();
            pipe.atomic()
                .lrem(&processing, 1, &data)
                .rpush(&queue, &data);
            pipe.query_async::<_, ()>(&mut conn).await?;
            recovered += 1;
        }

        Ok(recovered)
    }

    /// Number of messages currently being processed for a class.
    pub async fn processing_len(&self, class: JobType) -> Result<usize, DispatchError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(self.processing_key(class)).await?;
        Ok(len)
    }
}

#[async_trait]
impl DispatchSink for DispatchQueue {
    async fn enqueue(&self, message: &DispatchMessage) -> Result<(), DispatchError> {
        let serialized = serde_json::to_string(message)?;
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(self.queue_key(message.job_type), serialized)
            .await?;
        Ok(())
    }

    async fn depth(&self, class: JobType) -> Result<usize, DispatchError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(self.queue_key(class)).await?;
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Metadata, NewJob};
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn test_message_built_from_job() {
        let job = Job::from_new(
            NewJob::from_submission(
                JobType::Generation,
                "file-a",
                "key-a",
                json!({"style": "rock"}),
                Metadata::new(),
            ),
            Utc::now(),
        );

        let message = DispatchMessage::for_job(&job, 1);
        assert_eq!(message.job_id, job.id);
        assert_eq!(message.job_type, JobType::Generation);
        assert_eq!(message.entity_id, "file-a");
        assert_eq!(message.params, json!({"style": "rock"}));
        assert_eq!(message.attempt, 1);
    }

    #[test]
    fn test_message_serialization_roundtrip() {
        let message = DispatchMessage {
            job_id: Uuid::new_v4(),
            job_type: JobType::Analysis,
            entity_id: "file-b".to_string(),
            params: json!(null),
            attempt: 2,
        };

        let json = serde_json::to_string(&message).expect("serialize");
        let parsed: DispatchMessage = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, message);
    }

    #[test]
    fn test_queue_keys_are_class_scoped() {
        // Key layout is part of the wire contract with workers.
        let json = serde_json::to_string(&JobType::Analysis).expect("serialize");
        assert_eq!(json, "\"analysis\"");
        assert_eq!(format!("waveflow:{}", JobType::Analysis), "waveflow:analysis");
    }
}
