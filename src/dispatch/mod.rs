//! Idempotent submission and worker hand-off.
//!
//! The dispatcher is the write path into the system:
//!
//! ```text
//!   client ──submit──▶ Dispatcher ──create_or_get──▶ Job Store
//!                          │
//!                          └──enqueue──▶ per-class Redis queue ──▶ workers
//! ```
//!
//! Submission computes an idempotency key and creates-or-finds the job, so
//! concurrent duplicates collapse to one row; only the creating call
//! enqueues a dispatch message. Hand-off is at-least-once: lost or
//! duplicated deliveries are absorbed by the first-wins claim on the store.
//!
//! The queue transport sits behind [`DispatchSink`] so the engine and its
//! tests can run against an in-memory sink.

pub mod dispatcher;
pub mod queue;

use async_trait::async_trait;

use crate::job::JobType;

pub use dispatcher::{
    AutoRetry, Dispatcher, DispatcherConfig, FailOutcome, SubmitError, SubmitReceipt,
    SubmitRequest,
};
pub use queue::{DispatchError, DispatchMessage, DispatchQueue};

/// Producer half of the worker hand-off transport.
#[async_trait]
pub trait DispatchSink: Send + Sync {
    /// Enqueues one dispatch message for its worker class.
    async fn enqueue(&self, message: &DispatchMessage) -> Result<(), DispatchError>;

    /// Number of messages waiting for the class.
    async fn depth(&self, class: JobType) -> Result<usize, DispatchError>;
}
