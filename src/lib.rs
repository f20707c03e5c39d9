//! waveflow: job orchestration and autoscaling engine for asynchronous
//! audio processing pipelines.
//!
//! The engine coordinates long-running analysis, generation, and training
//! jobs submitted by clients: each logical request executes at most once
//! concurrently, survives worker crashes and duplicate submissions, and a
//! hysteresis-based control loop resizes the per-class worker pools to
//! match offered load.

pub mod api;
pub mod autoscaler;
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod job;
pub mod metrics;
pub mod monitor;
pub mod store;
pub mod sweeper;

// Re-export the domain vocabulary used across module boundaries.
pub use job::{Job, JobStatus, JobType};
pub use store::{JobStore, StoreError};
