//! Autoscaling: per-class worker pool sizing from queue-depth metrics.
//!
//! The controller is a periodic control loop. Each tick it reads the
//! offered load (pending + running jobs) and the actual replica count fresh
//! from their sources, then nudges the pool by at most one replica within
//! configured bounds. Stability comes from three mechanisms:
//!
//! - a hysteresis gap between the scale-up and scale-down thresholds, so
//!   load between them never triggers a decision
//! - a cooldown between consecutive scaling actions for the same class,
//!   refreshed only when a change is actually applied
//! - hard `[min_workers, max_workers]` bounds
//!
//! The `WorkerPoolManager` that actually provisions workers is an external
//! collaborator behind a trait.

pub mod controller;
pub mod pool;

use thiserror::Error;

use crate::store::StoreError;

pub use controller::{AutoscalerConfig, AutoscalerController, AutoscalingMetrics, ScaleDecision};
pub use pool::{InMemoryPoolManager, WorkerPoolManager};

/// Errors that can occur in the autoscaling loop.
#[derive(Debug, Error)]
pub enum ScaleError {
    /// The worker pool manager could not be reached or refused the change.
    #[error("Worker pool unavailable: {0}")]
    PoolUnavailable(String),

    /// The controller configuration is unusable.
    #[error("Invalid autoscaler configuration: {0}")]
    InvalidConfig(String),

    /// Load metrics could not be read.
    #[error(transparent)]
    Store(#[from] StoreError),
}
