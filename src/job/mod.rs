//! Job domain model.
//!
//! This module defines the central `Job` entity and its vocabulary:
//!
//! - `Job`: a single asynchronous processing request and its lifecycle state
//! - `JobType`: the worker class that owns a job (analysis, generation, training)
//! - `JobStatus`: the job state machine states
//! - `NewJob`: the creation payload handed to the job store
//! - idempotency key derivation for duplicate-submission collapsing

pub mod key;
pub mod record;

pub use key::idempotency_key;
pub use record::{Checkpoints, Job, JobStatus, JobType, Metadata, NewJob};
