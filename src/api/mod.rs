//! HTTP API surface.
//!
//! Exposes the client-facing submission/query endpoints, the worker
//! callback surface, autoscaling metrics, and Prometheus exposition. All
//! routes are mounted under `/api` except `/metrics`.

pub mod error;
pub mod handlers;
pub mod router;
pub mod state;

pub use error::ApiError;
pub use router::build_router;
pub use state::AppState;
