//! Application state shared across all handlers.

use std::sync::Arc;

use crate::autoscaler::AutoscalerController;
use crate::dispatch::Dispatcher;
use crate::store::JobStore;

/// Shared dependencies, passed to every handler via `State`.
///
/// All fields are cheap to clone.
#[derive(Clone)]
pub struct AppState {
    /// Submission and worker-callback write path.
    pub dispatcher: Dispatcher,
    /// Read path for queries and stats.
    pub store: Arc<dyn JobStore>,
    /// Autoscaling metrics source.
    pub autoscaler: Arc<AutoscalerController>,
}
