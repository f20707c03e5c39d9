//! Route definitions.
//!
//! Client and worker routes are mounted under `/api`; Prometheus
//! exposition lives at `/metrics` for scraper convention.

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use super::handlers;
use super::state::AppState;

/// Builds the complete router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route(
            "/jobs",
            post(handlers::submit_job).get(handlers::list_jobs),
        )
        .route("/jobs/{id}", get(handlers::get_job))
        .route("/jobs/{id}/cancel", post(handlers::cancel_job))
        .route("/jobs/{id}/claim", post(handlers::claim_job))
        .route("/jobs/{id}/heartbeat", post(handlers::heartbeat_job))
        .route("/jobs/{id}/complete", post(handlers::complete_job))
        .route("/jobs/{id}/fail", post(handlers::fail_job))
        .route("/stats", get(handlers::stats))
        .route("/autoscaler/{class}", get(handlers::autoscaler_metrics))
        .route("/health", get(handlers::health));

    Router::new()
        .nest("/api", api_routes)
        .route("/metrics", get(handlers::metrics_text))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
