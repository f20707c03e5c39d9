//! Request handlers.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use crate::dispatch::{SubmitReceipt, SubmitRequest};
use crate::job::{Checkpoints, Job, JobStatus, JobType, Metadata};
use crate::metrics;
use crate::store::{JobFilter, JobStats};

use super::error::ApiError;
use super::state::AppState;

/// POST /api/jobs
#[derive(Debug, Deserialize)]
pub struct SubmitBody {
    pub job_type: JobType,
    pub entity_id: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub metadata: Metadata,
}

pub async fn submit_job(
    State(state): State<AppState>,
    Json(body): Json<SubmitBody>,
) -> Result<(StatusCode, Json<SubmitReceipt>), ApiError> {
    let receipt = state
        .dispatcher
        .submit(SubmitRequest {
            job_type: body.job_type,
            entity_id: body.entity_id,
            params: body.params,
            metadata: body.metadata,
        })
        .await?;

    let status = if receipt.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(receipt)))
}

/// GET /api/jobs/{id}
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(state.store.get(id).await?))
}

/// GET /api/jobs
#[derive(Debug, Deserialize, Default)]
pub struct ListQuery {
    pub status: Option<JobStatus>,
    pub job_type: Option<JobType>,
    pub entity_id: Option<String>,
    #[serde(default)]
    pub skip: u64,
    #[serde(default)]
    pub take: u64,
}

pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Job>>, ApiError> {
    if let Some(entity_id) = &query.entity_id {
        return Ok(Json(state.store.list_by_entity(entity_id).await?));
    }

    let filter = JobFilter {
        status: query.status,
        job_type: query.job_type,
        skip: query.skip,
        take: query.take,
    };
    Ok(Json(state.store.list(&filter).await?))
}

/// GET /api/stats
pub async fn stats(State(state): State<AppState>) -> Result<Json<JobStats>, ApiError> {
    Ok(Json(state.store.stats().await?))
}

/// POST /api/jobs/{id}/cancel
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(state.dispatcher.cancel(id).await?))
}

/// POST /api/jobs/{id}/claim
#[derive(Debug, Deserialize)]
pub struct ClaimBody {
    pub worker_instance_id: String,
}

pub async fn claim_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<ClaimBody>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(
        state.dispatcher.claim(id, &body.worker_instance_id).await?,
    ))
}

/// POST /api/jobs/{id}/heartbeat
#[derive(Debug, Deserialize)]
pub struct HeartbeatBody {
    pub worker_instance_id: String,
    pub current_step: Option<String>,
    #[serde(default)]
    pub checkpoints: Checkpoints,
}

pub async fn heartbeat_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<HeartbeatBody>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(
        state
            .dispatcher
            .heartbeat(
                id,
                &body.worker_instance_id,
                body.current_step,
                body.checkpoints,
            )
            .await?,
    ))
}

/// POST /api/jobs/{id}/complete
#[derive(Debug, Deserialize)]
pub struct CompleteBody {
    pub worker_instance_id: String,
    #[serde(default)]
    pub result_metadata: Metadata,
}

pub async fn complete_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<CompleteBody>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(
        state
            .dispatcher
            .complete(id, &body.worker_instance_id, body.result_metadata)
            .await?,
    ))
}

/// POST /api/jobs/{id}/fail
#[derive(Debug, Deserialize)]
pub struct FailBody {
    pub worker_instance_id: String,
    pub error: String,
    #[serde(default)]
    pub retryable: bool,
}

pub async fn fail_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<FailBody>,
) -> Result<Json<Job>, ApiError> {
    let outcome = state
        .dispatcher
        .fail(id, &body.worker_instance_id, &body.error, body.retryable)
        .await?;
    Ok(Json(outcome.job))
}

/// GET /api/autoscaler/{class}
pub async fn autoscaler_metrics(
    State(state): State<AppState>,
    Path(class): Path<String>,
) -> Result<Json<crate::autoscaler::AutoscalingMetrics>, ApiError> {
    let class: JobType = class
        .parse()
        .map_err(|e: String| ApiError::bad_request(e))?;
    Ok(Json(state.autoscaler.metrics(class).await?))
}

/// GET /api/health
#[derive(Debug, serde::Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// GET /metrics
///
/// Refreshes the job gauges from the store, then renders the registry.
pub async fn metrics_text(State(state): State<AppState>) -> Result<String, ApiError> {
    let stats = state.store.stats().await?;
    for class in JobType::ALL {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            let count = stats
                .counts
                .get(&class)
                .and_then(|by_status| by_status.get(&status))
                .copied()
                .unwrap_or(0);
            metrics::set_jobs_gauge(class, status, count);
        }
        if let Ok(snapshot) = state.autoscaler.metrics(class).await {
            metrics::set_replicas_gauge(class, snapshot.current_replicas);
        }
    }
    Ok(metrics::gather_metrics())
}
