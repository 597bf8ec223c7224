//! HTTP status and submission API.
//!
//! Thin JSON layer over [`JobQueue`]; every handler maps straight onto one
//! queue operation.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::hardware::HardwareInfo;
use crate::job::{Job, JobId, JobSpec, JobStatus};
use crate::queue::{JobQueue, QueueError, QueueStats, SubmitError};

/// Errors that can occur when running the API server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Serve(#[from] std::io::Error),
}

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct ApiState {
    pub queue: JobQueue,
    pub hardware: Arc<HardwareInfo>,
    pub workers: usize,
}

/// Error body returned by the API.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// A handler failure with its HTTP status.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { error: self.message })).into_response()
    }
}

impl From<SubmitError> for ApiError {
    fn from(err: SubmitError) -> Self {
        let status = match err {
            SubmitError::InvalidSpec(_) => StatusCode::BAD_REQUEST,
            SubmitError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        };
        ApiError::new(status, err.to_string())
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        let status = match err {
            QueueError::NotFound(_) => StatusCode::NOT_FOUND,
            QueueError::AlreadyTerminal { .. } | QueueError::Transition(_) => StatusCode::CONFLICT,
            QueueError::Persist(_) | QueueError::Join(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError::new(status, err.to_string())
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub id: JobId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub id: JobId,
    pub status: JobStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PauseResponse {
    pub paused: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClearResponse {
    pub removed: usize,
}

/// Short hardware description for `/stats`.
#[derive(Debug, Serialize)]
pub struct HardwareSummary {
    pub gpu: Option<String>,
    pub backends: Vec<&'static str>,
    pub hardware_encode: bool,
    pub cpu_cores: u32,
}

impl From<&HardwareInfo> for HardwareSummary {
    fn from(hw: &HardwareInfo) -> Self {
        Self {
            gpu: hw.gpu_name.clone(),
            backends: hw.backends.iter().map(|b| b.as_str()).collect(),
            hardware_encode: hw.hardware_encode,
            cpu_cores: hw.cpu_cores,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub counts: QueueStats,
    pub paused: bool,
    pub workers: usize,
    pub hardware: HardwareSummary,
}

async fn list_jobs(
    State(state): State<ApiState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Job>>, ApiError> {
    let filter = query
        .status
        .as_deref()
        .map(str::parse::<JobStatus>)
        .transpose()
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e))?;
    Ok(Json(state.queue.list(filter)))
}

async fn get_job(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    let id = JobId::from(id);
    state
        .queue
        .get(&id)
        .map(Json)
        .ok_or_else(|| QueueError::NotFound(id).into())
}

async fn submit_job(
    State(state): State<ApiState>,
    Json(spec): Json<JobSpec>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let id = state.queue.submit(spec)?;
    Ok((StatusCode::CREATED, Json(SubmitResponse { id })))
}

async fn cancel_job(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>, ApiError> {
    let id = JobId::from(id);
    let status = state.queue.cancel(&id)?;
    Ok(Json(CancelResponse { id, status }))
}

async fn pause_queue(State(state): State<ApiState>) -> Json<PauseResponse> {
    state.queue.pause();
    Json(PauseResponse { paused: true })
}

async fn resume_queue(State(state): State<ApiState>) -> Json<PauseResponse> {
    state.queue.resume();
    Json(PauseResponse { paused: false })
}

async fn clear_completed(State(state): State<ApiState>) -> Json<ClearResponse> {
    Json(ClearResponse {
        removed: state.queue.clear_completed(),
    })
}

async fn get_stats(State(state): State<ApiState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        counts: state.queue.stats(),
        paused: state.queue.is_paused(),
        workers: state.workers,
        hardware: HardwareSummary::from(state.hardware.as_ref()),
    })
}

/// Creates the axum Router with every API route
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/jobs", get(list_jobs).post(submit_job))
        .route("/jobs/completed", delete(clear_completed))
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/cancel", post(cancel_job))
        .route("/queue/pause", post(pause_queue))
        .route("/queue/resume", post(resume_queue))
        .route("/stats", get(get_stats))
        .with_state(state)
}

/// Serve the API on `bind` until `shutdown` resolves.
pub async fn run_server(
    state: ApiState,
    bind: &str,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), ServerError> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|source| ServerError::Bind {
            addr: bind.to_string(),
            source,
        })?;
    info!(addr = %bind, "API server listening");
    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
