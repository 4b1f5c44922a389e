//! Route handlers implementing the HTTP control surface table (`spec.md` §6).

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{Duration as ChronoDuration, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::domain::{JobStatus, JobType, OpaqueBag, PageRequest};
use crate::error::{OrchestratorError, Result};
use crate::runtime::Runtime;

/// Routes guarded by the shared-API-key middleware (`spec.md` §6 Auth).
/// The WebSocket stream route is deliberately excluded: browsers can't set
/// a custom header on the upgrade handshake, so it authenticates via its own
/// `api_key` query parameter instead (see [`job_logs_stream`]).
pub fn protected_router() -> Router<Arc<Runtime>> {
    Router::new()
        .route("/jobs", get(list_jobs))
        .route("/jobs/:job_type/execute", post(execute_job))
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/stop", post(stop_job))
        .route("/jobs/:id/logs", get(job_logs))
        .route("/jobs/stats", get(job_stats))
        .route("/system/status", get(system_status))
        .route("/system/cleanup", post(system_cleanup))
}

pub fn stream_router() -> Router<Arc<Runtime>> {
    Router::new().route("/jobs/:id/logs/stream", get(job_logs_stream))
}

#[derive(Debug, Deserialize)]
struct ListJobsQuery {
    job_type: Option<String>,
    status: Option<String>,
    #[serde(default = "default_page")]
    page: u32,
    #[serde(default = "default_size")]
    size: u32,
}

fn default_page() -> u32 {
    1
}

fn default_size() -> u32 {
    20
}

async fn list_jobs(
    State(runtime): State<Arc<Runtime>>,
    Query(q): Query<ListJobsQuery>,
) -> Result<impl IntoResponse> {
    let job_type = q
        .job_type
        .map(|s| s.parse::<JobType>())
        .transpose()
        .map_err(OrchestratorError::InvalidRequest)?;
    let status = q
        .status
        .map(|s| match s.as_str() {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "stopped" => Ok(JobStatus::Stopped),
            other => Err(OrchestratorError::InvalidRequest(format!("unknown status {other}"))),
        })
        .transpose()?;
    let page = PageRequest { page: q.page, size: q.size };
    let page = runtime.job_manager.list(job_type, status, page).await?;
    Ok(Json(page))
}

#[derive(Debug, Deserialize)]
struct ExecuteJobRequest {
    #[serde(default)]
    parameters: OpaqueBag,
    #[serde(default)]
    created_by: Option<String>,
    #[serde(default)]
    deadline_secs: Option<u64>,
}

async fn execute_job(
    State(runtime): State<Arc<Runtime>>,
    Path(job_type): Path<String>,
    Json(body): Json<ExecuteJobRequest>,
) -> Result<impl IntoResponse> {
    let job_type: JobType = job_type.parse().map_err(OrchestratorError::InvalidRequest)?;
    let job = runtime
        .job_manager
        .submit(job_type, body.parameters, body.created_by)
        .await?;
    runtime
        .scheduler_handle
        .submit(job.clone(), body.deadline_secs.map(Duration::from_secs))?;
    Ok(Json(job))
}

async fn get_job(State(runtime): State<Arc<Runtime>>, Path(id): Path<Uuid>) -> Result<impl IntoResponse> {
    Ok(Json(runtime.job_manager.get(id).await?))
}

#[derive(Debug, Deserialize)]
struct StopJobRequest {
    #[serde(default)]
    force: bool,
}

async fn stop_job(
    State(runtime): State<Arc<Runtime>>,
    Path(id): Path<Uuid>,
    Json(body): Json<StopJobRequest>,
) -> Result<impl IntoResponse> {
    runtime.job_manager.stop(id, body.force).await?;
    Ok(Json(serde_json::json!({ "stopped": true })))
}

async fn job_logs(
    State(runtime): State<Arc<Runtime>>,
    Path(id): Path<Uuid>,
    Query(page): Query<PageRequest>,
) -> Result<impl IntoResponse> {
    Ok(Json(runtime.job_manager.logs(id, page).await?))
}

#[derive(Debug, Deserialize)]
struct StreamQuery {
    api_key: String,
}

async fn job_logs_stream(
    State(runtime): State<Arc<Runtime>>,
    Path(id): Path<Uuid>,
    Query(q): Query<StreamQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        runtime.ws_fanout.clone().handle_socket(socket, id, q.api_key).await;
    })
}

async fn job_stats(State(runtime): State<Arc<Runtime>>) -> Result<impl IntoResponse> {
    Ok(Json(runtime.job_manager.stats().await?))
}

async fn system_status(State(runtime): State<Arc<Runtime>>) -> impl IntoResponse {
    let kma_keys = runtime.key_pool.snapshot(crate::providers::Provider::Kma).await;
    let kto_keys = runtime.key_pool.snapshot(crate::providers::Provider::Kto).await;
    let alerts = runtime.monitor.active_alerts().await;
    Json(serde_json::json!({
        "keys": { "kma": kma_keys, "kto": kto_keys },
        "scheduler_queue_depth": runtime.scheduler_handle.queue_depth(),
        "active_alerts": alerts,
        "metrics": runtime.metrics.render(),
    }))
}

#[derive(Debug, Deserialize)]
struct CleanupRequest {
    #[serde(default = "default_cleanup_days")]
    older_than_days: i64,
}

fn default_cleanup_days() -> i64 {
    30
}

async fn system_cleanup(
    State(runtime): State<Arc<Runtime>>,
    Json(body): Json<CleanupRequest>,
) -> Result<impl IntoResponse> {
    let cutoff = Utc::now() - ChronoDuration::days(body.older_than_days);
    let deleted = runtime.job_manager.cleanup(cutoff).await?;
    Ok(Json(serde_json::json!({ "deleted": deleted })))
}
