use axum::{
    Extension, Json, Router,
    extract::{Path, State},
    routing::{get, post},
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::db::enums::JobStatus;
use crate::db::services::heartbeat_service::HeartbeatStats;
use crate::db::services::job_service::{ClaimOutcome, CompletionReport};
use crate::db::services::provisioning_service::StepUpdate;
use crate::web::models::{
    AgentConfigResponse, AuthenticatedServer, CompleteJobRequest, HeartbeatResponse, JobResponse,
    JobStatusResponse,
};
use crate::web::{AppError, AppState};

/// Routes called by agents; mounted behind the agent token middleware.
pub fn create_agent_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/heartbeat", post(heartbeat))
        .route("/config", get(agent_config))
        .route("/jobs", get(list_jobs))
        .route("/jobs/{id}/claim", post(claim_job))
        .route("/jobs/{id}/complete", post(complete_job))
        .route("/jobs/{id}/status", get(job_status))
        .route("/provisioning/steps/{id}", post(update_step))
}

async fn heartbeat(
    State(app_state): State<Arc<AppState>>,
    Extension(AuthenticatedServer(server)): Extension<AuthenticatedServer>,
    Json(stats): Json<HeartbeatStats>,
) -> Result<Json<HeartbeatResponse>, AppError> {
    let now = Utc::now();
    app_state.services.heartbeats.record_heartbeat_at(server.id, stats, now).await?;
    Ok(Json(HeartbeatResponse {
        success: true,
        server_time: now,
    }))
}

async fn agent_config(
    State(app_state): State<Arc<AppState>>,
    Extension(AuthenticatedServer(server)): Extension<AuthenticatedServer>,
) -> Json<AgentConfigResponse> {
    let config = &app_state.services.config;
    Json(AgentConfigResponse {
        server_id: server.id,
        heartbeat_interval_seconds: config.heartbeat.agent_interval_seconds,
        job_poll_interval_seconds: config.heartbeat.job_poll_interval_seconds,
        saas_url: config.saas_url.clone(),
        ssh_port: server.ssh_port,
    })
}

async fn list_jobs(
    State(app_state): State<Arc<AppState>>,
    Extension(AuthenticatedServer(server)): Extension<AuthenticatedServer>,
) -> Result<Json<Vec<JobResponse>>, AppError> {
    let jobs = app_state.services.jobs.fetch_pending(server.id).await?;
    Ok(Json(jobs.into_iter().map(JobResponse::from).collect()))
}

async fn claim_job(
    State(app_state): State<Arc<AppState>>,
    Extension(AuthenticatedServer(server)): Extension<AuthenticatedServer>,
    Path(id): Path<i32>,
) -> Result<Json<JobResponse>, AppError> {
    match app_state.services.jobs.claim(id, server.id).await? {
        ClaimOutcome::Claimed(job) => Ok(Json(job.into())),
        ClaimOutcome::AlreadyClaimed => Err(AppError::Conflict(format!("Job {id} was already claimed"))),
    }
}

async fn complete_job(
    State(app_state): State<Arc<AppState>>,
    Extension(AuthenticatedServer(server)): Extension<AuthenticatedServer>,
    Path(id): Path<i32>,
    Json(payload): Json<CompleteJobRequest>,
) -> Result<Json<JobResponse>, AppError> {
    let now = Utc::now();
    let report = CompletionReport {
        success: payload.success,
        output: payload.output,
        error: payload.error,
        exit_code: payload.exit_code,
    };
    let job = app_state.services.jobs.report_completion_at(id, server.id, report, now).await?;

    // A reporting agent is alive even if its heartbeat is late.
    if let Err(e) = app_state.services.heartbeats.touch_at(server.id, now).await {
        warn!(server_id = server.id, error = %e, "Failed to refresh liveness after job completion.");
    }
    Ok(Json(job.into()))
}

async fn job_status(
    State(app_state): State<Arc<AppState>>,
    Extension(AuthenticatedServer(server)): Extension<AuthenticatedServer>,
    Path(id): Path<i32>,
) -> Result<Json<JobStatusResponse>, AppError> {
    let job = app_state.services.jobs.get_for_server(id, server.id).await?;
    debug!(job_id = id, status = %job.status, "Agent polled job status.");
    Ok(Json(JobStatusResponse {
        status: job.status,
        cancelled: job.status == JobStatus::Cancelled,
    }))
}

async fn update_step(
    State(app_state): State<Arc<AppState>>,
    Extension(AuthenticatedServer(server)): Extension<AuthenticatedServer>,
    Path(id): Path<i32>,
    Json(update): Json<StepUpdate>,
) -> Result<Json<serde_json::Value>, AppError> {
    let step = app_state.services.provisioning.update_step(id, server.id, update).await?;
    Ok(Json(serde_json::to_value(step)?))
}
