use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::entities::{agent_job, server};
use crate::db::enums::JobStatus;

/// The server whose agent token authenticated the request.
#[derive(Debug, Clone)]
pub struct AuthenticatedServer(pub server::Model);

#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub id: i32,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub priority: i32,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
}

impl From<agent_job::Model> for JobResponse {
    fn from(job: agent_job::Model) -> Self {
        Self {
            id: job.id,
            job_type: job.job_type,
            payload: job.payload,
            status: job.status,
            priority: job.priority,
            retry_count: job.retry_count,
            created_at: job.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub status: JobStatus,
    pub cancelled: bool,
}

#[derive(Debug, Deserialize)]
pub struct CompleteJobRequest {
    pub success: bool,
    pub output: Option<String>,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Serialize)]
pub struct AgentConfigResponse {
    pub server_id: i32,
    pub heartbeat_interval_seconds: u64,
    pub job_poll_interval_seconds: u64,
    pub saas_url: String,
    pub ssh_port: i32,
}

#[derive(Debug, Serialize)]
pub struct HeartbeatResponse {
    pub success: bool,
    pub server_time: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ProvisionCallbackResponse {
    pub success: bool,
    pub agent_token: String,
    pub server_id: i32,
    pub saas_url: String,
}

#[derive(Debug, Serialize)]
pub struct ConfirmResponse {
    pub confirmed: bool,
    pub rule_id: i32,
}
