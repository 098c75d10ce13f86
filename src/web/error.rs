use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::error;

use crate::db::services::backup_service::BackupError;
use crate::db::services::firewall_service::FirewallError;
use crate::db::services::heartbeat_service::HeartbeatError;
use crate::db::services::job_service::JobError;
use crate::db::services::monitor_service::MonitorError;
use crate::db::services::provisioning_service::ProvisioningError;
use crate::state::TransitionError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Not Found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Gone: {0}")]
    Gone(String),
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Internal server error: {0}")]
    InternalServerError(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::Gone(msg) => (StatusCode::GONE, msg),
            AppError::DatabaseError(msg) => {
                error!(error = %msg, "Request failed on a database error.");
                (StatusCode::INTERNAL_SERVER_ERROR, "Database error".to_string())
            }
            AppError::InternalServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({ "error": error_message }))).into_response()
    }
}

impl From<sea_orm::DbErr> for AppError {
    fn from(err: sea_orm::DbErr) -> Self {
        AppError::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::InternalServerError(format!("JSON serialization/deserialization error: {err}"))
    }
}

impl From<TransitionError> for AppError {
    fn from(err: TransitionError) -> Self {
        AppError::Conflict(err.to_string())
    }
}

impl From<JobError> for AppError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::DbErr(e) => e.into(),
            JobError::NotFound(_) => AppError::NotFound(err.to_string()),
            JobError::Cancelled(_) => AppError::Gone(err.to_string()),
            JobError::InvalidTransition(e) => e.into(),
        }
    }
}

impl From<HeartbeatError> for AppError {
    fn from(err: HeartbeatError) -> Self {
        match err {
            HeartbeatError::DbErr(e) => e.into(),
            HeartbeatError::ServerNotFound(_) => AppError::NotFound(err.to_string()),
        }
    }
}

impl From<MonitorError> for AppError {
    fn from(err: MonitorError) -> Self {
        match err {
            MonitorError::DbErr(e) => e.into(),
            MonitorError::NotFound(_) | MonitorError::UnknownHeartbeatToken => AppError::NotFound(err.to_string()),
            MonitorError::Invalid(msg) => AppError::InvalidInput(msg),
        }
    }
}

impl From<FirewallError> for AppError {
    fn from(err: FirewallError) -> Self {
        match err {
            FirewallError::DbErr(e) => e.into(),
            FirewallError::NotFound(_) | FirewallError::ServerNotFound(_) | FirewallError::UnknownToken => {
                AppError::NotFound(err.to_string())
            }
            FirewallError::AlreadyConfirmed | FirewallError::SystemRule(_) | FirewallError::InvalidState { .. } => {
                AppError::Conflict(err.to_string())
            }
            FirewallError::Expired | FirewallError::RolledBack => AppError::Gone(err.to_string()),
            FirewallError::InvalidPort(_) => AppError::InvalidInput(err.to_string()),
        }
    }
}

impl From<ProvisioningError> for AppError {
    fn from(err: ProvisioningError) -> Self {
        match err {
            ProvisioningError::DbErr(e) => e.into(),
            ProvisioningError::UnknownToken
            | ProvisioningError::ServerNotFound(_)
            | ProvisioningError::StepNotFound(_) => AppError::NotFound(err.to_string()),
            ProvisioningError::InvalidAgentToken | ProvisioningError::AgentTokenExpired => {
                AppError::Unauthorized(err.to_string())
            }
            ProvisioningError::InvalidTransition(e) => e.into(),
            ProvisioningError::Job(e) => e.into(),
        }
    }
}

impl From<BackupError> for AppError {
    fn from(err: BackupError) -> Self {
        match err {
            BackupError::DbErr(e) => e.into(),
            BackupError::InvalidCron { .. } => AppError::InvalidInput(err.to_string()),
            BackupError::ServerNotFound(_) => AppError::NotFound(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn firewall_confirmation_errors_map_to_distinct_statuses() {
        let status = |e: FirewallError| AppError::from(e).into_response().status();
        assert_eq!(status(FirewallError::UnknownToken), StatusCode::NOT_FOUND);
        assert_eq!(status(FirewallError::AlreadyConfirmed), StatusCode::CONFLICT);
        assert_eq!(status(FirewallError::Expired), StatusCode::GONE);
        assert_eq!(status(FirewallError::RolledBack), StatusCode::GONE);
    }

    #[test]
    fn expired_agent_tokens_are_unauthorized() {
        let response = AppError::from(ProvisioningError::AgentTokenExpired).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
