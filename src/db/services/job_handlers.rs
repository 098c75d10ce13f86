//! Side effects applied when an agent job of a given type finishes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, IntoActiveModel, ModelTrait, QueryFilter, Set,
};
use serde_json::Value as JsonValue;
use tracing::{debug, error, info, warn};

use crate::db::entities::{agent_job, backup_schedule, node_app, server_ssh_key, ssl_certificate, supervisor_program};
use crate::db::enums::{CertificateStatus, JobStatus, NodeAppHealth, NodeAppStatus, ResourceStatus};

pub const SSH_KEY_ADD: &str = "ssh_key_add";
pub const SSH_KEY_REMOVE: &str = "ssh_key_remove";
pub const SUPERVISOR_CREATE: &str = "supervisor_create";
pub const SSL_RENEW: &str = "ssl_renew";
pub const DATABASE_BACKUP: &str = "database_backup";
pub const NODE_APP_RESTART: &str = "node_app_restart";
pub const FIREWALL_APPLY: &str = "firewall_apply";
pub const FIREWALL_REVERT: &str = "firewall_revert";
pub const PROVISION_STEP: &str = "provision_step";

/// Certificates renewed without a reported expiry are assumed to follow the ACME
/// default lifetime.
const DEFAULT_CERTIFICATE_LIFETIME_DAYS: i64 = 90;

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Database error: {0}")]
    DbErr(#[from] DbErr),
    #[error("Job payload is missing '{0}'")]
    MissingPayloadField(&'static str),
    #[error("{entity} {id} referenced by the job no longer exists")]
    TargetGone { entity: &'static str, id: i32 },
    #[error("No server ssh key on server {server_id} matches job {job_id}")]
    SshKeyNotInstalled { server_id: i32, job_id: i32 },
}

#[async_trait]
pub trait CompletionHandler: Send + Sync {
    async fn on_completion(&self, db: &DatabaseConnection, job: &agent_job::Model) -> Result<(), HandlerError>;
}

/// Maps job types to their completion side effects.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn CompletionHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(SSH_KEY_ADD, Arc::new(SshKeyAddHandler));
        registry.register(SSH_KEY_REMOVE, Arc::new(SshKeyRemoveHandler));
        registry.register(SUPERVISOR_CREATE, Arc::new(SupervisorCreateHandler));
        registry.register(SSL_RENEW, Arc::new(SslRenewHandler));
        registry.register(DATABASE_BACKUP, Arc::new(DatabaseBackupHandler));
        registry.register(NODE_APP_RESTART, Arc::new(NodeAppRestartHandler));
        registry
    }

    pub fn register(&mut self, job_type: &str, handler: Arc<dyn CompletionHandler>) {
        self.handlers.insert(job_type.to_string(), handler);
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// Runs the handler for `job.job_type`, if any. Errors are logged only.
    pub async fn dispatch(&self, db: &DatabaseConnection, job: &agent_job::Model) {
        let Some(handler) = self.handlers.get(&job.job_type) else {
            debug!(job_id = job.id, job_type = %job.job_type, "No completion handler registered.");
            return;
        };
        if let Err(e) = handler.on_completion(db, job).await {
            error!(
                job_id = job.id,
                job_type = %job.job_type,
                error = %e,
                "Completion handler failed. The job result is kept."
            );
        }
    }
}

fn payload_id(payload: &JsonValue, key: &'static str) -> Result<i32, HandlerError> {
    payload
        .get(key)
        .and_then(JsonValue::as_i64)
        .and_then(|v| i32::try_from(v).ok())
        .ok_or(HandlerError::MissingPayloadField(key))
}

fn succeeded(job: &agent_job::Model) -> bool {
    job.status == JobStatus::Completed
}

fn finished_at(job: &agent_job::Model) -> DateTime<Utc> {
    job.completed_at.unwrap_or(job.updated_at)
}

/// Finds the key/server pivot a key job targets. `server_ssh_key_id` names the
/// row directly; otherwise it is matched on `(server_id, key_id[, username])`.
async fn find_ssh_key_pivot(
    db: &DatabaseConnection,
    job: &agent_job::Model,
) -> Result<Option<server_ssh_key::Model>, HandlerError> {
    if let Ok(id) = payload_id(&job.payload, "server_ssh_key_id") {
        return Ok(server_ssh_key::Entity::find_by_id(id)
            .filter(server_ssh_key::Column::ServerId.eq(job.server_id))
            .one(db)
            .await?);
    }

    let key_id = payload_id(&job.payload, "key_id")?;
    let mut query = server_ssh_key::Entity::find()
        .filter(server_ssh_key::Column::ServerId.eq(job.server_id))
        .filter(server_ssh_key::Column::SshKeyId.eq(key_id));
    if let Some(username) = job.payload.get("username").and_then(JsonValue::as_str) {
        query = query.filter(server_ssh_key::Column::Username.eq(username));
    }
    Ok(query.one(db).await?)
}

struct SshKeyAddHandler;

#[async_trait]
impl CompletionHandler for SshKeyAddHandler {
    async fn on_completion(&self, db: &DatabaseConnection, job: &agent_job::Model) -> Result<(), HandlerError> {
        let pivot = find_ssh_key_pivot(db, job).await?.ok_or(HandlerError::SshKeyNotInstalled {
            server_id: job.server_id,
            job_id: job.id,
        })?;

        let id = pivot.id;
        let status = if succeeded(job) { ResourceStatus::Active } else { ResourceStatus::Failed };
        let mut active = pivot.into_active_model();
        active.status = Set(status);
        active.updated_at = Set(finished_at(job));
        active.update(db).await?;
        info!(server_ssh_key_id = id, server_id = job.server_id, status = %status, "SSH key installation settled.");
        Ok(())
    }
}

struct SshKeyRemoveHandler;

#[async_trait]
impl CompletionHandler for SshKeyRemoveHandler {
    async fn on_completion(&self, db: &DatabaseConnection, job: &agent_job::Model) -> Result<(), HandlerError> {
        if !succeeded(job) {
            warn!(job_id = job.id, server_id = job.server_id, "SSH key removal failed on the server; key left in place.");
            return Ok(());
        }
        if let Some(pivot) = find_ssh_key_pivot(db, job).await? {
            let id = pivot.id;
            pivot.delete(db).await?;
            info!(server_ssh_key_id = id, server_id = job.server_id, "SSH key removed from server.");
        }
        Ok(())
    }
}

struct SupervisorCreateHandler;

#[async_trait]
impl CompletionHandler for SupervisorCreateHandler {
    async fn on_completion(&self, db: &DatabaseConnection, job: &agent_job::Model) -> Result<(), HandlerError> {
        let id = payload_id(&job.payload, "supervisor_program_id")?;
        let program = supervisor_program::Entity::find_by_id(id)
            .one(db)
            .await?
            .ok_or(HandlerError::TargetGone { entity: "supervisor program", id })?;

        let status = if succeeded(job) { ResourceStatus::Active } else { ResourceStatus::Failed };
        let mut active = program.into_active_model();
        active.status = Set(status);
        active.updated_at = Set(finished_at(job));
        active.update(db).await?;
        info!(supervisor_program_id = id, status = %status, "Supervisor program settled.");
        Ok(())
    }
}

/// Reads `{"expires_at": "<rfc3339>"}` from the agent's output, if it sent one.
fn reported_expiry(output: Option<&str>) -> Option<DateTime<Utc>> {
    let value: JsonValue = serde_json::from_str(output?.trim()).ok()?;
    let raw = value.get("expires_at")?.as_str()?;
    DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.with_timezone(&Utc))
}

struct SslRenewHandler;

#[async_trait]
impl CompletionHandler for SslRenewHandler {
    async fn on_completion(&self, db: &DatabaseConnection, job: &agent_job::Model) -> Result<(), HandlerError> {
        let id = payload_id(&job.payload, "certificate_id")?;
        let cert = ssl_certificate::Entity::find_by_id(id)
            .one(db)
            .await?
            .ok_or(HandlerError::TargetGone { entity: "certificate", id })?;

        let now = finished_at(job);
        let mut active = cert.into_active_model();
        if succeeded(job) {
            let expires_at = reported_expiry(job.output.as_deref())
                .unwrap_or(now + Duration::days(DEFAULT_CERTIFICATE_LIFETIME_DAYS));
            active.status = Set(CertificateStatus::Active);
            active.expires_at = Set(Some(expires_at));
            active.last_renewed_at = Set(Some(now));
            active.last_error = Set(None);
            info!(certificate_id = id, %expires_at, "Certificate renewed.");
        } else {
            active.status = Set(CertificateStatus::Failed);
            active.last_error = Set(job.error.clone());
            warn!(certificate_id = id, error = ?job.error, "Certificate renewal failed.");
        }
        active.updated_at = Set(now);
        active.update(db).await?;
        Ok(())
    }
}

struct DatabaseBackupHandler;

#[async_trait]
impl CompletionHandler for DatabaseBackupHandler {
    async fn on_completion(&self, db: &DatabaseConnection, job: &agent_job::Model) -> Result<(), HandlerError> {
        let id = payload_id(&job.payload, "schedule_id")?;
        let Some(schedule) = backup_schedule::Entity::find_by_id(id).one(db).await? else {
            debug!(schedule_id = id, "Backup schedule deleted before its job finished.");
            return Ok(());
        };

        let status = if succeeded(job) { "success" } else { "failed" };
        let mut active = schedule.into_active_model();
        active.last_status = Set(Some(status.to_string()));
        active.last_job_id = Set(Some(job.id));
        active.updated_at = Set(finished_at(job));
        active.update(db).await?;
        info!(schedule_id = id, job_id = job.id, status, "Database backup finished.");
        Ok(())
    }
}

struct NodeAppRestartHandler;

#[async_trait]
impl CompletionHandler for NodeAppRestartHandler {
    async fn on_completion(&self, db: &DatabaseConnection, job: &agent_job::Model) -> Result<(), HandlerError> {
        let id = payload_id(&job.payload, "app_id")?;
        let app = node_app::Entity::find_by_id(id)
            .one(db)
            .await?
            .ok_or(HandlerError::TargetGone { entity: "node app", id })?;

        let now = finished_at(job);
        let mut active = app.into_active_model();
        if succeeded(job) {
            active.status = Set(NodeAppStatus::Running);
            active.health_status = Set(NodeAppHealth::Unknown);
            active.consecutive_health_failures = Set(0);
            active.last_restart_at = Set(Some(now));
            info!(app_id = id, server_id = job.server_id, "Node app restarted.");
        } else {
            active.status = Set(NodeAppStatus::Errored);
            warn!(app_id = id, server_id = job.server_id, error = ?job.error, "Node app restart failed.");
        }
        active.updated_at = Set(now);
        active.update(db).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_cover_every_builtin_job_type() {
        let registry = HandlerRegistry::with_defaults();
        for job_type in [SSH_KEY_ADD, SSH_KEY_REMOVE, SUPERVISOR_CREATE, SSL_RENEW, DATABASE_BACKUP, NODE_APP_RESTART] {
            assert!(registry.contains(job_type), "{job_type} has no handler");
        }
        assert!(!registry.contains(FIREWALL_APPLY));
    }

    #[test]
    fn payload_ids_must_be_integers() {
        assert_eq!(payload_id(&json!({"app_id": 4}), "app_id").unwrap(), 4);
        assert!(matches!(
            payload_id(&json!({"app_id": "4"}), "app_id"),
            Err(HandlerError::MissingPayloadField("app_id"))
        ));
        assert!(payload_id(&json!({}), "app_id").is_err());
    }

    #[test]
    fn renewal_output_may_carry_new_expiry() {
        let expiry = reported_expiry(Some(r#"{"expires_at": "2027-01-15T00:00:00Z"}"#)).unwrap();
        assert_eq!(expiry.to_rfc3339(), "2027-01-15T00:00:00+00:00");
        assert!(reported_expiry(Some("renewed ok")).is_none());
        assert!(reported_expiry(None).is_none());
    }
}
