use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, IntoActiveModel, QueryFilter, QueryOrder,
    Set,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::db::entities::{provisioning_step, server};
use crate::db::enums::{ServerStatus, StepStatus};
use crate::db::services::job_handlers::PROVISION_STEP;
use crate::db::services::job_service::{JobError, JobQueue};
use crate::state::TransitionError;

/// The ordered plan every new server goes through: (category, step name).
pub const DEFAULT_PLAN: &[(&str, &str)] = &[
    ("system", "update_packages"),
    ("system", "install_base_tools"),
    ("system", "configure_timezone"),
    ("security", "configure_firewall"),
    ("security", "harden_ssh"),
    ("security", "install_fail2ban"),
    ("webserver", "install_nginx"),
    ("runtime", "install_php"),
    ("runtime", "install_nodejs"),
    ("database", "install_mysql"),
    ("agent", "install_agent"),
];

#[derive(Debug, thiserror::Error)]
pub enum ProvisioningError {
    #[error("Database error: {0}")]
    DbErr(#[from] DbErr),
    #[error("Unknown or already used provisioning token")]
    UnknownToken,
    #[error("Agent token is invalid")]
    InvalidAgentToken,
    #[error("Agent token has expired")]
    AgentTokenExpired,
    #[error("Server {0} not found")]
    ServerNotFound(i32),
    #[error("Provisioning step {0} not found")]
    StepNotFound(i32),
    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),
    #[error("Failed to queue provisioning job: {0}")]
    Job(#[from] JobError),
}

/// Facts the install script reports back when it registers the agent.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerFacts {
    pub ip_address: Option<String>,
    pub public_key: Option<String>,
    pub os_name: Option<String>,
    pub os_version: Option<String>,
    pub cpu_cores: Option<i32>,
    pub memory_mb: Option<i64>,
    pub disk_gb: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionRegistration {
    pub server_id: i32,
    pub agent_token: String,
    pub agent_token_expires_at: DateTime<Utc>,
    pub status: ServerStatus,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StepUpdate {
    pub status: StepStatus,
    pub error_message: Option<String>,
    pub duration_seconds: Option<i32>,
}

pub fn generate_token() -> String {
    hex::encode(rand::random::<[u8; 32]>())
}

/// Server status implied by the steps once one of them changes. `None` means
/// provisioning is still under way.
pub fn settled_status(steps: &[provisioning_step::Model]) -> Option<ServerStatus> {
    if steps.iter().any(|s| s.status == StepStatus::Failed) {
        Some(ServerStatus::Failed)
    } else if !steps.is_empty() && steps.iter().all(|s| s.status.is_done()) {
        Some(ServerStatus::Active)
    } else {
        None
    }
}

#[derive(Clone)]
pub struct ProvisioningService {
    db: Arc<DatabaseConnection>,
    jobs: JobQueue,
    agent_token_ttl_days: i64,
}

impl ProvisioningService {
    pub fn new(db: Arc<DatabaseConnection>, jobs: JobQueue, agent_token_ttl_days: i64) -> Self {
        Self {
            db,
            jobs,
            agent_token_ttl_days,
        }
    }

    async fn server(&self, server_id: i32) -> Result<server::Model, ProvisioningError> {
        server::Entity::find_by_id(server_id)
            .one(self.db.as_ref())
            .await?
            .ok_or(ProvisioningError::ServerNotFound(server_id))
    }

    pub async fn steps(&self, server_id: i32) -> Result<Vec<provisioning_step::Model>, ProvisioningError> {
        Ok(provisioning_step::Entity::find()
            .filter(provisioning_step::Column::ServerId.eq(server_id))
            .order_by_asc(provisioning_step::Column::SortOrder)
            .all(self.db.as_ref())
            .await?)
    }

    /// Creates the default plan for a server that has none yet.
    pub async fn seed_steps(&self, server_id: i32) -> Result<Vec<provisioning_step::Model>, ProvisioningError> {
        self.server(server_id).await?;
        let existing = self.steps(server_id).await?;
        if !existing.is_empty() {
            return Ok(existing);
        }

        let now = Utc::now();
        let steps = DEFAULT_PLAN
            .iter()
            .enumerate()
            .map(|(idx, (category, name))| provisioning_step::ActiveModel {
                server_id: Set(server_id),
                category: Set(category.to_string()),
                step_name: Set(name.to_string()),
                sort_order: Set(idx as i32 + 1),
                status: Set(StepStatus::Pending),
                error_message: Set(None),
                duration_seconds: Set(None),
                attempts: Set(0),
                started_at: Set(None),
                completed_at: Set(None),
                created_at: Set(now),
                updated_at: Set(now),
                ..Default::default()
            });
        provisioning_step::Entity::insert_many(steps).exec(self.db.as_ref()).await?;
        info!(server_id, steps = DEFAULT_PLAN.len(), "Provisioning plan created.");
        self.steps(server_id).await
    }

    pub async fn provision_callback(&self, token: &str, facts: ServerFacts) -> Result<ProvisionRegistration, ProvisioningError> {
        self.provision_callback_at(token, facts, Utc::now()).await
    }

    /// Consumes a one-time provisioning token, records the server's facts and
    /// issues its agent token.
    pub async fn provision_callback_at(
        &self,
        token: &str,
        facts: ServerFacts,
        now: DateTime<Utc>,
    ) -> Result<ProvisionRegistration, ProvisioningError> {
        let srv = server::Entity::find()
            .filter(server::Column::ProvisionToken.eq(token))
            .one(self.db.as_ref())
            .await?
            .ok_or(ProvisioningError::UnknownToken)?;

        let has_steps = !self.steps(srv.id).await?.is_empty();
        let status = match srv.status {
            ServerStatus::Pending if has_steps => srv.status.transition_to(ServerStatus::Provisioning)?,
            ServerStatus::Pending => srv.status.transition_to(ServerStatus::Active)?,
            other => other,
        };
        let agent_token = generate_token();
        let expires_at = now + Duration::days(self.agent_token_ttl_days.max(1));

        let mut update = server::Entity::update_many()
            .col_expr(server::Column::ProvisionToken, Expr::value(Option::<String>::None))
            .col_expr(server::Column::AgentToken, Expr::value(agent_token.clone()))
            .col_expr(server::Column::AgentTokenExpiresAt, Expr::value(expires_at))
            .col_expr(server::Column::Status, Expr::value(status))
            .col_expr(server::Column::LastHeartbeatAt, Expr::value(now))
            .col_expr(server::Column::UpdatedAt, Expr::value(now));
        if let Some(ip) = facts.ip_address {
            update = update.col_expr(server::Column::IpAddress, Expr::value(ip));
        }
        if let Some(key) = facts.public_key {
            update = update.col_expr(server::Column::PublicKey, Expr::value(key));
        }
        if let Some(os) = facts.os_name {
            update = update.col_expr(server::Column::OsName, Expr::value(os));
        }
        if let Some(version) = facts.os_version {
            update = update.col_expr(server::Column::OsVersion, Expr::value(version));
        }
        if let Some(cores) = facts.cpu_cores {
            update = update.col_expr(server::Column::CpuCores, Expr::value(cores));
        }
        if let Some(memory) = facts.memory_mb {
            update = update.col_expr(server::Column::MemoryMb, Expr::value(memory));
        }
        if let Some(disk) = facts.disk_gb {
            update = update.col_expr(server::Column::DiskGb, Expr::value(disk));
        }
        let written = update
            .filter(server::Column::Id.eq(srv.id))
            .filter(server::Column::ProvisionToken.eq(token))
            .exec(self.db.as_ref())
            .await?;
        if written.rows_affected == 0 {
            return Err(ProvisioningError::UnknownToken);
        }

        info!(server_id = srv.id, status = %status, "Agent registered through provisioning callback.");
        Ok(ProvisionRegistration {
            server_id: srv.id,
            agent_token,
            agent_token_expires_at: expires_at,
            status,
        })
    }

    /// Resolves a bearer token to its server, rejecting expired tokens.
    pub async fn authenticate_agent(&self, token: &str, now: DateTime<Utc>) -> Result<server::Model, ProvisioningError> {
        let srv = server::Entity::find()
            .filter(server::Column::AgentToken.eq(token))
            .one(self.db.as_ref())
            .await?
            .ok_or(ProvisioningError::InvalidAgentToken)?;
        match srv.agent_token_expires_at {
            Some(expires_at) if expires_at < now => Err(ProvisioningError::AgentTokenExpired),
            _ => Ok(srv),
        }
    }

    pub async fn update_step(
        &self,
        step_id: i32,
        server_id: i32,
        update: StepUpdate,
    ) -> Result<provisioning_step::Model, ProvisioningError> {
        self.update_step_at(step_id, server_id, update, Utc::now()).await
    }

    /// Moves a step along its state machine, then settles the server if the plan
    /// has finished or failed.
    pub async fn update_step_at(
        &self,
        step_id: i32,
        server_id: i32,
        update: StepUpdate,
        now: DateTime<Utc>,
    ) -> Result<provisioning_step::Model, ProvisioningError> {
        let step = provisioning_step::Entity::find_by_id(step_id)
            .one(self.db.as_ref())
            .await?
            .filter(|s| s.server_id == server_id)
            .ok_or(ProvisioningError::StepNotFound(step_id))?;
        let next = step.status.transition_to(update.status)?;
        let attempts = step.attempts;

        let mut active = step.into_active_model();
        active.status = Set(next);
        match next {
            StepStatus::InProgress => {
                active.started_at = Set(Some(now));
                active.attempts = Set(attempts + 1);
            }
            StepStatus::Completed | StepStatus::Skipped => {
                active.completed_at = Set(Some(now));
                active.error_message = Set(None);
            }
            StepStatus::Failed => {
                let message = update
                    .error_message
                    .filter(|m| !m.trim().is_empty())
                    .unwrap_or_else(|| "Step failed without an error message".to_string());
                active.error_message = Set(Some(message));
                active.completed_at = Set(Some(now));
            }
            StepStatus::Pending | StepStatus::Queued => {}
        }
        if update.duration_seconds.is_some() {
            active.duration_seconds = Set(update.duration_seconds);
        }
        active.updated_at = Set(now);
        let step = active.update(self.db.as_ref()).await?;

        self.settle_server(server_id, now).await?;
        Ok(step)
    }

    async fn settle_server(&self, server_id: i32, now: DateTime<Utc>) -> Result<(), ProvisioningError> {
        let steps = self.steps(server_id).await?;
        let Some(target) = settled_status(&steps) else {
            return Ok(());
        };
        let written = server::Entity::update_many()
            .col_expr(server::Column::Status, Expr::value(target))
            .col_expr(server::Column::UpdatedAt, Expr::value(now))
            .filter(server::Column::Id.eq(server_id))
            .filter(server::Column::Status.eq(ServerStatus::Provisioning))
            .exec(self.db.as_ref())
            .await?;
        if written.rows_affected > 0 {
            match target {
                ServerStatus::Failed => warn!(server_id, "Provisioning failed."),
                _ => info!(server_id, "Provisioning completed; server is active."),
            }
        }
        Ok(())
    }

    pub async fn retry_step(&self, step_id: i32) -> Result<provisioning_step::Model, ProvisioningError> {
        self.retry_step_at(step_id, Utc::now()).await
    }

    /// Re-runs a single failed step without touching the others.
    pub async fn retry_step_at(&self, step_id: i32, now: DateTime<Utc>) -> Result<provisioning_step::Model, ProvisioningError> {
        let step = provisioning_step::Entity::find_by_id(step_id)
            .one(self.db.as_ref())
            .await?
            .ok_or(ProvisioningError::StepNotFound(step_id))?;
        step.status.transition_to(StepStatus::Pending)?;
        let server_id = step.server_id;
        let (category, name) = (step.category.clone(), step.step_name.clone());

        let mut active = step.into_active_model();
        active.status = Set(StepStatus::Pending);
        active.error_message = Set(None);
        active.started_at = Set(None);
        active.completed_at = Set(None);
        active.updated_at = Set(now);
        let step = active.update(self.db.as_ref()).await?;

        server::Entity::update_many()
            .col_expr(server::Column::Status, Expr::value(ServerStatus::Provisioning))
            .col_expr(server::Column::UpdatedAt, Expr::value(now))
            .filter(server::Column::Id.eq(server_id))
            .filter(server::Column::Status.eq(ServerStatus::Failed))
            .exec(self.db.as_ref())
            .await?;

        self.jobs
            .enqueue_default(
                server_id,
                PROVISION_STEP,
                json!({ "step_id": step_id, "category": category, "step_name": name }),
            )
            .await?;
        info!(step_id, server_id, attempts = step.attempts, "Provisioning step queued for retry.");
        Ok(step)
    }
}
