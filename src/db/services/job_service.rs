use std::sync::Arc;

use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait,
    QueryFilter, QueryOrder, Set,
};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use crate::db::entities::agent_job;
use crate::db::enums::JobStatus;
use crate::db::services::job_handlers::HandlerRegistry;
use crate::events::{EventBus, FleetEvent};
use crate::state::TransitionError;

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Database error: {0}")]
    DbErr(#[from] DbErr),
    #[error("Job {0} not found")]
    NotFound(i32),
    #[error("Job {0} was cancelled")]
    Cancelled(i32),
    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),
}

/// Result of an agent trying to start a job.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    Claimed(agent_job::Model),
    /// Someone else started (or cancelled) the job first. The caller should treat
    /// it as handled and move on.
    AlreadyClaimed,
}

/// What an agent reports when a job finishes.
#[derive(Debug, Clone, Default)]
pub struct CompletionReport {
    pub success: bool,
    pub output: Option<String>,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
}

impl CompletionReport {
    /// Failed jobs always carry an error message and an exit code; successful jobs
    /// always carry an exit code.
    fn normalized(self) -> (JobStatus, Option<String>, Option<String>, i32) {
        if self.success {
            (JobStatus::Completed, self.output, self.error, self.exit_code.unwrap_or(0))
        } else {
            let exit_code = self.exit_code.unwrap_or(1);
            let error = self
                .error
                .filter(|e| !e.trim().is_empty())
                .unwrap_or_else(|| format!("Job failed with exit code {exit_code}"));
            (JobStatus::Failed, self.output, Some(error), exit_code)
        }
    }
}

/// Inserts a pending job on any connection, including inside a caller's transaction.
pub async fn insert_job<C: ConnectionTrait>(
    conn: &C,
    server_id: i32,
    job_type: &str,
    payload: JsonValue,
    priority: i32,
    now: DateTime<Utc>,
) -> Result<agent_job::Model, DbErr> {
    agent_job::ActiveModel {
        server_id: Set(server_id),
        job_type: Set(job_type.to_string()),
        payload: Set(payload),
        status: Set(JobStatus::Pending),
        output: Set(None),
        error: Set(None),
        exit_code: Set(None),
        retry_count: Set(0),
        priority: Set(priority),
        started_at: Set(None),
        completed_at: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(conn)
    .await
}

/// Jobs of `job_type` on `server_id` that are still pending, queued or running.
pub async fn find_in_flight<C: ConnectionTrait>(
    conn: &C,
    server_id: i32,
    job_type: &str,
) -> Result<Vec<agent_job::Model>, DbErr> {
    agent_job::Entity::find()
        .filter(agent_job::Column::ServerId.eq(server_id))
        .filter(agent_job::Column::JobType.eq(job_type))
        .filter(agent_job::Column::Status.is_in(JobStatus::in_flight()))
        .all(conn)
        .await
}

/// Whether an in-flight job of `job_type` already targets the entity whose id is
/// stored under `payload_key`.
pub async fn has_in_flight_for<C: ConnectionTrait>(
    conn: &C,
    server_id: i32,
    job_type: &str,
    payload_key: &str,
    target_id: i32,
) -> Result<bool, DbErr> {
    let jobs = find_in_flight(conn, server_id, job_type).await?;
    Ok(jobs
        .iter()
        .any(|job| job.payload.get(payload_key).and_then(JsonValue::as_i64) == Some(i64::from(target_id))))
}

/// The agent-facing job queue.
#[derive(Clone)]
pub struct JobQueue {
    db: Arc<DatabaseConnection>,
    events: EventBus,
    handlers: Arc<HandlerRegistry>,
    default_priority: i32,
}

impl JobQueue {
    pub fn new(
        db: Arc<DatabaseConnection>,
        events: EventBus,
        handlers: Arc<HandlerRegistry>,
        default_priority: i32,
    ) -> Self {
        Self {
            db,
            events,
            handlers,
            default_priority,
        }
    }

    pub fn default_priority(&self) -> i32 {
        self.default_priority
    }

    pub async fn enqueue(
        &self,
        server_id: i32,
        job_type: &str,
        payload: JsonValue,
        priority: i32,
    ) -> Result<agent_job::Model, JobError> {
        let job = insert_job(self.db.as_ref(), server_id, job_type, payload, priority, Utc::now()).await?;
        info!(job_id = job.id, server_id, job_type, priority, "Job enqueued.");
        self.announce_created(&job);
        Ok(job)
    }

    pub async fn enqueue_default(
        &self,
        server_id: i32,
        job_type: &str,
        payload: JsonValue,
    ) -> Result<agent_job::Model, JobError> {
        self.enqueue(server_id, job_type, payload, self.default_priority).await
    }

    /// Publishes the creation of a job inserted through [`insert_job`].
    pub fn announce_created(&self, job: &agent_job::Model) {
        self.events.emit(FleetEvent::JobStatusChanged {
            job_id: job.id,
            server_id: job.server_id,
            job_type: job.job_type.clone(),
            from: None,
            to: job.status,
        });
    }

    pub async fn get(&self, job_id: i32) -> Result<agent_job::Model, JobError> {
        agent_job::Entity::find_by_id(job_id)
            .one(self.db.as_ref())
            .await?
            .ok_or(JobError::NotFound(job_id))
    }

    /// Loads a job only if it belongs to `server_id`. A job of another server is
    /// reported as missing.
    pub async fn get_for_server(&self, job_id: i32, server_id: i32) -> Result<agent_job::Model, JobError> {
        let job = self.get(job_id).await?;
        if job.server_id != server_id {
            return Err(JobError::NotFound(job_id));
        }
        Ok(job)
    }

    pub async fn fetch_pending(&self, server_id: i32) -> Result<Vec<agent_job::Model>, JobError> {
        self.fetch_pending_at(server_id, Utc::now()).await
    }

    /// Returns every job the agent may still start, most urgent first, and marks
    /// the newly delivered ones as queued. Nothing is claimed here.
    pub async fn fetch_pending_at(
        &self,
        server_id: i32,
        now: DateTime<Utc>,
    ) -> Result<Vec<agent_job::Model>, JobError> {
        let mut jobs = agent_job::Entity::find()
            .filter(agent_job::Column::ServerId.eq(server_id))
            .filter(agent_job::Column::Status.is_in(JobStatus::claimable()))
            .order_by_asc(agent_job::Column::Priority)
            .order_by_asc(agent_job::Column::CreatedAt)
            .order_by_asc(agent_job::Column::Id)
            .all(self.db.as_ref())
            .await?;

        let newly_delivered: Vec<i32> = jobs
            .iter()
            .filter(|j| j.status == JobStatus::Pending)
            .map(|j| j.id)
            .collect();

        if !newly_delivered.is_empty() {
            agent_job::Entity::update_many()
                .col_expr(agent_job::Column::Status, Expr::value(JobStatus::Queued))
                .col_expr(agent_job::Column::UpdatedAt, Expr::value(now))
                .filter(agent_job::Column::Id.is_in(newly_delivered.clone()))
                .filter(agent_job::Column::Status.eq(JobStatus::Pending))
                .exec(self.db.as_ref())
                .await?;

            for job in jobs.iter_mut().filter(|j| newly_delivered.contains(&j.id)) {
                job.status = JobStatus::Queued;
                job.updated_at = now;
                self.events.emit(FleetEvent::JobStatusChanged {
                    job_id: job.id,
                    server_id,
                    job_type: job.job_type.clone(),
                    from: Some(JobStatus::Pending),
                    to: JobStatus::Queued,
                });
            }
        }

        debug!(server_id, count = jobs.len(), "Delivered pending jobs to agent.");
        Ok(jobs)
    }

    pub async fn claim(&self, job_id: i32, server_id: i32) -> Result<ClaimOutcome, JobError> {
        self.claim_at(job_id, server_id, Utc::now()).await
    }

    /// Atomically moves a pending or queued job to running. Exactly one of several
    /// concurrent callers wins; the rest get [`ClaimOutcome::AlreadyClaimed`].
    pub async fn claim_at(
        &self,
        job_id: i32,
        server_id: i32,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, JobError> {
        let observed = self.get_for_server(job_id, server_id).await?;
        if !JobStatus::claimable().contains(&observed.status) {
            debug!(job_id, status = %observed.status, "Claim refused, job is no longer claimable.");
            return Ok(ClaimOutcome::AlreadyClaimed);
        }

        let result = agent_job::Entity::update_many()
            .col_expr(agent_job::Column::Status, Expr::value(JobStatus::Running))
            .col_expr(agent_job::Column::StartedAt, Expr::value(now))
            .col_expr(agent_job::Column::UpdatedAt, Expr::value(now))
            .filter(agent_job::Column::Id.eq(job_id))
            .filter(agent_job::Column::ServerId.eq(server_id))
            .filter(agent_job::Column::Status.is_in(JobStatus::claimable()))
            .exec(self.db.as_ref())
            .await?;

        if result.rows_affected == 0 {
            debug!(job_id, server_id, "Claim lost to a concurrent caller.");
            return Ok(ClaimOutcome::AlreadyClaimed);
        }

        let job = self.get(job_id).await?;
        info!(job_id, server_id, job_type = %job.job_type, "Job claimed by agent.");
        self.events.emit(FleetEvent::JobStatusChanged {
            job_id,
            server_id,
            job_type: job.job_type.clone(),
            from: Some(observed.status),
            to: JobStatus::Running,
        });
        Ok(ClaimOutcome::Claimed(job))
    }

    pub async fn report_completion(
        &self,
        job_id: i32,
        server_id: i32,
        report: CompletionReport,
    ) -> Result<agent_job::Model, JobError> {
        self.report_completion_at(job_id, server_id, report, Utc::now()).await
    }

    /// Records the outcome of a running job and runs the side effect registered
    /// for its type. A handler failure is logged and leaves the completion intact.
    pub async fn report_completion_at(
        &self,
        job_id: i32,
        server_id: i32,
        report: CompletionReport,
        now: DateTime<Utc>,
    ) -> Result<agent_job::Model, JobError> {
        let current = self.get_for_server(job_id, server_id).await?;
        if current.status == JobStatus::Cancelled {
            return Err(JobError::Cancelled(job_id));
        }

        let (target, output, error, exit_code) = report.normalized();
        current.status.transition_to(target)?;

        let result = agent_job::Entity::update_many()
            .col_expr(agent_job::Column::Status, Expr::value(target))
            .col_expr(agent_job::Column::Output, Expr::value(output))
            .col_expr(agent_job::Column::Error, Expr::value(error))
            .col_expr(agent_job::Column::ExitCode, Expr::value(exit_code))
            .col_expr(agent_job::Column::CompletedAt, Expr::value(now))
            .col_expr(agent_job::Column::UpdatedAt, Expr::value(now))
            .filter(agent_job::Column::Id.eq(job_id))
            .filter(agent_job::Column::Status.eq(JobStatus::Running))
            .exec(self.db.as_ref())
            .await?;

        if result.rows_affected == 0 {
            let latest = self.get(job_id).await?;
            if latest.status == JobStatus::Cancelled {
                return Err(JobError::Cancelled(job_id));
            }
            return Err(lost_race(latest.status, target));
        }

        let job = self.get(job_id).await?;
        info!(
            job_id,
            server_id,
            job_type = %job.job_type,
            status = %job.status,
            exit_code = ?job.exit_code,
            "Job finished."
        );
        self.events.emit(FleetEvent::JobStatusChanged {
            job_id,
            server_id,
            job_type: job.job_type.clone(),
            from: Some(JobStatus::Running),
            to: target,
        });

        self.handlers.dispatch(self.db.as_ref(), &job).await;
        Ok(job)
    }

    pub async fn cancel(&self, job_id: i32) -> Result<agent_job::Model, JobError> {
        self.cancel_at(job_id, Utc::now()).await
    }

    /// Cancels a job that has not finished. A running job only stops once its agent
    /// polls the status endpoint.
    pub async fn cancel_at(&self, job_id: i32, now: DateTime<Utc>) -> Result<agent_job::Model, JobError> {
        let current = self.get(job_id).await?;
        current.status.transition_to(JobStatus::Cancelled)?;

        let result = agent_job::Entity::update_many()
            .col_expr(agent_job::Column::Status, Expr::value(JobStatus::Cancelled))
            .col_expr(agent_job::Column::CompletedAt, Expr::value(now))
            .col_expr(agent_job::Column::UpdatedAt, Expr::value(now))
            .filter(agent_job::Column::Id.eq(job_id))
            .filter(agent_job::Column::Status.is_in(JobStatus::in_flight()))
            .exec(self.db.as_ref())
            .await?;

        if result.rows_affected == 0 {
            let latest = self.get(job_id).await?;
            return Err(lost_race(latest.status, JobStatus::Cancelled));
        }

        if current.status == JobStatus::Running {
            warn!(job_id, server_id = current.server_id, "Running job cancelled; agent will stop at its next status poll.");
        } else {
            info!(job_id, server_id = current.server_id, "Job cancelled.");
        }
        self.events.emit(FleetEvent::JobStatusChanged {
            job_id,
            server_id: current.server_id,
            job_type: current.job_type.clone(),
            from: Some(current.status),
            to: JobStatus::Cancelled,
        });
        self.get(job_id).await
    }

    pub async fn retry(&self, job_id: i32) -> Result<agent_job::Model, JobError> {
        self.retry_at(job_id, Utc::now()).await
    }

    /// Puts a failed job back in the queue with its results cleared.
    pub async fn retry_at(&self, job_id: i32, now: DateTime<Utc>) -> Result<agent_job::Model, JobError> {
        let current = self.get(job_id).await?;
        current.status.transition_to(JobStatus::Pending)?;

        let result = agent_job::Entity::update_many()
            .col_expr(agent_job::Column::Status, Expr::value(JobStatus::Pending))
            .col_expr(
                agent_job::Column::RetryCount,
                Expr::col(agent_job::Column::RetryCount).add(1),
            )
            .col_expr(agent_job::Column::Output, Expr::value(Option::<String>::None))
            .col_expr(agent_job::Column::Error, Expr::value(Option::<String>::None))
            .col_expr(agent_job::Column::ExitCode, Expr::value(Option::<i32>::None))
            .col_expr(agent_job::Column::StartedAt, Expr::value(Option::<DateTime<Utc>>::None))
            .col_expr(agent_job::Column::CompletedAt, Expr::value(Option::<DateTime<Utc>>::None))
            .col_expr(agent_job::Column::UpdatedAt, Expr::value(now))
            .filter(agent_job::Column::Id.eq(job_id))
            .filter(agent_job::Column::Status.eq(JobStatus::Failed))
            .exec(self.db.as_ref())
            .await?;

        if result.rows_affected == 0 {
            let latest = self.get(job_id).await?;
            return Err(lost_race(latest.status, JobStatus::Pending));
        }

        let job = self.get(job_id).await?;
        info!(job_id, retry_count = job.retry_count, "Job re-queued for retry.");
        self.events.emit(FleetEvent::JobStatusChanged {
            job_id,
            server_id: job.server_id,
            job_type: job.job_type.clone(),
            from: Some(JobStatus::Failed),
            to: JobStatus::Pending,
        });
        Ok(job)
    }
}

/// Error for a guarded update that matched no row because the job moved on
/// between our read and our write.
fn lost_race(latest: JobStatus, target: JobStatus) -> JobError {
    match latest.transition_to(target) {
        Err(e) => JobError::InvalidTransition(e),
        Ok(_) => JobError::InvalidTransition(TransitionError {
            entity: "job",
            from: latest.to_string(),
            to: target.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_report_without_details_gets_synthesized_error() {
        let (status, _, error, code) = CompletionReport {
            success: false,
            ..Default::default()
        }
        .normalized();
        assert_eq!(status, JobStatus::Failed);
        assert_eq!(code, 1);
        assert_eq!(error.as_deref(), Some("Job failed with exit code 1"));
    }

    #[test]
    fn failed_report_with_blank_error_uses_exit_code() {
        let (_, _, error, code) = CompletionReport {
            success: false,
            error: Some("  ".into()),
            exit_code: Some(127),
            ..Default::default()
        }
        .normalized();
        assert_eq!(code, 127);
        assert_eq!(error.as_deref(), Some("Job failed with exit code 127"));
    }

    #[test]
    fn successful_report_defaults_exit_code_to_zero() {
        let (status, output, error, code) = CompletionReport {
            success: true,
            output: Some("ok".into()),
            ..Default::default()
        }
        .normalized();
        assert_eq!(status, JobStatus::Completed);
        assert_eq!(output.as_deref(), Some("ok"));
        assert_eq!(error, None);
        assert_eq!(code, 0);
    }
}
