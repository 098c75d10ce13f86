use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use cron::Schedule;
use sea_orm::sea_query::{Condition, Expr};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, Set,
    TransactionTrait,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::db::entities::{backup_schedule, server};
use crate::db::services::job_handlers::DATABASE_BACKUP;
use crate::db::services::job_service::{JobQueue, insert_job};

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("Database error: {0}")]
    DbErr(#[from] DbErr),
    #[error("Invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },
    #[error("Server {0} not found")]
    ServerNotFound(i32),
}

/// Shifts one day-of-week atom from the 0-6 (Sunday = 0 or 7) convention to the
/// 1-7 (Sunday = 1) one the scheduler parses.
fn shift_dow_atom(atom: &str) -> String {
    let (base, step) = match atom.split_once('/') {
        Some((base, step)) => (base, Some(step)),
        None => (atom, None),
    };
    let shifted = match base.split_once('-') {
        Some((from, to)) => match (from.parse::<u8>(), to.parse::<u8>()) {
            (Ok(from), Ok(7)) if step.is_none() && from > 0 => format!("{}-7,1", from + 1),
            (Ok(from), Ok(to)) => format!("{}-{}", from + 1, (to + 1).min(7)),
            _ => base.to_string(),
        },
        None => match base.parse::<u8>() {
            Ok(0) | Ok(7) => "1".to_string(),
            Ok(day) => (day + 1).to_string(),
            Err(_) => base.to_string(),
        },
    };
    match step {
        Some(step) => format!("{shifted}/{step}"),
        None => shifted,
    }
}

/// Accepts classic five-field crontab syntax as well as the six or seven field
/// form with leading seconds.
pub fn normalize_cron(expr: &str) -> String {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return fields.join(" ");
    }
    let dow = fields[4].split(',').map(shift_dow_atom).collect::<Vec<_>>().join(",");
    format!("0 {} {} {} {} {}", fields[0], fields[1], fields[2], fields[3], dow)
}

pub fn parse_schedule(expr: &str) -> Result<Schedule, BackupError> {
    Schedule::from_str(&normalize_cron(expr)).map_err(|e| BackupError::InvalidCron {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

pub fn next_run_after(expr: &str, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, BackupError> {
    Ok(parse_schedule(expr)?.after(&after).next())
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewBackupSchedule {
    pub server_id: i32,
    pub database_name: String,
    pub database_type: String,
    pub cron_expression: String,
    #[serde(default = "default_retention")]
    pub retention_count: i32,
}

fn default_retention() -> i32 {
    7
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BackupSweepReport {
    pub queued: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct BackupScheduler {
    db: Arc<DatabaseConnection>,
    jobs: JobQueue,
}

impl BackupScheduler {
    pub fn new(db: Arc<DatabaseConnection>, jobs: JobQueue) -> Self {
        Self { db, jobs }
    }

    pub async fn create_schedule(&self, new: NewBackupSchedule) -> Result<backup_schedule::Model, BackupError> {
        self.create_schedule_at(new, Utc::now()).await
    }

    pub async fn create_schedule_at(
        &self,
        new: NewBackupSchedule,
        now: DateTime<Utc>,
    ) -> Result<backup_schedule::Model, BackupError> {
        let next_run_at = next_run_after(&new.cron_expression, now)?;
        server::Entity::find_by_id(new.server_id)
            .one(self.db.as_ref())
            .await?
            .ok_or(BackupError::ServerNotFound(new.server_id))?;

        let schedule = backup_schedule::ActiveModel {
            server_id: Set(new.server_id),
            database_name: Set(new.database_name),
            database_type: Set(new.database_type),
            cron_expression: Set(new.cron_expression.trim().to_string()),
            is_active: Set(true),
            retention_count: Set(new.retention_count.max(1)),
            last_run_at: Set(None),
            next_run_at: Set(next_run_at),
            last_status: Set(None),
            last_job_id: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(self.db.as_ref())
        .await?;
        info!(schedule_id = schedule.id, server_id = schedule.server_id, next_run_at = ?schedule.next_run_at, "Backup schedule created.");
        Ok(schedule)
    }

    pub async fn sweep(&self) -> Result<BackupSweepReport, DbErr> {
        self.sweep_at(None, Utc::now()).await
    }

    /// Queues a backup job for every active schedule whose next run has arrived.
    pub async fn sweep_at(&self, only_schedule: Option<i32>, now: DateTime<Utc>) -> Result<BackupSweepReport, DbErr> {
        let mut query = backup_schedule::Entity::find()
            .filter(backup_schedule::Column::IsActive.eq(true))
            .filter(
                Condition::any()
                    .add(backup_schedule::Column::NextRunAt.is_null())
                    .add(backup_schedule::Column::NextRunAt.lte(now)),
            );
        if let Some(id) = only_schedule {
            query = query.filter(backup_schedule::Column::Id.eq(id));
        }

        let mut report = BackupSweepReport::default();
        for schedule in query.all(self.db.as_ref()).await? {
            let next_run_at = match next_run_after(&schedule.cron_expression, now) {
                Ok(next) => next,
                Err(e) => {
                    warn!(schedule_id = schedule.id, error = %e, "Skipping backup schedule with a bad cron expression.");
                    report.failed += 1;
                    continue;
                }
            };
            match self.queue_backup(&schedule, next_run_at, now).await {
                Ok(true) => report.queued += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    error!(schedule_id = schedule.id, error = %e, "Failed to queue database backup.");
                    report.failed += 1;
                }
            }
        }

        info!(queued = report.queued, failed = report.failed, "Database backup sweep finished.");
        Ok(report)
    }

    async fn queue_backup(
        &self,
        schedule: &backup_schedule::Model,
        next_run_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<bool, DbErr> {
        let txn = self.db.begin().await?;
        let job = insert_job(
            &txn,
            schedule.server_id,
            DATABASE_BACKUP,
            json!({
                "schedule_id": schedule.id,
                "database_name": schedule.database_name,
                "database_type": schedule.database_type,
                "retention_count": schedule.retention_count,
            }),
            self.jobs.default_priority(),
            now,
        )
        .await?;

        // Guarded on the row still being due so two sweepers never double-fire.
        let due = match schedule.next_run_at {
            Some(at) => backup_schedule::Column::NextRunAt.eq(at),
            None => backup_schedule::Column::NextRunAt.is_null(),
        };
        let written = backup_schedule::Entity::update_many()
            .col_expr(backup_schedule::Column::LastRunAt, Expr::value(now))
            .col_expr(backup_schedule::Column::NextRunAt, Expr::value(next_run_at))
            .col_expr(backup_schedule::Column::LastJobId, Expr::value(job.id))
            .col_expr(backup_schedule::Column::LastStatus, Expr::value("queued"))
            .col_expr(backup_schedule::Column::UpdatedAt, Expr::value(now))
            .filter(backup_schedule::Column::Id.eq(schedule.id))
            .filter(due)
            .exec(&txn)
            .await?;
        if written.rows_affected == 0 {
            txn.rollback().await?;
            debug!(schedule_id = schedule.id, "Backup schedule already fired elsewhere.");
            return Ok(false);
        }
        txn.commit().await?;
        self.jobs.announce_created(&job);

        info!(
            schedule_id = schedule.id,
            server_id = schedule.server_id,
            job_id = job.id,
            next_run_at = ?next_run_at,
            "Database backup queued."
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike, Weekday};

    #[test]
    fn five_field_expressions_get_seconds() {
        assert_eq!(normalize_cron("30 2 * * *"), "0 30 2 * * *");
        assert_eq!(normalize_cron("0 0 30 2 * * *"), "0 0 30 2 * * *");
    }

    #[test]
    fn day_of_week_is_shifted() {
        assert_eq!(normalize_cron("0 3 * * 0"), "0 0 3 * * 1");
        assert_eq!(normalize_cron("0 3 * * 7"), "0 0 3 * * 1");
        assert_eq!(normalize_cron("0 3 * * 1-5"), "0 0 3 * * 2-6");
        assert_eq!(normalize_cron("0 3 * * 5-7"), "0 0 3 * * 6-7,1");
        assert_eq!(normalize_cron("0 3 * * */2"), "0 0 3 * * */2");
        assert_eq!(normalize_cron("0 3 * * MON"), "0 0 3 * * MON");
    }

    #[test]
    fn next_run_is_computed_in_utc() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let next = next_run_after("30 2 * * *", now).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 2, 2, 30, 0).unwrap());

        // 2024-05-01 is a Wednesday; "0" means Sunday.
        let sunday = next_run_after("0 4 * * 0", now).unwrap().unwrap();
        assert_eq!(sunday.weekday(), Weekday::Sun);
        assert_eq!(sunday.hour(), 4);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            parse_schedule("every day at noon"),
            Err(BackupError::InvalidCron { .. })
        ));
    }
}
