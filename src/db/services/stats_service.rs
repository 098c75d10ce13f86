use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sea_orm::{ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter};
use tracing::info;

use crate::db::entities::{monitor_check, server_stat, service_stat};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PruneReport {
    pub server_stats: u64,
    pub service_stats: u64,
    pub monitor_checks: u64,
}

/// Deletes time-series rows past their retention.
#[derive(Clone)]
pub struct StatsRetention {
    db: Arc<DatabaseConnection>,
    stats_retention: Duration,
    service_stats_retention: Duration,
}

impl StatsRetention {
    pub fn new(db: Arc<DatabaseConnection>, stats_retention_days: i64, service_stats_retention_hours: i64) -> Self {
        Self {
            db,
            stats_retention: Duration::days(stats_retention_days),
            service_stats_retention: Duration::hours(service_stats_retention_hours),
        }
    }

    /// Server resource samples and monitor check history.
    pub async fn cleanup_stats_at(&self, now: DateTime<Utc>) -> Result<PruneReport, DbErr> {
        let cutoff = now - self.stats_retention;
        let server_stats = server_stat::Entity::delete_many()
            .filter(server_stat::Column::RecordedAt.lt(cutoff))
            .exec(self.db.as_ref())
            .await?
            .rows_affected;
        let monitor_checks = monitor_check::Entity::delete_many()
            .filter(monitor_check::Column::CheckedAt.lt(cutoff))
            .exec(self.db.as_ref())
            .await?
            .rows_affected;

        info!(server_stats, monitor_checks, cutoff = %cutoff, "Pruned old stats.");
        Ok(PruneReport {
            server_stats,
            monitor_checks,
            ..Default::default()
        })
    }

    /// Per-service samples are much denser, so they are kept for hours instead of days.
    pub async fn prune_service_stats_at(&self, now: DateTime<Utc>) -> Result<PruneReport, DbErr> {
        let cutoff = now - self.service_stats_retention;
        let service_stats = service_stat::Entity::delete_many()
            .filter(service_stat::Column::RecordedAt.lt(cutoff))
            .exec(self.db.as_ref())
            .await?
            .rows_affected;

        info!(service_stats, cutoff = %cutoff, "Pruned old service stats.");
        Ok(PruneReport {
            service_stats,
            ..Default::default()
        })
    }
}
