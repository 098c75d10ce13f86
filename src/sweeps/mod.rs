//! One-shot sweeps over the fleet. The in-process scheduler and the
//! `fleet-sweep` CLI both go through [`crate::scheduler::run_leased`], so a
//! sweep never overlaps another run of the same kind.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sea_orm::DbErr;
use tracing::{error, info};

use crate::db::services::StatsRetention;
use crate::db::services::backup_service::BackupSweepReport;
use crate::db::services::firewall_service::FirewallError;
use crate::db::services::heartbeat_service::{HeartbeatError, StaleServerReport};
use crate::db::services::monitor_service::{MonitorError, MonitorSweepReport};
use crate::db::services::node_app_service::{NodeAppError, NodeAppSweepReport};
use crate::db::services::ssl_service::SslRenewalReport;
use crate::db::services::stats_service::PruneReport;
use crate::scheduler::{TickOutcome, run_leased};
use crate::server::config::SchedulerConfig;
use crate::server::core_services::CoreServices;

pub const EXIT_OK: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SweepKind {
    Monitors,
    NodeApps,
    Heartbeats,
    FirewallRollback,
    SslRenewal,
    StatsCleanup,
    ServiceStatsPrune,
    DatabaseBackups,
}

impl SweepKind {
    pub const ALL: [SweepKind; 8] = [
        SweepKind::Monitors,
        SweepKind::NodeApps,
        SweepKind::Heartbeats,
        SweepKind::FirewallRollback,
        SweepKind::SslRenewal,
        SweepKind::StatsCleanup,
        SweepKind::ServiceStatsPrune,
        SweepKind::DatabaseBackups,
    ];

    /// Also the lease name guarding the sweep.
    pub fn as_str(self) -> &'static str {
        match self {
            SweepKind::Monitors => "monitors",
            SweepKind::NodeApps => "node-apps",
            SweepKind::Heartbeats => "heartbeats",
            SweepKind::FirewallRollback => "firewall-rollback",
            SweepKind::SslRenewal => "ssl-renewal",
            SweepKind::StatsCleanup => "stats-cleanup",
            SweepKind::ServiceStatsPrune => "service-stats-prune",
            SweepKind::DatabaseBackups => "database-backups",
        }
    }

    pub fn interval(self, config: &SchedulerConfig) -> Duration {
        let secs = match self {
            SweepKind::Monitors => config.monitors_interval_secs,
            SweepKind::NodeApps => config.node_apps_interval_secs,
            SweepKind::Heartbeats => config.heartbeats_interval_secs,
            SweepKind::FirewallRollback => config.firewall_rollback_interval_secs,
            SweepKind::SslRenewal => config.ssl_renewal_interval_secs,
            SweepKind::StatsCleanup => config.stats_cleanup_interval_secs,
            SweepKind::ServiceStatsPrune => config.service_stats_prune_interval_secs,
            SweepKind::DatabaseBackups => config.database_backups_interval_secs,
        };
        Duration::from_secs(secs.max(1))
    }
}

impl fmt::Display for SweepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SweepKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SweepKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown sweep '{s}'"))
    }
}

/// Narrows a sweep to one target or replaces a configured limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepOverrides {
    pub target_id: Option<i32>,
    pub threshold_minutes: Option<i64>,
    pub days: Option<i64>,
    pub hours: Option<i64>,
}

#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error("Database error: {0}")]
    DbErr(#[from] DbErr),
    #[error(transparent)]
    Heartbeat(#[from] HeartbeatError),
    #[error(transparent)]
    Monitor(#[from] MonitorError),
    #[error(transparent)]
    Firewall(#[from] FirewallError),
    #[error(transparent)]
    NodeApp(#[from] NodeAppError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SweepReport {
    Monitors(MonitorSweepReport),
    NodeApps(NodeAppSweepReport),
    Heartbeats(StaleServerReport),
    FirewallRollback { rolled_back: Vec<i32> },
    SslRenewal(SslRenewalReport),
    Pruned(PruneReport),
    DatabaseBackups(BackupSweepReport),
}

pub async fn run_sweep(
    services: &CoreServices,
    kind: SweepKind,
    overrides: SweepOverrides,
) -> Result<SweepReport, SweepError> {
    run_sweep_at(services, kind, overrides, Utc::now()).await
}

pub async fn run_sweep_at(
    services: &CoreServices,
    kind: SweepKind,
    overrides: SweepOverrides,
    now: DateTime<Utc>,
) -> Result<SweepReport, SweepError> {
    let config = &services.config;
    let target = overrides.target_id;

    let report = match kind {
        SweepKind::Monitors => SweepReport::Monitors(services.monitors.sweep_at(target, now).await?),
        SweepKind::NodeApps => SweepReport::NodeApps(services.node_apps.sweep_at(target, now).await?),
        SweepKind::Heartbeats => {
            let threshold = overrides
                .threshold_minutes
                .unwrap_or(config.heartbeat.offline_threshold_minutes);
            SweepReport::Heartbeats(services.heartbeats.check_stale_servers_at(threshold, target, now).await?)
        }
        SweepKind::FirewallRollback => {
            let rules = services.firewall.rollback_expired_rules_at(target, now).await?;
            SweepReport::FirewallRollback {
                rolled_back: rules.into_iter().map(|rule| rule.id).collect(),
            }
        }
        SweepKind::SslRenewal => SweepReport::SslRenewal(services.ssl.sweep_at(target, now).await?),
        SweepKind::StatsCleanup => {
            let retention = match overrides.days {
                Some(days) => StatsRetention::new(
                    services.db.clone(),
                    days,
                    config.retention.service_stats_retention_hours,
                ),
                None => services.stats.clone(),
            };
            SweepReport::Pruned(retention.cleanup_stats_at(now).await?)
        }
        SweepKind::ServiceStatsPrune => {
            let retention = match overrides.hours {
                Some(hours) => StatsRetention::new(services.db.clone(), config.retention.stats_retention_days, hours),
                None => services.stats.clone(),
            };
            SweepReport::Pruned(retention.prune_service_stats_at(now).await?)
        }
        SweepKind::DatabaseBackups => SweepReport::DatabaseBackups(services.backups.sweep_at(target, now).await?),
    };
    Ok(report)
}

/// Runs a sweep under its lease and turns the result into a process exit code.
/// A run skipped because another process holds the lease still exits cleanly.
/// Per-target failures are part of the report; only an aborted sweep fails.
pub async fn run_sweep_for_exit(services: &CoreServices, kind: SweepKind, overrides: SweepOverrides) -> i32 {
    match run_leased(services, kind, overrides).await {
        TickOutcome::Ran(report) => {
            info!(sweep = %kind, report = ?report, "Sweep completed.");
            EXIT_OK
        }
        TickOutcome::Skipped => {
            info!(sweep = %kind, "Another run of this sweep is in progress; skipped.");
            EXIT_OK
        }
        TickOutcome::Failed(e) => {
            error!(sweep = %kind, error = %e, "Sweep failed.");
            EXIT_FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip_through_from_str() {
        for kind in SweepKind::ALL {
            assert_eq!(kind.as_str().parse::<SweepKind>(), Ok(kind));
        }
        assert!("everything".parse::<SweepKind>().is_err());
    }

    #[test]
    fn intervals_follow_config() {
        let config = SchedulerConfig::default();
        assert_eq!(SweepKind::FirewallRollback.interval(&config), Duration::from_secs(30));
        assert_eq!(SweepKind::SslRenewal.interval(&config), Duration::from_secs(6 * 60 * 60));
        assert_eq!(SweepKind::DatabaseBackups.interval(&config), Duration::from_secs(60));
    }
}
