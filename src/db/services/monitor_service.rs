use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::StreamExt;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, QuerySelect, Set,
    TransactionTrait,
};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::db::entities::{health_monitor, monitor_check};
use crate::db::enums::{MonitorStatus, MonitorType};
use crate::events::{EventBus, FleetEvent};
use crate::monitoring::probe::{self, ProbeResult};
use crate::state::{MonitorCounters, MonitorTransition};

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("Database error: {0}")]
    DbErr(#[from] DbErr),
    #[error("Monitor {0} not found")]
    NotFound(i32),
    #[error("Unknown heartbeat token")]
    UnknownHeartbeatToken,
    #[error("Invalid monitor: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another check of the same monitor is running in this process.
    InFlight,
    /// The monitor changed while we probed; our result was dropped.
    StaleVersion,
    Paused,
    NotDue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    Recorded {
        status: MonitorStatus,
        success: bool,
        transition: Option<MonitorTransition>,
    },
    Skipped(SkipReason),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MonitorSweepReport {
    pub checked: usize,
    pub up: usize,
    pub down: usize,
    pub skipped: usize,
    pub errors: usize,
    pub uptime_recalculated: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct UptimeStats {
    pub uptime_24h: Option<f64>,
    pub uptime_7d: Option<f64>,
    pub uptime_30d: Option<f64>,
    pub avg_response_time_ms: Option<f64>,
}

/// Fields an operator supplies when creating a monitor.
#[derive(Debug, Clone, Deserialize)]
pub struct NewMonitor {
    pub team_id: i32,
    pub server_id: Option<i32>,
    pub name: String,
    pub monitor_type: MonitorType,
    #[serde(default)]
    pub check_target: String,
    pub http_method: Option<String>,
    pub expected_status: Option<i32>,
    pub expected_content: Option<String>,
    pub interval_seconds: Option<i32>,
    pub timeout_seconds: Option<i32>,
    pub failure_threshold: Option<i32>,
    pub recovery_threshold: Option<i32>,
    pub ssl_expiry_days_warning: Option<i32>,
}

#[derive(Debug, Clone, Copy)]
pub struct MonitorSettings {
    pub heartbeat_grace_multiplier: f64,
    pub concurrency: usize,
    pub uptime_recalc_interval_secs: i64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            heartbeat_grace_multiplier: 1.5,
            concurrency: 16,
            uptime_recalc_interval_secs: 300,
        }
    }
}

/// Removes its monitor from the in-flight set when dropped.
struct InFlightGuard {
    map: Arc<DashMap<i32, ()>>,
    monitor_id: i32,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.map.remove(&self.monitor_id);
    }
}

/// Whether a monitor should be probed at `now`.
pub fn is_due(monitor: &health_monitor::Model, now: DateTime<Utc>) -> bool {
    if !monitor.is_active || monitor.status == MonitorStatus::Paused {
        return false;
    }
    match monitor.last_check_at {
        None => true,
        Some(last) => now - last >= Duration::seconds(i64::from(monitor.interval_seconds.max(1))),
    }
}

/// A heartbeat monitor is overdue once no ping arrived within
/// `interval * grace_multiplier`, counted from creation if it never pinged.
pub fn heartbeat_overdue(monitor: &health_monitor::Model, now: DateTime<Utc>, grace_multiplier: f64) -> bool {
    let since = monitor.last_heartbeat_ping_at.unwrap_or(monitor.created_at);
    let grace_ms = (f64::from(monitor.interval_seconds.max(1)) * grace_multiplier.max(1.0) * 1000.0) as i64;
    now - since > Duration::milliseconds(grace_ms)
}

/// Uptime percentages over 24h/7d/30d and the mean response time of successful
/// checks in the last 24h. Windows without checks yield `None`.
pub fn compute_uptime(checks: &[(DateTime<Utc>, bool, Option<i32>)], now: DateTime<Utc>) -> UptimeStats {
    let window = |days: i64| {
        let since = now - Duration::days(days);
        let (total, ok) = checks
            .iter()
            .filter(|(at, _, _)| *at >= since)
            .fold((0u32, 0u32), |(total, ok), (_, success, _)| (total + 1, ok + u32::from(*success)));
        (total > 0).then(|| f64::from(ok) * 100.0 / f64::from(total))
    };

    let day_ago = now - Duration::days(1);
    let times: Vec<f64> = checks
        .iter()
        .filter(|(at, success, _)| *success && *at >= day_ago)
        .filter_map(|(_, _, ms)| ms.map(f64::from))
        .collect();
    let avg_response_time_ms = (!times.is_empty()).then(|| times.iter().sum::<f64>() / times.len() as f64);

    UptimeStats {
        uptime_24h: window(1),
        uptime_7d: window(7),
        uptime_30d: window(30),
        avg_response_time_ms,
    }
}

/// Runs health checks and applies their results with hysteresis.
#[derive(Clone)]
pub struct MonitorEngine {
    db: Arc<DatabaseConnection>,
    events: EventBus,
    in_flight: Arc<DashMap<i32, ()>>,
    settings: MonitorSettings,
}

impl MonitorEngine {
    pub fn new(db: Arc<DatabaseConnection>, events: EventBus, settings: MonitorSettings) -> Self {
        Self {
            db,
            events,
            in_flight: Arc::new(DashMap::new()),
            settings,
        }
    }

    fn try_acquire(&self, monitor_id: i32) -> Option<InFlightGuard> {
        match self.in_flight.entry(monitor_id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(InFlightGuard {
                    map: Arc::clone(&self.in_flight),
                    monitor_id,
                })
            }
        }
    }

    pub async fn get(&self, monitor_id: i32) -> Result<health_monitor::Model, MonitorError> {
        health_monitor::Entity::find_by_id(monitor_id)
            .one(self.db.as_ref())
            .await?
            .ok_or(MonitorError::NotFound(monitor_id))
    }

    pub async fn create(&self, new: NewMonitor) -> Result<health_monitor::Model, MonitorError> {
        if new.name.trim().is_empty() {
            return Err(MonitorError::Invalid("name must not be empty".into()));
        }
        if new.monitor_type != MonitorType::Heartbeat && new.check_target.trim().is_empty() {
            return Err(MonitorError::Invalid("check_target is required".into()));
        }
        let heartbeat_token =
            (new.monitor_type == MonitorType::Heartbeat).then(|| hex::encode(rand::random::<[u8; 16]>()));
        let now = Utc::now();

        let monitor = health_monitor::ActiveModel {
            team_id: Set(new.team_id),
            server_id: Set(new.server_id),
            web_app_id: Set(None),
            name: Set(new.name),
            monitor_type: Set(new.monitor_type),
            check_target: Set(new.check_target),
            http_method: Set(new.http_method.unwrap_or_else(|| "GET".to_string())),
            expected_status: Set(new.expected_status),
            expected_content: Set(new.expected_content),
            interval_seconds: Set(new.interval_seconds.unwrap_or(60).max(1)),
            timeout_seconds: Set(new.timeout_seconds.unwrap_or(10).max(1)),
            failure_threshold: Set(new.failure_threshold.unwrap_or(3).max(1)),
            recovery_threshold: Set(new.recovery_threshold.unwrap_or(2).max(1)),
            consecutive_failures: Set(0),
            consecutive_successes: Set(0),
            status: Set(MonitorStatus::Pending),
            is_active: Set(true),
            heartbeat_token: Set(heartbeat_token),
            last_heartbeat_ping_at: Set(None),
            ssl_expiry_days_warning: Set(new.ssl_expiry_days_warning.unwrap_or(14)),
            last_check_at: Set(None),
            last_up_at: Set(None),
            last_down_at: Set(None),
            last_response_time_ms: Set(None),
            last_error: Set(None),
            uptime_24h: Set(None),
            uptime_7d: Set(None),
            uptime_30d: Set(None),
            avg_response_time_ms: Set(None),
            uptime_calculated_at: Set(None),
            version: Set(0),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(self.db.as_ref())
        .await?;
        info!(monitor_id = monitor.id, monitor_type = %monitor.monitor_type, "Health monitor created.");
        Ok(monitor)
    }

    pub async fn check_monitor(&self, monitor_id: i32) -> Result<CheckOutcome, MonitorError> {
        let monitor = self.get(monitor_id).await?;
        self.check_loaded(monitor, Utc::now()).await
    }

    /// Probes one monitor (or evaluates its heartbeat window) and records the result.
    pub async fn check_loaded(
        &self,
        monitor: health_monitor::Model,
        now: DateTime<Utc>,
    ) -> Result<CheckOutcome, MonitorError> {
        if !monitor.is_active || monitor.status == MonitorStatus::Paused {
            return Ok(CheckOutcome::Skipped(SkipReason::Paused));
        }
        let Some(_guard) = self.try_acquire(monitor.id) else {
            debug!(monitor_id = monitor.id, "Check already in flight, skipping.");
            return Ok(CheckOutcome::Skipped(SkipReason::InFlight));
        };

        let result = if monitor.monitor_type == MonitorType::Heartbeat {
            if !heartbeat_overdue(&monitor, now, self.settings.heartbeat_grace_multiplier) {
                return Ok(CheckOutcome::Skipped(SkipReason::NotDue));
            }
            let grace = f64::from(monitor.interval_seconds) * self.settings.heartbeat_grace_multiplier;
            ProbeResult::down(format!("No heartbeat received within {grace:.0} seconds"))
        } else {
            probe::run_probe(&monitor).await
        };

        self.apply_result(&monitor, result, now).await
    }

    /// Writes one result: the check log row plus the hysteresis state, guarded by
    /// the monitor's version. A concurrent writer wins and our result is discarded.
    pub async fn apply_result(
        &self,
        monitor: &health_monitor::Model,
        result: ProbeResult,
        now: DateTime<Utc>,
    ) -> Result<CheckOutcome, MonitorError> {
        let effect = MonitorCounters {
            status: monitor.status,
            consecutive_failures: monitor.consecutive_failures,
            consecutive_successes: monitor.consecutive_successes,
        }
        .after_probe(result.success, monitor.failure_threshold, monitor.recovery_threshold);
        let next = effect.counters;

        let txn = self.db.begin().await?;

        monitor_check::ActiveModel {
            monitor_id: Set(monitor.id),
            is_success: Set(result.success),
            response_time_ms: Set(result.response_time_ms),
            status_code: Set(result.status_code),
            error: Set(result.error.clone()),
            checked_at: Set(now),
            ..Default::default()
        }
        .insert(&txn)
        .await?;

        let mut update = health_monitor::Entity::update_many()
            .col_expr(health_monitor::Column::Status, Expr::value(next.status))
            .col_expr(health_monitor::Column::ConsecutiveFailures, Expr::value(next.consecutive_failures))
            .col_expr(health_monitor::Column::ConsecutiveSuccesses, Expr::value(next.consecutive_successes))
            .col_expr(health_monitor::Column::LastCheckAt, Expr::value(now))
            .col_expr(health_monitor::Column::LastResponseTimeMs, Expr::value(result.response_time_ms))
            .col_expr(health_monitor::Column::LastError, Expr::value(result.error.clone()))
            .col_expr(health_monitor::Column::Version, Expr::value(monitor.version + 1))
            .col_expr(health_monitor::Column::UpdatedAt, Expr::value(now));
        if result.success {
            update = update.col_expr(health_monitor::Column::LastUpAt, Expr::value(now));
        }
        if effect.transition == Some(MonitorTransition::WentDown) {
            update = update.col_expr(health_monitor::Column::LastDownAt, Expr::value(now));
        }
        let written = update
            .filter(health_monitor::Column::Id.eq(monitor.id))
            .filter(health_monitor::Column::Version.eq(monitor.version))
            .exec(&txn)
            .await?;

        if written.rows_affected == 0 {
            txn.rollback().await?;
            debug!(monitor_id = monitor.id, "Monitor changed during the check; result discarded.");
            return Ok(CheckOutcome::Skipped(SkipReason::StaleVersion));
        }
        txn.commit().await?;

        match effect.transition {
            Some(MonitorTransition::WentDown) => {
                warn!(
                    monitor_id = monitor.id,
                    name = %monitor.name,
                    failures = next.consecutive_failures,
                    error = ?result.error,
                    "Monitor is down."
                );
                self.events.emit(FleetEvent::MonitorDown {
                    monitor_id: monitor.id,
                    team_id: monitor.team_id,
                    name: monitor.name.clone(),
                    error: result.error.clone(),
                });
            }
            Some(MonitorTransition::Recovered) => {
                info!(monitor_id = monitor.id, name = %monitor.name, "Monitor recovered.");
                self.events.emit(FleetEvent::MonitorRecovered {
                    monitor_id: monitor.id,
                    team_id: monitor.team_id,
                    name: monitor.name.clone(),
                    down_since: monitor.last_down_at,
                });
            }
            Some(MonitorTransition::FirstUp) => {
                info!(monitor_id = monitor.id, name = %monitor.name, "Monitor is up.");
            }
            None => {}
        }

        Ok(CheckOutcome::Recorded {
            status: next.status,
            success: result.success,
            transition: effect.transition,
        })
    }

    pub async fn record_heartbeat_ping(&self, token: &str) -> Result<CheckOutcome, MonitorError> {
        self.record_heartbeat_ping_at(token, Utc::now()).await
    }

    /// A push from a heartbeat monitor's client counts as a successful check.
    pub async fn record_heartbeat_ping_at(&self, token: &str, now: DateTime<Utc>) -> Result<CheckOutcome, MonitorError> {
        let monitor = health_monitor::Entity::find()
            .filter(health_monitor::Column::HeartbeatToken.eq(token))
            .filter(health_monitor::Column::MonitorType.eq(MonitorType::Heartbeat))
            .one(self.db.as_ref())
            .await?
            .ok_or(MonitorError::UnknownHeartbeatToken)?;

        health_monitor::Entity::update_many()
            .col_expr(health_monitor::Column::LastHeartbeatPingAt, Expr::value(now))
            .filter(health_monitor::Column::Id.eq(monitor.id))
            .exec(self.db.as_ref())
            .await?;

        if !monitor.is_active || monitor.status == MonitorStatus::Paused {
            return Ok(CheckOutcome::Skipped(SkipReason::Paused));
        }
        let Some(_guard) = self.try_acquire(monitor.id) else {
            return Ok(CheckOutcome::Skipped(SkipReason::InFlight));
        };
        let monitor = self.get(monitor.id).await?;
        self.apply_result(&monitor, ProbeResult::up(0), now).await
    }

    pub async fn sweep(&self, only_monitor: Option<i32>) -> Result<MonitorSweepReport, MonitorError> {
        self.sweep_at(only_monitor, Utc::now()).await
    }

    /// Checks every due monitor, several at a time, then refreshes stale uptime
    /// figures. A single target is checked even when it is not due yet.
    pub async fn sweep_at(
        &self,
        only_monitor: Option<i32>,
        now: DateTime<Utc>,
    ) -> Result<MonitorSweepReport, MonitorError> {
        let mut query = health_monitor::Entity::find()
            .filter(health_monitor::Column::IsActive.eq(true))
            .filter(health_monitor::Column::Status.ne(MonitorStatus::Paused));
        if let Some(id) = only_monitor {
            query = query.filter(health_monitor::Column::Id.eq(id));
        }
        let monitors = query.all(self.db.as_ref()).await?;

        let due: Vec<health_monitor::Model> = monitors
            .iter()
            .filter(|m| only_monitor.is_some() || is_due(m, now))
            .cloned()
            .collect();

        let mut report = MonitorSweepReport::default();
        let outcomes: Vec<(i32, Result<CheckOutcome, MonitorError>)> = futures::stream::iter(due)
            .map(|monitor| async move {
                let id = monitor.id;
                (id, self.check_loaded(monitor, now).await)
            })
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;

        for (monitor_id, outcome) in outcomes {
            match outcome {
                Ok(CheckOutcome::Recorded { status, .. }) => {
                    report.checked += 1;
                    match status {
                        MonitorStatus::Up => report.up += 1,
                        MonitorStatus::Down => report.down += 1,
                        _ => {}
                    }
                }
                Ok(CheckOutcome::Skipped(_)) => report.skipped += 1,
                Err(MonitorError::DbErr(e)) => return Err(MonitorError::DbErr(e)),
                Err(e) => {
                    error!(monitor_id, error = %e, "Monitor check failed.");
                    report.errors += 1;
                }
            }
        }

        let recalc_after = Duration::seconds(self.settings.uptime_recalc_interval_secs.max(1));
        for monitor in monitors
            .iter()
            .filter(|m| m.uptime_calculated_at.map_or(true, |at| now - at >= recalc_after))
        {
            match self.recalculate_uptime_at(monitor.id, now).await {
                Ok(_) => report.uptime_recalculated += 1,
                Err(e) => {
                    error!(monitor_id = monitor.id, error = %e, "Uptime recalculation failed.");
                    report.errors += 1;
                }
            }
        }

        info!(
            checked = report.checked,
            up = report.up,
            down = report.down,
            skipped = report.skipped,
            errors = report.errors,
            "Monitor sweep finished."
        );
        Ok(report)
    }

    /// Recomputes the uptime columns from the last 30 days of checks.
    pub async fn recalculate_uptime_at(&self, monitor_id: i32, now: DateTime<Utc>) -> Result<UptimeStats, MonitorError> {
        let since = now - Duration::days(30);
        let checks: Vec<(DateTime<Utc>, bool, Option<i32>)> = monitor_check::Entity::find()
            .select_only()
            .column(monitor_check::Column::CheckedAt)
            .column(monitor_check::Column::IsSuccess)
            .column(monitor_check::Column::ResponseTimeMs)
            .filter(monitor_check::Column::MonitorId.eq(monitor_id))
            .filter(monitor_check::Column::CheckedAt.gte(since))
            .into_tuple()
            .all(self.db.as_ref())
            .await?;

        let stats = compute_uptime(&checks, now);
        health_monitor::Entity::update_many()
            .col_expr(health_monitor::Column::Uptime24h, Expr::value(stats.uptime_24h))
            .col_expr(health_monitor::Column::Uptime7d, Expr::value(stats.uptime_7d))
            .col_expr(health_monitor::Column::Uptime30d, Expr::value(stats.uptime_30d))
            .col_expr(health_monitor::Column::AvgResponseTimeMs, Expr::value(stats.avg_response_time_ms))
            .col_expr(health_monitor::Column::UptimeCalculatedAt, Expr::value(now))
            .filter(health_monitor::Column::Id.eq(monitor_id))
            .exec(self.db.as_ref())
            .await?;
        debug!(monitor_id, uptime_24h = ?stats.uptime_24h, "Uptime recalculated.");
        Ok(stats)
    }

    /// Stops checking a monitor. Any check already running is discarded.
    pub async fn pause(&self, monitor_id: i32) -> Result<health_monitor::Model, MonitorError> {
        let monitor = self.get(monitor_id).await?;
        let version = monitor.version;
        let mut active: health_monitor::ActiveModel = monitor.into();
        active.status = Set(MonitorStatus::Paused);
        active.version = Set(version + 1);
        active.updated_at = Set(Utc::now());
        let updated = active.update(self.db.as_ref()).await?;
        info!(monitor_id, "Monitor paused.");
        Ok(updated)
    }

    /// Restarts a paused monitor from a clean `pending` state.
    pub async fn resume(&self, monitor_id: i32) -> Result<health_monitor::Model, MonitorError> {
        let monitor = self.get(monitor_id).await?;
        let version = monitor.version;
        let mut active: health_monitor::ActiveModel = monitor.into();
        active.status = Set(MonitorStatus::Pending);
        active.consecutive_failures = Set(0);
        active.consecutive_successes = Set(0);
        active.is_active = Set(true);
        active.version = Set(version + 1);
        active.updated_at = Set(Utc::now());
        let updated = active.update(self.db.as_ref()).await?;
        info!(monitor_id, "Monitor resumed.");
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(interval: i32) -> health_monitor::Model {
        let created = Utc::now() - Duration::hours(1);
        health_monitor::Model {
            id: 1,
            team_id: 1,
            server_id: None,
            web_app_id: None,
            name: "api".into(),
            monitor_type: MonitorType::Heartbeat,
            check_target: String::new(),
            http_method: "GET".into(),
            expected_status: None,
            expected_content: None,
            interval_seconds: interval,
            timeout_seconds: 10,
            failure_threshold: 3,
            recovery_threshold: 2,
            consecutive_failures: 0,
            consecutive_successes: 0,
            status: MonitorStatus::Up,
            is_active: true,
            heartbeat_token: Some("tok".into()),
            last_heartbeat_ping_at: None,
            ssl_expiry_days_warning: 14,
            last_check_at: None,
            last_up_at: None,
            last_down_at: None,
            last_response_time_ms: None,
            last_error: None,
            uptime_24h: None,
            uptime_7d: None,
            uptime_30d: None,
            avg_response_time_ms: None,
            uptime_calculated_at: None,
            version: 0,
            created_at: created,
            updated_at: created,
        }
    }

    #[test]
    fn heartbeat_is_overdue_only_after_grace() {
        let now = Utc::now();
        let mut m = monitor(60);
        m.last_heartbeat_ping_at = Some(now - Duration::seconds(80));
        assert!(!heartbeat_overdue(&m, now, 1.5));
        m.last_heartbeat_ping_at = Some(now - Duration::seconds(91));
        assert!(heartbeat_overdue(&m, now, 1.5));
    }

    #[test]
    fn heartbeat_without_pings_counts_from_creation() {
        let now = Utc::now();
        let mut m = monitor(60);
        m.created_at = now - Duration::seconds(30);
        assert!(!heartbeat_overdue(&m, now, 1.5));
        m.created_at = now - Duration::seconds(600);
        assert!(heartbeat_overdue(&m, now, 1.5));
    }

    #[test]
    fn due_respects_interval_and_pause() {
        let now = Utc::now();
        let mut m = monitor(60);
        assert!(is_due(&m, now));
        m.last_check_at = Some(now - Duration::seconds(30));
        assert!(!is_due(&m, now));
        m.last_check_at = Some(now - Duration::seconds(60));
        assert!(is_due(&m, now));
        m.status = MonitorStatus::Paused;
        assert!(!is_due(&m, now));
    }

    #[test]
    fn uptime_windows_are_computed_separately() {
        let now = Utc::now();
        let checks = vec![
            (now - Duration::hours(1), true, Some(100)),
            (now - Duration::hours(2), false, None),
            (now - Duration::hours(3), true, Some(300)),
            (now - Duration::days(3), false, None),
            (now - Duration::days(20), true, Some(50)),
        ];
        let stats = compute_uptime(&checks, now);
        let day = stats.uptime_24h.unwrap();
        assert!((day - 66.666).abs() < 0.01);
        assert_eq!(stats.uptime_7d, Some(50.0));
        assert_eq!(stats.uptime_30d, Some(60.0));
        assert_eq!(stats.avg_response_time_ms, Some(200.0));
    }

    #[test]
    fn no_checks_means_unknown_uptime() {
        assert_eq!(compute_uptime(&[], Utc::now()), UptimeStats::default());
    }
}
