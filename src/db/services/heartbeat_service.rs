use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sea_orm::sea_query::{Condition, Expr};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, IntoActiveModel, QueryFilter, Set,
    TransactionTrait,
};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::db::entities::{server, server_stat, service_stat};
use crate::db::enums::ServerStatus;
use crate::events::{EventBus, FleetEvent};

#[derive(Debug, thiserror::Error)]
pub enum HeartbeatError {
    #[error("Database error: {0}")]
    DbErr(#[from] DbErr),
    #[error("Server {0} not found")]
    ServerNotFound(i32),
}

/// System stats an agent sends with each heartbeat.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HeartbeatStats {
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub disk_percent: Option<f64>,
    pub load_1m: Option<f64>,
    pub load_5m: Option<f64>,
    pub load_15m: Option<f64>,
    #[serde(default)]
    pub services: Vec<ServiceSample>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceSample {
    pub name: String,
    pub is_running: bool,
    pub cpu_percent: Option<f64>,
    pub memory_mb: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceMetric {
    Load,
    Memory,
    Disk,
}

impl ResourceMetric {
    fn alert_column(self) -> server::Column {
        match self {
            ResourceMetric::Load => server::Column::LoadAlertActive,
            ResourceMetric::Memory => server::Column::MemoryAlertActive,
            ResourceMetric::Disk => server::Column::DiskAlertActive,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceMetric::Load => "load",
            ResourceMetric::Memory => "memory",
            ResourceMetric::Disk => "disk",
        }
    }
}

/// A resource alert flag that has to flip because of the latest sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlertChange {
    pub metric: ResourceMetric,
    pub value: f64,
    pub threshold: f64,
    /// `true` when the alert starts, `false` when it clears.
    pub raised: bool,
}

/// Compares the sample with the server's thresholds and returns only the flags that
/// change, so each alert and each recovery is reported once.
pub fn evaluate_resource_alerts(server: &server::Model, stats: &HeartbeatStats) -> Vec<AlertChange> {
    let checks = [
        (ResourceMetric::Load, stats.load_1m, server.load_alert_threshold, server.load_alert_active),
        (ResourceMetric::Memory, stats.memory_percent, server.memory_alert_threshold, server.memory_alert_active),
        (ResourceMetric::Disk, stats.disk_percent, server.disk_alert_threshold, server.disk_alert_active),
    ];

    checks
        .into_iter()
        .filter_map(|(metric, value, threshold, active)| {
            let (value, threshold) = (value?, threshold?);
            let over = value >= threshold;
            (over != active).then_some(AlertChange {
                metric,
                value,
                threshold,
                raised: over,
            })
        })
        .collect()
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StaleServerReport {
    pub checked: usize,
    pub marked_offline: usize,
}

/// Tracks agent liveness and the latest resource snapshot of every server.
#[derive(Clone)]
pub struct HeartbeatTracker {
    db: Arc<DatabaseConnection>,
    events: EventBus,
}

impl HeartbeatTracker {
    pub fn new(db: Arc<DatabaseConnection>, events: EventBus) -> Self {
        Self { db, events }
    }

    pub async fn record_heartbeat(
        &self,
        server_id: i32,
        stats: HeartbeatStats,
    ) -> Result<server::Model, HeartbeatError> {
        self.record_heartbeat_at(server_id, stats, Utc::now()).await
    }

    /// Stores a heartbeat: liveness timestamp, latest stats, time-series rows and
    /// resource alert flags. An offline server comes back as active.
    pub async fn record_heartbeat_at(
        &self,
        server_id: i32,
        stats: HeartbeatStats,
        now: DateTime<Utc>,
    ) -> Result<server::Model, HeartbeatError> {
        let current = server::Entity::find_by_id(server_id)
            .one(self.db.as_ref())
            .await?
            .ok_or(HeartbeatError::ServerNotFound(server_id))?;

        let candidates = evaluate_resource_alerts(&current, &stats);
        let previous_status = current.status;

        let txn = self.db.begin().await?;

        let mut active = current.into_active_model();
        active.last_heartbeat_at = Set(Some(now));
        active.cpu_percent = Set(stats.cpu_percent);
        active.memory_percent = Set(stats.memory_percent);
        active.disk_percent = Set(stats.disk_percent);
        active.load_1m = Set(stats.load_1m);
        active.updated_at = Set(now);
        active.update(&txn).await?;

        // Each flag only flips from the value this sample was judged against, so
        // concurrent heartbeats report a crossing once.
        let mut alert_changes = Vec::with_capacity(candidates.len());
        for change in candidates {
            let column = change.metric.alert_column();
            let flipped = server::Entity::update_many()
                .col_expr(column, Expr::value(change.raised))
                .filter(server::Column::Id.eq(server_id))
                .filter(column.eq(!change.raised))
                .exec(&txn)
                .await?;
            if flipped.rows_affected > 0 {
                alert_changes.push(change);
            }
        }

        server_stat::ActiveModel {
            server_id: Set(server_id),
            cpu_percent: Set(stats.cpu_percent),
            memory_percent: Set(stats.memory_percent),
            disk_percent: Set(stats.disk_percent),
            load_1m: Set(stats.load_1m),
            load_5m: Set(stats.load_5m),
            load_15m: Set(stats.load_15m),
            recorded_at: Set(now),
            ..Default::default()
        }
        .insert(&txn)
        .await?;

        if !stats.services.is_empty() {
            let samples = stats.services.iter().map(|s| service_stat::ActiveModel {
                server_id: Set(server_id),
                service_name: Set(s.name.clone()),
                is_running: Set(s.is_running),
                cpu_percent: Set(s.cpu_percent),
                memory_mb: Set(s.memory_mb),
                recorded_at: Set(now),
                ..Default::default()
            });
            service_stat::Entity::insert_many(samples).exec(&txn).await?;
        }

        let reconnected = previous_status == ServerStatus::Offline
            && Self::reactivate(&txn, server_id, now).await? > 0;

        txn.commit().await?;

        for change in alert_changes {
            let metric = change.metric.as_str().to_string();
            if change.raised {
                warn!(server_id, metric = %metric, value = change.value, threshold = change.threshold, "Resource threshold exceeded.");
                self.events.emit(FleetEvent::ResourceAlert {
                    server_id,
                    metric,
                    value: change.value,
                    threshold: change.threshold,
                });
            } else {
                info!(server_id, metric = %metric, value = change.value, threshold = change.threshold, "Resource back below threshold.");
                self.events.emit(FleetEvent::ResourceRecovered {
                    server_id,
                    metric,
                    value: change.value,
                    threshold: change.threshold,
                });
            }
        }

        if reconnected {
            self.announce_reconnect(server_id);
        }

        debug!(server_id, "Heartbeat recorded.");
        server::Entity::find_by_id(server_id)
            .one(self.db.as_ref())
            .await?
            .ok_or(HeartbeatError::ServerNotFound(server_id))
    }

    /// Counts any authenticated agent call as proof of life without touching stats.
    pub async fn touch_at(&self, server_id: i32, now: DateTime<Utc>) -> Result<(), HeartbeatError> {
        let result = server::Entity::update_many()
            .col_expr(server::Column::LastHeartbeatAt, Expr::value(now))
            .col_expr(server::Column::UpdatedAt, Expr::value(now))
            .filter(server::Column::Id.eq(server_id))
            .exec(self.db.as_ref())
            .await?;
        if result.rows_affected == 0 {
            return Err(HeartbeatError::ServerNotFound(server_id));
        }
        if Self::reactivate(self.db.as_ref(), server_id, now).await? > 0 {
            self.announce_reconnect(server_id);
        }
        Ok(())
    }

    async fn reactivate<C: sea_orm::ConnectionTrait>(conn: &C, server_id: i32, now: DateTime<Utc>) -> Result<u64, DbErr> {
        let result = server::Entity::update_many()
            .col_expr(server::Column::Status, Expr::value(ServerStatus::Active))
            .col_expr(server::Column::UpdatedAt, Expr::value(now))
            .filter(server::Column::Id.eq(server_id))
            .filter(server::Column::Status.eq(ServerStatus::Offline))
            .exec(conn)
            .await?;
        Ok(result.rows_affected)
    }

    fn announce_reconnect(&self, server_id: i32) {
        info!(server_id, "Server reconnected after being offline.");
        self.events.emit(FleetEvent::ServerReconnected {
            server_id,
            previous_status: ServerStatus::Offline,
        });
    }

    pub async fn check_stale_servers(&self, threshold_minutes: i64) -> Result<StaleServerReport, HeartbeatError> {
        self.check_stale_servers_at(threshold_minutes, None, Utc::now()).await
    }

    /// Moves active servers without a recent heartbeat to offline. Running it twice
    /// changes nothing the second time.
    pub async fn check_stale_servers_at(
        &self,
        threshold_minutes: i64,
        only_server: Option<i32>,
        now: DateTime<Utc>,
    ) -> Result<StaleServerReport, HeartbeatError> {
        let threshold_minutes = threshold_minutes.max(1);
        let cutoff = now - Duration::minutes(threshold_minutes);

        let mut query = server::Entity::find()
            .filter(server::Column::Status.eq(ServerStatus::Active))
            .filter(stale_condition(cutoff));
        if let Some(id) = only_server {
            query = query.filter(server::Column::Id.eq(id));
        }
        let stale = query.all(self.db.as_ref()).await?;

        let mut report = StaleServerReport {
            checked: stale.len(),
            ..Default::default()
        };
        let reason = format!("No heartbeat received for {threshold_minutes}+ minutes.");

        for srv in stale {
            let result = server::Entity::update_many()
                .col_expr(server::Column::Status, Expr::value(ServerStatus::Offline))
                .col_expr(server::Column::UpdatedAt, Expr::value(now))
                .filter(server::Column::Id.eq(srv.id))
                .filter(server::Column::Status.eq(ServerStatus::Active))
                .filter(stale_condition(cutoff))
                .exec(self.db.as_ref())
                .await?;
            if result.rows_affected == 0 {
                continue;
            }

            report.marked_offline += 1;
            let minutes_since_last_seen = srv.last_heartbeat_at.map(|at| (now - at).num_minutes());
            warn!(
                server_id = srv.id,
                last_heartbeat_at = ?srv.last_heartbeat_at,
                minutes_since_last_seen = ?minutes_since_last_seen,
                "Marking server offline after missed heartbeats."
            );
            self.events.emit(FleetEvent::ServerWentOffline {
                server_id: srv.id,
                last_heartbeat_at: srv.last_heartbeat_at,
                minutes_since_last_seen,
                reason: reason.clone(),
            });
        }

        Ok(report)
    }
}

fn stale_condition(cutoff: DateTime<Utc>) -> Condition {
    Condition::any()
        .add(server::Column::LastHeartbeatAt.is_null())
        .add(server::Column::LastHeartbeatAt.lt(cutoff))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_with_thresholds() -> server::Model {
        let now = Utc::now();
        server::Model {
            id: 1,
            team_id: 1,
            name: "web-1".into(),
            ip_address: Some("10.0.0.5".into()),
            ssh_port: 22,
            agent_port: None,
            status: ServerStatus::Active,
            last_heartbeat_at: Some(now),
            provision_token: None,
            agent_token: None,
            agent_token_expires_at: None,
            public_key: None,
            os_name: None,
            os_version: None,
            cpu_cores: None,
            memory_mb: None,
            disk_gb: None,
            cpu_percent: None,
            memory_percent: None,
            disk_percent: None,
            load_1m: None,
            load_alert_threshold: Some(4.0),
            memory_alert_threshold: Some(90.0),
            disk_alert_threshold: None,
            load_alert_active: false,
            memory_alert_active: true,
            disk_alert_active: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn alerts_fire_on_crossing_and_clear_on_recovery() {
        let server = server_with_thresholds();
        let stats = HeartbeatStats {
            load_1m: Some(6.5),
            memory_percent: Some(40.0),
            disk_percent: Some(99.0),
            ..Default::default()
        };
        let changes = evaluate_resource_alerts(&server, &stats);

        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].metric, ResourceMetric::Load);
        assert!(changes[0].raised);
        assert_eq!(changes[1].metric, ResourceMetric::Memory);
        assert!(!changes[1].raised);
    }

    #[test]
    fn alert_already_active_is_not_reported_again() {
        let mut server = server_with_thresholds();
        server.load_alert_active = true;
        let stats = HeartbeatStats {
            load_1m: Some(8.0),
            memory_percent: Some(95.0),
            ..Default::default()
        };
        assert!(evaluate_resource_alerts(&server, &stats).is_empty());
    }

    #[test]
    fn missing_samples_leave_flags_alone() {
        let server = server_with_thresholds();
        assert!(evaluate_resource_alerts(&server, &HeartbeatStats::default()).is_empty());
    }
}
