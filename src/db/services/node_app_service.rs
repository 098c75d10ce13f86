use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::db::entities::{node_app, server};
use crate::db::enums::{NodeAppHealth, NodeAppStatus};
use crate::db::services::job_handlers::NODE_APP_RESTART;
use crate::db::services::job_service::{JobError, JobQueue, has_in_flight_for};
use crate::events::{EventBus, FleetEvent};
use crate::monitoring::probe::{self, ProbeResult};

#[derive(Debug, thiserror::Error)]
pub enum NodeAppError {
    #[error("Database error: {0}")]
    DbErr(#[from] DbErr),
    #[error("Failed to queue restart: {0}")]
    Job(#[from] JobError),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct NodeAppSweepReport {
    pub checked: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub restarts_queued: usize,
    pub skipped: usize,
    pub errors: usize,
}

/// Health bookkeeping after one probe of a node app.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthUpdate {
    pub health: NodeAppHealth,
    pub consecutive_failures: i32,
    /// Set only on the probe that crosses the threshold.
    pub became_unhealthy: bool,
}

pub fn next_health(app: &node_app::Model, success: bool, failure_threshold: i32) -> HealthUpdate {
    if success {
        return HealthUpdate {
            health: NodeAppHealth::Healthy,
            consecutive_failures: 0,
            became_unhealthy: false,
        };
    }
    let failures = app.consecutive_health_failures.saturating_add(1);
    let over = failures >= failure_threshold.max(1);
    HealthUpdate {
        health: if over { NodeAppHealth::Unhealthy } else { app.health_status },
        consecutive_failures: failures,
        became_unhealthy: over && app.health_status != NodeAppHealth::Unhealthy,
    }
}

pub fn health_url(ip_address: &str, port: i32, path: &str) -> String {
    let path = if path.starts_with('/') { path.to_string() } else { format!("/{path}") };
    format!("http://{ip_address}:{port}{path}")
}

/// Probes running Node.js apps and restarts the ones that keep failing.
#[derive(Clone)]
pub struct NodeAppMonitor {
    db: Arc<DatabaseConnection>,
    jobs: JobQueue,
    events: EventBus,
    failure_threshold: i32,
    timeout: Duration,
    concurrency: usize,
}

impl NodeAppMonitor {
    pub fn new(
        db: Arc<DatabaseConnection>,
        jobs: JobQueue,
        events: EventBus,
        failure_threshold: i32,
        timeout: Duration,
        concurrency: usize,
    ) -> Self {
        Self {
            db,
            jobs,
            events,
            failure_threshold,
            timeout,
            concurrency,
        }
    }

    pub async fn sweep_at(&self, only_app: Option<i32>, now: DateTime<Utc>) -> Result<NodeAppSweepReport, NodeAppError> {
        let mut query = node_app::Entity::find()
            .filter(node_app::Column::Status.eq(NodeAppStatus::Running))
            .find_also_related(server::Entity);
        if let Some(id) = only_app {
            query = query.filter(node_app::Column::Id.eq(id));
        }
        let apps = query.all(self.db.as_ref()).await?;

        let mut report = NodeAppSweepReport::default();
        let mut targets = Vec::new();
        for (app, srv) in apps {
            match srv.and_then(|s| s.ip_address) {
                Some(ip) => {
                    let url = health_url(&ip, app.port, &app.health_check_path);
                    targets.push((app, url));
                }
                None => {
                    debug!(app_id = app.id, "Server has no known address; skipping health check.");
                    report.skipped += 1;
                }
            }
        }

        let timeout = self.timeout;
        let probed: Vec<(node_app::Model, ProbeResult)> = futures::stream::iter(targets)
            .map(|(app, url)| async move {
                let result = probe::http_probe(&url, "GET", None, None, timeout).await;
                (app, result)
            })
            .buffer_unordered(self.concurrency.max(1))
            .collect()
            .await;

        for (app, result) in probed {
            report.checked += 1;
            match self.record(&app, &result, now).await {
                Ok(update) => {
                    match update.health {
                        NodeAppHealth::Healthy => report.healthy += 1,
                        NodeAppHealth::Unhealthy => report.unhealthy += 1,
                        NodeAppHealth::Unknown => {}
                    }
                    if update.became_unhealthy && app.auto_restart {
                        match self.queue_restart(&app).await {
                            Ok(true) => report.restarts_queued += 1,
                            Ok(false) => {}
                            Err(e) => {
                                error!(app_id = app.id, error = %e, "Failed to queue node app restart.");
                                report.errors += 1;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(app_id = app.id, error = %e, "Failed to record node app health.");
                    report.errors += 1;
                }
            }
        }

        info!(
            checked = report.checked,
            unhealthy = report.unhealthy,
            restarts_queued = report.restarts_queued,
            "Node app health sweep finished."
        );
        Ok(report)
    }

    async fn record(&self, app: &node_app::Model, result: &ProbeResult, now: DateTime<Utc>) -> Result<HealthUpdate, NodeAppError> {
        let update = next_health(app, result.success, self.failure_threshold);
        node_app::Entity::update_many()
            .col_expr(node_app::Column::HealthStatus, Expr::value(update.health))
            .col_expr(node_app::Column::ConsecutiveHealthFailures, Expr::value(update.consecutive_failures))
            .col_expr(node_app::Column::LastHealthCheckAt, Expr::value(now))
            .col_expr(node_app::Column::UpdatedAt, Expr::value(now))
            .filter(node_app::Column::Id.eq(app.id))
            .exec(self.db.as_ref())
            .await?;

        if update.became_unhealthy {
            warn!(
                app_id = app.id,
                server_id = app.server_id,
                failures = update.consecutive_failures,
                error = ?result.error,
                "Node app is unhealthy."
            );
            self.events.emit(FleetEvent::NodeAppUnhealthy {
                app_id: app.id,
                server_id: app.server_id,
                name: app.name.clone(),
                consecutive_failures: update.consecutive_failures,
            });
        }
        Ok(update)
    }

    /// Queues a restart unless one is already outstanding for the app.
    async fn queue_restart(&self, app: &node_app::Model) -> Result<bool, NodeAppError> {
        if has_in_flight_for(self.db.as_ref(), app.server_id, NODE_APP_RESTART, "app_id", app.id).await? {
            debug!(app_id = app.id, "Restart already in flight.");
            return Ok(false);
        }
        let job = self
            .jobs
            .enqueue_default(app.server_id, NODE_APP_RESTART, json!({ "app_id": app.id, "name": app.name }))
            .await?;
        info!(app_id = app.id, job_id = job.id, "Node app restart queued.");
        Ok(true)
    }
}
