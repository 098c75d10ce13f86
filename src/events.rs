//! In-process fan-out of state changes to live-update and notification consumers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::db::enums::{JobStatus, ServerStatus};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FleetEvent {
    JobStatusChanged {
        job_id: i32,
        server_id: i32,
        job_type: String,
        from: Option<JobStatus>,
        to: JobStatus,
    },
    ServerReconnected {
        server_id: i32,
        previous_status: ServerStatus,
    },
    ServerWentOffline {
        server_id: i32,
        last_heartbeat_at: Option<DateTime<Utc>>,
        minutes_since_last_seen: Option<i64>,
        reason: String,
    },
    ResourceAlert {
        server_id: i32,
        metric: String,
        value: f64,
        threshold: f64,
    },
    ResourceRecovered {
        server_id: i32,
        metric: String,
        value: f64,
        threshold: f64,
    },
    MonitorDown {
        monitor_id: i32,
        team_id: i32,
        name: String,
        error: Option<String>,
    },
    MonitorRecovered {
        monitor_id: i32,
        team_id: i32,
        name: String,
        down_since: Option<DateTime<Utc>>,
    },
    FirewallRuleRolledBack {
        rule_id: i32,
        server_id: i32,
        reason: String,
    },
    NodeAppUnhealthy {
        app_id: i32,
        server_id: i32,
        name: String,
        consecutive_failures: i32,
    },
}

impl FleetEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            FleetEvent::JobStatusChanged { .. } => "job_status_changed",
            FleetEvent::ServerReconnected { .. } => "server_reconnected",
            FleetEvent::ServerWentOffline { .. } => "server_went_offline",
            FleetEvent::ResourceAlert { .. } => "resource_alert",
            FleetEvent::ResourceRecovered { .. } => "resource_recovered",
            FleetEvent::MonitorDown { .. } => "monitor_down",
            FleetEvent::MonitorRecovered { .. } => "monitor_recovered",
            FleetEvent::FirewallRuleRolledBack { .. } => "firewall_rule_rolled_back",
            FleetEvent::NodeAppUnhealthy { .. } => "node_app_unhealthy",
        }
    }

    /// Job status changes only feed live views; everything else is worth telling
    /// a human about.
    pub fn is_notifiable(&self) -> bool {
        !matches!(self, FleetEvent::JobStatusChanged { .. })
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<FleetEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.tx.subscribe()
    }

    /// Publishes an event. Having no subscribers is normal (CLI sweeps, tests).
    pub fn emit(&self, event: FleetEvent) {
        let kind = event.kind();
        if self.tx.send(event).is_err() {
            trace!(event = kind, "No subscribers for event.");
        }
    }
}
