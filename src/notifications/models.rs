use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::events::FleetEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// A human-facing message derived from a [`FleetEvent`].
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub kind: &'static str,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub event: FleetEvent,
    pub sent_at: DateTime<Utc>,
}

impl Notification {
    /// Renders `event`, or `None` for events nobody is told about.
    pub fn from_event(event: &FleetEvent, now: DateTime<Utc>) -> Option<Self> {
        if !event.is_notifiable() {
            return None;
        }
        let (severity, title, message) = match event {
            FleetEvent::JobStatusChanged { .. } => return None,
            FleetEvent::ServerWentOffline { server_id, reason, .. } => (
                Severity::Critical,
                format!("Server {server_id} is offline"),
                reason.clone(),
            ),
            FleetEvent::ServerReconnected { server_id, previous_status } => (
                Severity::Info,
                format!("Server {server_id} reconnected"),
                format!("Heartbeats resumed; server was {previous_status}."),
            ),
            FleetEvent::ResourceAlert { server_id, metric, value, threshold } => (
                Severity::Warning,
                format!("Server {server_id}: high {metric}"),
                format!("{metric} at {value:.1} reached the threshold of {threshold:.1}."),
            ),
            FleetEvent::ResourceRecovered { server_id, metric, value, threshold } => (
                Severity::Info,
                format!("Server {server_id}: {metric} back to normal"),
                format!("{metric} at {value:.1} is below the threshold of {threshold:.1}."),
            ),
            FleetEvent::MonitorDown { name, error, .. } => (
                Severity::Critical,
                format!("Monitor '{name}' is down"),
                error.clone().unwrap_or_else(|| "Check failed.".to_string()),
            ),
            FleetEvent::MonitorRecovered { name, down_since, .. } => {
                let message = match down_since {
                    Some(since) => {
                        let minutes = (now - *since).num_minutes().max(0);
                        format!("Back up after {minutes} minute(s) of downtime.")
                    }
                    None => "Back up.".to_string(),
                };
                (Severity::Info, format!("Monitor '{name}' recovered"), message)
            }
            FleetEvent::FirewallRuleRolledBack { rule_id, server_id, reason } => (
                Severity::Warning,
                format!("Firewall rule {rule_id} rolled back on server {server_id}"),
                format!("Rolled back: {reason}."),
            ),
            FleetEvent::NodeAppUnhealthy { name, server_id, consecutive_failures, .. } => (
                Severity::Warning,
                format!("Node app '{name}' is unhealthy on server {server_id}"),
                format!("{consecutive_failures} consecutive health checks failed."),
            ),
        };
        Some(Self {
            kind: event.kind(),
            severity,
            title,
            message,
            event: event.clone(),
            sent_at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::enums::JobStatus;

    #[test]
    fn job_updates_are_not_rendered() {
        let event = FleetEvent::JobStatusChanged {
            job_id: 1,
            server_id: 1,
            job_type: "ssh_key_add".into(),
            from: None,
            to: JobStatus::Pending,
        };
        assert!(Notification::from_event(&event, Utc::now()).is_none());
    }

    #[test]
    fn recovery_reports_downtime() {
        let now = Utc::now();
        let event = FleetEvent::MonitorRecovered {
            monitor_id: 3,
            team_id: 1,
            name: "api".into(),
            down_since: Some(now - chrono::Duration::minutes(12)),
        };
        let rendered = Notification::from_event(&event, now).unwrap();
        assert_eq!(rendered.kind, "monitor_recovered");
        assert_eq!(rendered.severity, Severity::Info);
        assert!(rendered.message.contains("12 minute"));
    }
}
