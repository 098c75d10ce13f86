use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a managed server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text", enum_name = "server_status_enum")]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "provisioning")]
    Provisioning,
    #[sea_orm(string_value = "active")]
    Active,
    #[sea_orm(string_value = "offline")]
    Offline,
    #[sea_orm(string_value = "failed")]
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text", enum_name = "agent_job_status_enum")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "queued")]
    Queued,
    #[sea_orm(string_value = "running")]
    Running,
    #[sea_orm(string_value = "completed")]
    Completed,
    #[sea_orm(string_value = "failed")]
    Failed,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text", enum_name = "monitor_type_enum")]
#[serde(rename_all = "snake_case")]
pub enum MonitorType {
    #[sea_orm(string_value = "http")]
    Http,
    #[sea_orm(string_value = "https")]
    Https,
    #[sea_orm(string_value = "tcp")]
    Tcp,
    #[sea_orm(string_value = "ping")]
    Ping,
    #[sea_orm(string_value = "ssl_expiry")]
    SslExpiry,
    #[sea_orm(string_value = "heartbeat")]
    Heartbeat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text", enum_name = "monitor_status_enum")]
#[serde(rename_all = "snake_case")]
pub enum MonitorStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "up")]
    Up,
    #[sea_orm(string_value = "down")]
    Down,
    #[sea_orm(string_value = "paused")]
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text", enum_name = "firewall_action_enum")]
#[serde(rename_all = "snake_case")]
pub enum FirewallAction {
    #[sea_orm(string_value = "allow")]
    Allow,
    #[sea_orm(string_value = "deny")]
    Deny,
    #[sea_orm(string_value = "reject")]
    Reject,
    #[sea_orm(string_value = "limit")]
    Limit,
}

impl FirewallAction {
    /// Deny, reject and rate-limit all stop some traffic from getting through.
    pub fn is_blocking(self) -> bool {
        !matches!(self, FirewallAction::Allow)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text", enum_name = "firewall_direction_enum")]
#[serde(rename_all = "snake_case")]
pub enum FirewallDirection {
    #[sea_orm(string_value = "in")]
    In,
    #[sea_orm(string_value = "out")]
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text", enum_name = "firewall_protocol_enum")]
#[serde(rename_all = "snake_case")]
pub enum FirewallProtocol {
    #[sea_orm(string_value = "tcp")]
    Tcp,
    #[sea_orm(string_value = "udp")]
    Udp,
    #[sea_orm(string_value = "any")]
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text", enum_name = "provisioning_step_status_enum")]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "queued")]
    Queued,
    #[sea_orm(string_value = "in_progress")]
    InProgress,
    #[sea_orm(string_value = "completed")]
    Completed,
    #[sea_orm(string_value = "failed")]
    Failed,
    #[sea_orm(string_value = "skipped")]
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text", enum_name = "node_app_status_enum")]
#[serde(rename_all = "snake_case")]
pub enum NodeAppStatus {
    #[sea_orm(string_value = "deploying")]
    Deploying,
    #[sea_orm(string_value = "running")]
    Running,
    #[sea_orm(string_value = "stopped")]
    Stopped,
    #[sea_orm(string_value = "errored")]
    Errored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text", enum_name = "node_app_health_enum")]
#[serde(rename_all = "snake_case")]
pub enum NodeAppHealth {
    #[sea_orm(string_value = "unknown")]
    Unknown,
    #[sea_orm(string_value = "healthy")]
    Healthy,
    #[sea_orm(string_value = "unhealthy")]
    Unhealthy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text", enum_name = "certificate_status_enum")]
#[serde(rename_all = "snake_case")]
pub enum CertificateStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "active")]
    Active,
    #[sea_orm(string_value = "renewing")]
    Renewing,
    #[sea_orm(string_value = "failed")]
    Failed,
    #[sea_orm(string_value = "expired")]
    Expired,
}

/// Status of a server-side resource whose installation is driven by an agent job
/// (SSH key pivots, supervisor programs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text", enum_name = "resource_status_enum")]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "active")]
    Active,
    #[sea_orm(string_value = "failed")]
    Failed,
}

macro_rules! display_as_db_value {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(&self.to_value())
                }
            }
        )+
    };
}

display_as_db_value!(
    ServerStatus,
    JobStatus,
    MonitorType,
    MonitorStatus,
    FirewallAction,
    FirewallDirection,
    FirewallProtocol,
    StepStatus,
    NodeAppStatus,
    NodeAppHealth,
    CertificateStatus,
    ResourceStatus,
);
