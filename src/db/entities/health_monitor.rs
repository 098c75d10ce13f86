use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::db::enums::{MonitorStatus, MonitorType};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "health_monitors")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub team_id: i32,
    pub server_id: Option<i32>,
    pub web_app_id: Option<i32>,
    pub name: String,
    pub monitor_type: MonitorType,
    pub check_target: String,
    pub http_method: String,
    pub expected_status: Option<i32>,
    #[sea_orm(column_type = "Text", nullable)]
    pub expected_content: Option<String>,
    pub interval_seconds: i32,
    pub timeout_seconds: i32,
    pub failure_threshold: i32,
    pub recovery_threshold: i32,
    pub consecutive_failures: i32,
    pub consecutive_successes: i32,
    pub status: MonitorStatus,
    pub is_active: bool,
    #[serde(skip_serializing)]
    #[sea_orm(unique)]
    pub heartbeat_token: Option<String>,
    pub last_heartbeat_ping_at: Option<DateTimeUtc>,
    pub ssl_expiry_days_warning: i32,
    pub last_check_at: Option<DateTimeUtc>,
    pub last_up_at: Option<DateTimeUtc>,
    pub last_down_at: Option<DateTimeUtc>,
    pub last_response_time_ms: Option<i32>,
    #[sea_orm(column_type = "Text", nullable)]
    pub last_error: Option<String>,
    pub uptime_24h: Option<f64>,
    pub uptime_7d: Option<f64>,
    pub uptime_30d: Option<f64>,
    pub avg_response_time_ms: Option<f64>,
    pub uptime_calculated_at: Option<DateTimeUtc>,
    /// Bumped on every state write; state updates are conditional on it.
    pub version: i32,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::server::Entity",
        from = "Column::ServerId",
        to = "super::server::Column::Id",
        on_delete = "SetNull"
    )]
    Server,
    #[sea_orm(has_many = "super::monitor_check::Entity")]
    MonitorCheck,
}

impl Related<super::server::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Server.def()
    }
}

impl Related<super::monitor_check::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::MonitorCheck.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
