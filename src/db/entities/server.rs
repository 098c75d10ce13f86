use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::db::enums::ServerStatus;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "servers")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub team_id: i32,
    pub name: String,
    pub ip_address: Option<String>,
    pub ssh_port: i32,
    pub agent_port: Option<i32>,
    pub status: ServerStatus,
    pub last_heartbeat_at: Option<DateTimeUtc>,
    #[serde(skip_serializing)]
    #[sea_orm(unique)]
    pub provision_token: Option<String>,
    #[serde(skip_serializing)]
    #[sea_orm(unique)]
    pub agent_token: Option<String>,
    pub agent_token_expires_at: Option<DateTimeUtc>,
    #[sea_orm(column_type = "Text", nullable)]
    pub public_key: Option<String>,
    pub os_name: Option<String>,
    pub os_version: Option<String>,
    pub cpu_cores: Option<i32>,
    pub memory_mb: Option<i64>,
    pub disk_gb: Option<i64>,
    // Latest snapshot from the most recent heartbeat.
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub disk_percent: Option<f64>,
    pub load_1m: Option<f64>,
    pub load_alert_threshold: Option<f64>,
    pub memory_alert_threshold: Option<f64>,
    pub disk_alert_threshold: Option<f64>,
    pub load_alert_active: bool,
    pub memory_alert_active: bool,
    pub disk_alert_active: bool,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::agent_job::Entity")]
    AgentJob,
    #[sea_orm(has_many = "super::firewall_rule::Entity")]
    FirewallRule,
    #[sea_orm(has_many = "super::provisioning_step::Entity")]
    ProvisioningStep,
}

impl Related<super::agent_job::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::AgentJob.def()
    }
}

impl Related<super::firewall_rule::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::FirewallRule.def()
    }
}

impl Related<super::provisioning_step::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ProvisioningStep.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
