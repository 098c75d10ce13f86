use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// One row per probe execution. Never updated, only pruned by age.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "monitor_checks")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub monitor_id: i32,
    pub is_success: bool,
    pub response_time_ms: Option<i32>,
    pub status_code: Option<i32>,
    #[sea_orm(column_type = "Text", nullable)]
    pub error: Option<String>,
    pub checked_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::health_monitor::Entity",
        from = "Column::MonitorId",
        to = "super::health_monitor::Column::Id",
        on_delete = "Cascade"
    )]
    HealthMonitor,
}

impl Related<super::health_monitor::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::HealthMonitor.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
