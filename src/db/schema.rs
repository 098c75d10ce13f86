//! Table creation straight from the entity definitions.

use sea_orm::{ConnectionTrait, DatabaseConnection, DbErr, EntityTrait, Schema};
use tracing::debug;

use crate::db::entities::prelude::*;

async fn create_table<E>(db: &DatabaseConnection, schema: &Schema, entity: E) -> Result<(), DbErr>
where
    E: EntityTrait,
{
    let backend = db.get_database_backend();
    let table = entity.table_name().to_owned();
    let mut stmt = schema.create_table_from_entity(entity);
    stmt.if_not_exists();
    db.execute(backend.build(&stmt)).await?;
    debug!(table = %table, "Ensured table exists.");
    Ok(())
}

/// Creates every table that does not exist yet. Parents are created before the
/// tables holding foreign keys to them.
pub async fn sync(db: &DatabaseConnection) -> Result<(), DbErr> {
    let schema = Schema::new(db.get_database_backend());

    create_table(db, &schema, Server).await?;
    create_table(db, &schema, AgentJob).await?;
    create_table(db, &schema, HealthMonitor).await?;
    create_table(db, &schema, MonitorCheck).await?;
    create_table(db, &schema, FirewallRule).await?;
    create_table(db, &schema, ProvisioningStep).await?;
    create_table(db, &schema, NodeApp).await?;
    create_table(db, &schema, SslCertificate).await?;
    create_table(db, &schema, BackupSchedule).await?;
    create_table(db, &schema, ServerSshKey).await?;
    create_table(db, &schema, SupervisorProgram).await?;
    create_table(db, &schema, ServerStat).await?;
    create_table(db, &schema, ServiceStat).await?;
    create_table(db, &schema, TaskLease).await?;
    Ok(())
}
