pub mod entities;
pub mod enums;
pub mod schema;
pub mod services;

use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbErr};
use std::time::Duration;
use tracing::info;

/// Opens the connection pool for `database_url`.
///
/// In-memory SQLite databases live and die with a single connection, so the pool is
/// pinned to exactly one for them.
pub async fn connect(database_url: &str) -> Result<DatabaseConnection, DbErr> {
    let mut opt = ConnectOptions::new(database_url.to_owned());
    opt.max_connections(10)
        .connect_timeout(Duration::from_secs(10))
        .sqlx_logging(false);

    if database_url.starts_with("sqlite") && database_url.contains(":memory:") {
        opt.max_connections(1).min_connections(1);
    }

    let db = Database::connect(opt).await?;
    info!(backend = ?db.get_database_backend(), "Database connection established.");
    Ok(db)
}
