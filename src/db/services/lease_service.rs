//! Named, expiring locks stored in the database so periodic tasks run on one
//! process at a time even when several control planes share a database.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sea_orm::sea_query::{Condition, Expr, OnConflict};
use sea_orm::{ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, Set};
use tracing::{debug, trace};

use crate::db::entities::task_lease;

#[derive(Clone)]
pub struct TaskLeaseStore {
    db: Arc<DatabaseConnection>,
    holder: String,
}

impl TaskLeaseStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self::with_holder(db, uuid::Uuid::new_v4().to_string())
    }

    pub fn with_holder(db: Arc<DatabaseConnection>, holder: impl Into<String>) -> Self {
        Self {
            db,
            holder: holder.into(),
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<bool, DbErr> {
        self.try_acquire_at(name, ttl, Utc::now()).await
    }

    /// Takes or renews the lease `name`. Returns false while another holder's
    /// lease is still live.
    pub async fn try_acquire_at(&self, name: &str, ttl: Duration, now: DateTime<Utc>) -> Result<bool, DbErr> {
        let expires_at = now + ttl;

        let taken = task_lease::Entity::update_many()
            .col_expr(task_lease::Column::Holder, Expr::value(self.holder.clone()))
            .col_expr(task_lease::Column::AcquiredAt, Expr::value(now))
            .col_expr(task_lease::Column::ExpiresAt, Expr::value(expires_at))
            .filter(task_lease::Column::Name.eq(name))
            .filter(
                Condition::any()
                    .add(task_lease::Column::ExpiresAt.lt(now))
                    .add(task_lease::Column::Holder.eq(self.holder.as_str())),
            )
            .exec(self.db.as_ref())
            .await?;
        if taken.rows_affected > 0 {
            trace!(lease = name, holder = %self.holder, "Lease renewed.");
            return Ok(true);
        }

        let inserted = task_lease::Entity::insert(task_lease::ActiveModel {
            name: Set(name.to_string()),
            holder: Set(self.holder.clone()),
            acquired_at: Set(now),
            expires_at: Set(expires_at),
        })
        .on_conflict(OnConflict::column(task_lease::Column::Name).do_nothing().to_owned())
        .exec_without_returning(self.db.as_ref())
        .await?;

        if inserted > 0 {
            debug!(lease = name, holder = %self.holder, "Lease acquired.");
            Ok(true)
        } else {
            debug!(lease = name, "Lease held elsewhere.");
            Ok(false)
        }
    }

    /// Drops the lease if this store still holds it.
    pub async fn release(&self, name: &str) -> Result<bool, DbErr> {
        let deleted = task_lease::Entity::delete_many()
            .filter(task_lease::Column::Name.eq(name))
            .filter(task_lease::Column::Holder.eq(self.holder.as_str()))
            .exec(self.db.as_ref())
            .await?;
        Ok(deleted.rows_affected > 0)
    }
}
