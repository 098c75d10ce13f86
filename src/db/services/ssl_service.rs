use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sea_orm::sea_query::{Condition, Expr};
use sea_orm::{ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, TransactionTrait};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::db::entities::ssl_certificate;
use crate::db::enums::CertificateStatus;
use crate::db::services::job_handlers::SSL_RENEW;
use crate::db::services::job_service::{JobQueue, has_in_flight_for, insert_job};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SslRenewalReport {
    pub renewals_queued: usize,
    pub marked_expired: usize,
    pub skipped: usize,
    pub errors: usize,
}

/// Queues renewals for certificates close to expiry and flags the lapsed ones
/// nobody renews.
#[derive(Clone)]
pub struct SslRenewalService {
    db: Arc<DatabaseConnection>,
    jobs: JobQueue,
    renewal_window: Duration,
}

impl SslRenewalService {
    pub fn new(db: Arc<DatabaseConnection>, jobs: JobQueue, renewal_window_days: i64) -> Self {
        Self {
            db,
            jobs,
            renewal_window: Duration::days(renewal_window_days),
        }
    }

    pub async fn sweep(&self) -> Result<SslRenewalReport, DbErr> {
        self.sweep_at(None, Utc::now()).await
    }

    pub async fn sweep_at(&self, only_certificate: Option<i32>, now: DateTime<Utc>) -> Result<SslRenewalReport, DbErr> {
        let mut report = SslRenewalReport::default();
        let horizon = now + self.renewal_window;

        let mut due = ssl_certificate::Entity::find()
            .filter(ssl_certificate::Column::AutoRenew.eq(true))
            .filter(ssl_certificate::Column::Status.is_in([CertificateStatus::Active, CertificateStatus::Failed]))
            .filter(ssl_certificate::Column::ExpiresAt.lte(horizon));
        if let Some(id) = only_certificate {
            due = due.filter(ssl_certificate::Column::Id.eq(id));
        }

        for cert in due.all(self.db.as_ref()).await? {
            match self.queue_renewal(&cert, now).await {
                Ok(true) => report.renewals_queued += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    error!(certificate_id = cert.id, error = %e, "Failed to queue certificate renewal.");
                    report.errors += 1;
                }
            }
        }

        let mut lapsed = Condition::all()
            .add(ssl_certificate::Column::AutoRenew.eq(false))
            .add(ssl_certificate::Column::Status.eq(CertificateStatus::Active))
            .add(ssl_certificate::Column::ExpiresAt.lt(now));
        if let Some(id) = only_certificate {
            lapsed = lapsed.add(ssl_certificate::Column::Id.eq(id));
        }
        let expired = ssl_certificate::Entity::update_many()
            .col_expr(ssl_certificate::Column::Status, Expr::value(CertificateStatus::Expired))
            .col_expr(ssl_certificate::Column::UpdatedAt, Expr::value(now))
            .filter(lapsed)
            .exec(self.db.as_ref())
            .await?;
        report.marked_expired = expired.rows_affected as usize;
        if report.marked_expired > 0 {
            warn!(count = report.marked_expired, "Certificates expired without auto-renewal.");
        }

        info!(
            renewals_queued = report.renewals_queued,
            marked_expired = report.marked_expired,
            "SSL renewal sweep finished."
        );
        Ok(report)
    }

    async fn queue_renewal(&self, cert: &ssl_certificate::Model, now: DateTime<Utc>) -> Result<bool, DbErr> {
        if has_in_flight_for(self.db.as_ref(), cert.server_id, SSL_RENEW, "certificate_id", cert.id).await? {
            debug!(certificate_id = cert.id, "Renewal already in flight.");
            return Ok(false);
        }

        let txn = self.db.begin().await?;
        let written = ssl_certificate::Entity::update_many()
            .col_expr(ssl_certificate::Column::Status, Expr::value(CertificateStatus::Renewing))
            .col_expr(ssl_certificate::Column::UpdatedAt, Expr::value(now))
            .filter(ssl_certificate::Column::Id.eq(cert.id))
            .filter(ssl_certificate::Column::Status.eq(cert.status))
            .exec(&txn)
            .await?;
        if written.rows_affected == 0 {
            txn.rollback().await?;
            return Ok(false);
        }
        let job = insert_job(
            &txn,
            cert.server_id,
            SSL_RENEW,
            json!({ "certificate_id": cert.id, "domain": cert.domain }),
            self.jobs.default_priority(),
            now,
        )
        .await?;
        txn.commit().await?;
        self.jobs.announce_created(&job);

        info!(
            certificate_id = cert.id,
            domain = %cert.domain,
            expires_at = ?cert.expires_at,
            job_id = job.id,
            "Certificate renewal queued."
        );
        Ok(true)
    }
}
