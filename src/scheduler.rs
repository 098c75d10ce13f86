//! In-process periodic runner for the fleet sweeps.

use chrono::Duration as ChronoDuration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use crate::server::core_services::CoreServices;
use crate::sweeps::{SweepError, SweepKind, SweepOverrides, SweepReport, run_sweep};

/// What happened on one tick of a sweep loop.
#[derive(Debug)]
pub enum TickOutcome {
    Ran(SweepReport),
    /// Another process holds the lease.
    Skipped,
    Failed(SweepError),
}

/// Runs `kind` once if this process can take its lease.
pub async fn run_leased(services: &CoreServices, kind: SweepKind, overrides: SweepOverrides) -> TickOutcome {
    let ttl = ChronoDuration::seconds(services.config.scheduler.lease_ttl_secs.max(1));
    let lease = kind.as_str();

    match services.leases.try_acquire(lease, ttl).await {
        Ok(true) => {}
        Ok(false) => {
            debug!(sweep = %kind, "Lease held elsewhere; skipping run.");
            return TickOutcome::Skipped;
        }
        Err(e) => {
            error!(sweep = %kind, error = %e, "Failed to acquire sweep lease.");
            return TickOutcome::Failed(e.into());
        }
    }

    let outcome = match run_sweep(services, kind, overrides).await {
        Ok(report) => {
            debug!(sweep = %kind, report = ?report, "Leased sweep finished.");
            TickOutcome::Ran(report)
        }
        Err(e) => {
            error!(sweep = %kind, error = %e, "Leased sweep failed.");
            TickOutcome::Failed(e)
        }
    };

    if let Err(e) = services.leases.release(lease).await {
        warn!(sweep = %kind, error = %e, "Failed to release sweep lease; it will expire.");
    }
    outcome
}

async fn sweep_loop(services: CoreServices, kind: SweepKind, mut shutdown: watch::Receiver<bool>) {
    let period = kind.interval(&services.config.scheduler);
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(sweep = %kind, interval_secs = period.as_secs(), "Sweep loop started.");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                run_leased(&services, kind, SweepOverrides::default()).await;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!(sweep = %kind, "Sweep loop stopped.");
}

/// Starts one loop per sweep. Send `true` on the paired sender to stop them.
pub fn spawn_all(services: &CoreServices, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
    SweepKind::ALL
        .into_iter()
        .map(|kind| tokio::spawn(sweep_loop(services.clone(), kind, shutdown.clone())))
        .collect()
}
