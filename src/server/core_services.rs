//! Wiring of the database-backed services shared by the HTTP server, the
//! scheduler and the sweep CLI.

use std::sync::Arc;
use std::time::Duration;

use sea_orm::DatabaseConnection;

use crate::db::services::firewall_service::FirewallSettings;
use crate::db::services::job_handlers::HandlerRegistry;
use crate::db::services::monitor_service::MonitorSettings;
use crate::db::services::{
    BackupScheduler, FirewallController, HeartbeatTracker, JobQueue, MonitorEngine, NodeAppMonitor,
    ProvisioningService, SslRenewalService, StatsRetention, TaskLeaseStore,
};
use crate::events::EventBus;
use crate::server::config::FleetConfig;

#[derive(Clone)]
pub struct CoreServices {
    pub db: Arc<DatabaseConnection>,
    pub config: Arc<FleetConfig>,
    pub events: EventBus,
    pub jobs: JobQueue,
    pub heartbeats: HeartbeatTracker,
    pub monitors: MonitorEngine,
    pub firewall: FirewallController,
    pub provisioning: ProvisioningService,
    pub node_apps: NodeAppMonitor,
    pub ssl: SslRenewalService,
    pub backups: BackupScheduler,
    pub stats: StatsRetention,
    pub leases: TaskLeaseStore,
}

impl CoreServices {
    pub fn new(db: DatabaseConnection, config: FleetConfig, events: EventBus) -> Self {
        Self::with_handlers(db, config, events, HandlerRegistry::with_defaults())
    }

    pub fn with_handlers(db: DatabaseConnection, config: FleetConfig, events: EventBus, handlers: HandlerRegistry) -> Self {
        let db = Arc::new(db);
        let config = Arc::new(config);

        let jobs = JobQueue::new(db.clone(), events.clone(), Arc::new(handlers), config.default_job_priority);
        let heartbeats = HeartbeatTracker::new(db.clone(), events.clone());
        let monitors = MonitorEngine::new(
            db.clone(),
            events.clone(),
            MonitorSettings {
                heartbeat_grace_multiplier: config.monitoring.heartbeat_grace_multiplier,
                concurrency: config.monitoring.monitor_concurrency,
                uptime_recalc_interval_secs: config.monitoring.uptime_recalc_interval_secs,
            },
        );
        let firewall = FirewallController::new(
            db.clone(),
            jobs.clone(),
            events.clone(),
            FirewallSettings {
                confirmation_timeout_secs: config.firewall.confirmation_timeout_secs,
                critical_ports: config.firewall.critical_ports.clone(),
                saas_url: config.saas_url.clone(),
            },
        );
        let provisioning = ProvisioningService::new(db.clone(), jobs.clone(), config.agent_token_ttl_days);
        let node_apps = NodeAppMonitor::new(
            db.clone(),
            jobs.clone(),
            events.clone(),
            config.monitoring.node_app_failure_threshold,
            Duration::from_secs(config.monitoring.node_app_timeout_seconds),
            config.monitoring.monitor_concurrency,
        );
        let ssl = SslRenewalService::new(db.clone(), jobs.clone(), config.ssl.renewal_window_days);
        let backups = BackupScheduler::new(db.clone(), jobs.clone());
        let stats = StatsRetention::new(
            db.clone(),
            config.retention.stats_retention_days,
            config.retention.service_stats_retention_hours,
        );
        let leases = TaskLeaseStore::new(db.clone());

        Self {
            db,
            config,
            events,
            jobs,
            heartbeats,
            monitors,
            firewall,
            provisioning,
            node_apps,
            ssl,
            backups,
            stats,
            leases,
        }
    }
}
