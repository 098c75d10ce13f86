pub mod backup_service;
pub mod firewall_service;
pub mod heartbeat_service;
pub mod job_handlers;
pub mod job_service;
pub mod lease_service;
pub mod monitor_service;
pub mod node_app_service;
pub mod provisioning_service;
pub mod ssl_service;
pub mod stats_service;

pub use backup_service::BackupScheduler;
pub use firewall_service::FirewallController;
pub use heartbeat_service::HeartbeatTracker;
pub use job_service::JobQueue;
pub use lease_service::TaskLeaseStore;
pub use monitor_service::MonitorEngine;
pub use node_app_service::NodeAppMonitor;
pub use provisioning_service::ProvisioningService;
pub use ssl_service::SslRenewalService;
pub use stats_service::StatsRetention;
