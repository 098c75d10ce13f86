//! SeaORM entities, one module per table.

pub mod agent_job;
pub mod backup_schedule;
pub mod firewall_rule;
pub mod health_monitor;
pub mod monitor_check;
pub mod node_app;
pub mod provisioning_step;
pub mod server;
pub mod server_ssh_key;
pub mod server_stat;
pub mod service_stat;
pub mod ssl_certificate;
pub mod supervisor_program;
pub mod task_lease;

pub mod prelude {
    pub use super::agent_job::Entity as AgentJob;
    pub use super::backup_schedule::Entity as BackupSchedule;
    pub use super::firewall_rule::Entity as FirewallRule;
    pub use super::health_monitor::Entity as HealthMonitor;
    pub use super::monitor_check::Entity as MonitorCheck;
    pub use super::node_app::Entity as NodeApp;
    pub use super::provisioning_step::Entity as ProvisioningStep;
    pub use super::server::Entity as Server;
    pub use super::server_ssh_key::Entity as ServerSshKey;
    pub use super::server_stat::Entity as ServerStat;
    pub use super::service_stat::Entity as ServiceStat;
    pub use super::ssl_certificate::Entity as SslCertificate;
    pub use super::supervisor_program::Entity as SupervisorProgram;
    pub use super::task_lease::Entity as TaskLease;
}
