use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse TOML config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to load config from environment: {0}")]
    Env(#[from] envy::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct FleetConfig {
    pub database_url: String,
    pub listen_addr: String,
    /// Public base URL of the control plane, handed to agents and used in
    /// confirmation links.
    pub saas_url: String,
    pub log_dir: String,
    pub default_job_priority: i32,
    pub agent_token_ttl_days: i64,
    pub heartbeat: HeartbeatConfig,
    pub monitoring: MonitoringConfig,
    pub firewall: FirewallConfig,
    pub retention: RetentionConfig,
    pub ssl: SslConfig,
    pub scheduler: SchedulerConfig,
    pub notifications: NotificationConfig,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub offline_threshold_minutes: i64,
    pub agent_interval_seconds: u64,
    pub job_poll_interval_seconds: u64,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct MonitoringConfig {
    /// A heartbeat monitor is overdue after `interval_seconds * multiplier`.
    pub heartbeat_grace_multiplier: f64,
    pub monitor_concurrency: usize,
    pub uptime_recalc_interval_secs: i64,
    pub node_app_failure_threshold: i32,
    pub node_app_timeout_seconds: u64,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct FirewallConfig {
    pub confirmation_timeout_secs: i64,
    /// Ports whose blocking would cut the control plane off. Each server's own SSH
    /// and agent ports are always added on top.
    pub critical_ports: Vec<u16>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RetentionConfig {
    pub stats_retention_days: i64,
    pub service_stats_retention_hours: i64,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SslConfig {
    pub renewal_window_days: i64,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub lease_ttl_secs: i64,
    pub monitors_interval_secs: u64,
    pub node_apps_interval_secs: u64,
    pub heartbeats_interval_secs: u64,
    pub firewall_rollback_interval_secs: u64,
    pub ssl_renewal_interval_secs: u64,
    pub stats_cleanup_interval_secs: u64,
    pub service_stats_prune_interval_secs: u64,
    pub database_backups_interval_secs: u64,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct NotificationConfig {
    pub webhook_url: Option<String>,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://fleet-control.db?mode=rwc".to_string(),
            listen_addr: "0.0.0.0:8080".to_string(),
            saas_url: "http://localhost:8080".to_string(),
            log_dir: "logs".to_string(),
            default_job_priority: 5,
            agent_token_ttl_days: 365,
            heartbeat: HeartbeatConfig::default(),
            monitoring: MonitoringConfig::default(),
            firewall: FirewallConfig::default(),
            retention: RetentionConfig::default(),
            ssl: SslConfig::default(),
            scheduler: SchedulerConfig::default(),
            notifications: NotificationConfig::default(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            offline_threshold_minutes: 5,
            agent_interval_seconds: 60,
            job_poll_interval_seconds: 10,
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            heartbeat_grace_multiplier: 1.5,
            monitor_concurrency: 16,
            uptime_recalc_interval_secs: 300,
            node_app_failure_threshold: 3,
            node_app_timeout_seconds: 10,
        }
    }
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            confirmation_timeout_secs: 300,
            critical_ports: vec![22],
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            stats_retention_days: 30,
            service_stats_retention_hours: 72,
        }
    }
}

impl Default for SslConfig {
    fn default() -> Self {
        Self {
            renewal_window_days: 30,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lease_ttl_secs: 600,
            monitors_interval_secs: 30,
            node_apps_interval_secs: 60,
            heartbeats_interval_secs: 60,
            firewall_rollback_interval_secs: 30,
            ssl_renewal_interval_secs: 6 * 60 * 60,
            stats_cleanup_interval_secs: 24 * 60 * 60,
            service_stats_prune_interval_secs: 60 * 60,
            database_backups_interval_secs: 60,
        }
    }
}

/// Flat `FLEET_*` environment overrides, applied on top of the file.
#[derive(Deserialize, Default, Debug)]
struct EnvOverrides {
    database_url: Option<String>,
    listen_addr: Option<String>,
    saas_url: Option<String>,
    log_dir: Option<String>,
    default_job_priority: Option<i32>,
    offline_threshold_minutes: Option<i64>,
    confirmation_timeout_secs: Option<i64>,
    critical_ports: Option<Vec<u16>>,
    webhook_url: Option<String>,
    stats_retention_days: Option<i64>,
    lease_ttl_secs: Option<i64>,
    scheduler_enabled: Option<bool>,
}

impl FleetConfig {
    /// Loads `.env`, then the optional TOML file, then `FLEET_*` overrides.
    pub fn load(config_path: Option<&str>) -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let mut config = match config_path {
            Some(path_str) if Path::new(path_str).exists() => {
                let contents = fs::read_to_string(path_str).map_err(|source| ConfigError::Read {
                    path: path_str.to_string(),
                    source,
                })?;
                Self::from_toml_str(&contents)?
            }
            _ => FleetConfig::default(),
        };

        let overrides = envy::prefixed("FLEET_").from_env::<EnvOverrides>()?;
        config.apply_overrides(overrides);
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    fn apply_overrides(&mut self, env: EnvOverrides) {
        if let Some(v) = env.database_url {
            self.database_url = v;
        }
        if let Some(v) = env.listen_addr {
            self.listen_addr = v;
        }
        if let Some(v) = env.saas_url {
            self.saas_url = v;
        }
        if let Some(v) = env.log_dir {
            self.log_dir = v;
        }
        if let Some(v) = env.default_job_priority {
            self.default_job_priority = v;
        }
        if let Some(v) = env.offline_threshold_minutes {
            self.heartbeat.offline_threshold_minutes = v;
        }
        if let Some(v) = env.confirmation_timeout_secs {
            self.firewall.confirmation_timeout_secs = v;
        }
        if let Some(v) = env.critical_ports {
            self.firewall.critical_ports = v;
        }
        if env.webhook_url.is_some() {
            self.notifications.webhook_url = env.webhook_url;
        }
        if let Some(v) = env.stats_retention_days {
            self.retention.stats_retention_days = v;
        }
        if let Some(v) = env.lease_ttl_secs {
            self.scheduler.lease_ttl_secs = v;
        }
        if let Some(v) = env.scheduler_enabled {
            self.scheduler.enabled = v;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_addr
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::Invalid(format!("listen_addr '{}': {e}", self.listen_addr)))?;

        if self.heartbeat.offline_threshold_minutes < 1 {
            return Err(ConfigError::Invalid(
                "heartbeat.offline_threshold_minutes must be at least 1".into(),
            ));
        }
        if self.firewall.confirmation_timeout_secs < 1 {
            return Err(ConfigError::Invalid(
                "firewall.confirmation_timeout_secs must be at least 1".into(),
            ));
        }
        // Rollback latency is bounded by timeout + one sweep interval.
        let rollback = self.scheduler.firewall_rollback_interval_secs;
        if rollback == 0 || rollback > 60 {
            return Err(ConfigError::Invalid(
                "scheduler.firewall_rollback_interval_secs must be between 1 and 60".into(),
            ));
        }
        if self.monitoring.monitor_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "monitoring.monitor_concurrency must be at least 1".into(),
            ));
        }
        if self.monitoring.heartbeat_grace_multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "monitoring.heartbeat_grace_multiplier must be at least 1.0".into(),
            ));
        }
        if self.scheduler.lease_ttl_secs < 1 {
            return Err(ConfigError::Invalid("scheduler.lease_ttl_secs must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = FleetConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.firewall.confirmation_timeout_secs, 300);
        assert_eq!(config.firewall.critical_ports, vec![22]);
        assert_eq!(config.heartbeat.offline_threshold_minutes, 5);
    }

    #[test]
    fn partial_toml_keeps_defaults_for_missing_fields() {
        let config = FleetConfig::from_toml_str(
            r#"
            saas_url = "https://panel.example.com"

            [firewall]
            critical_ports = [22, 2222, 8443]

            [heartbeat]
            offline_threshold_minutes = 10
            "#,
        )
        .unwrap();

        assert_eq!(config.saas_url, "https://panel.example.com");
        assert_eq!(config.firewall.critical_ports, vec![22, 2222, 8443]);
        assert_eq!(config.firewall.confirmation_timeout_secs, 300);
        assert_eq!(config.heartbeat.offline_threshold_minutes, 10);
        assert_eq!(config.heartbeat.agent_interval_seconds, 60);
    }

    #[test]
    fn environment_overrides_win_over_file() {
        let mut config = FleetConfig::default();
        config.apply_overrides(EnvOverrides {
            saas_url: Some("https://override.example.com".into()),
            critical_ports: Some(vec![22, 9000]),
            offline_threshold_minutes: Some(3),
            ..Default::default()
        });
        assert_eq!(config.saas_url, "https://override.example.com");
        assert_eq!(config.firewall.critical_ports, vec![22, 9000]);
        assert_eq!(config.heartbeat.offline_threshold_minutes, 3);
    }

    #[test]
    fn rollback_sweep_slower_than_a_minute_is_rejected() {
        let mut config = FleetConfig::default();
        config.scheduler.firewall_rollback_interval_secs = 120;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn unreadable_toml_is_a_parse_error() {
        let err = FleetConfig::from_toml_str("saas_url = [").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn load_reads_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.toml");
        fs::write(&path, "log_dir = \"/var/log/fleet\"\n").unwrap();
        let config = FleetConfig::load(path.to_str()).unwrap();
        assert_eq!(config.log_dir, "/var/log/fleet");
    }
}
