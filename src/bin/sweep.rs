use std::process::ExitCode;

use clap::{Parser, Subcommand};
use fleet_control::db;
use fleet_control::events::EventBus;
use fleet_control::server::config::FleetConfig;
use fleet_control::server::core_services::CoreServices;
use fleet_control::server::logging::init_logging;
use fleet_control::sweeps::{EXIT_FAILURE, SweepKind, SweepOverrides, run_sweep_for_exit};
use fleet_control::version::VERSION;
use tracing::error;

#[derive(Parser, Debug)]
#[command(name = "fleet-sweep", version = VERSION, about = "Run one fleet sweep and exit")]
struct Cli {
    #[arg(short, long, default_value = "fleet-control.toml")]
    config: String,
    #[command(subcommand)]
    sweep: SweepCommand,
}

#[derive(Subcommand, Debug)]
enum SweepCommand {
    /// Probe due health monitors.
    Monitors {
        #[arg(long)]
        monitor_id: Option<i32>,
    },
    /// Health-check running Node.js apps.
    NodeApps {
        #[arg(long)]
        app_id: Option<i32>,
    },
    /// Mark servers without recent heartbeats offline.
    Heartbeats {
        #[arg(long)]
        server_id: Option<i32>,
        #[arg(long)]
        threshold_minutes: Option<i64>,
    },
    /// Roll back unconfirmed critical firewall rules.
    FirewallRollback {
        #[arg(long)]
        rule_id: Option<i32>,
    },
    /// Queue renewals for certificates about to expire.
    SslRenewal {
        #[arg(long)]
        certificate_id: Option<i32>,
    },
    /// Delete old server stats and monitor checks.
    StatsCleanup {
        #[arg(long)]
        days: Option<i64>,
    },
    /// Delete old per-service stats.
    ServiceStatsPrune {
        #[arg(long)]
        hours: Option<i64>,
    },
    /// Queue due database backups.
    DatabaseBackups {
        #[arg(long)]
        schedule_id: Option<i32>,
    },
}

impl SweepCommand {
    fn into_parts(self) -> (SweepKind, SweepOverrides) {
        let targeted = |target_id| SweepOverrides {
            target_id,
            ..Default::default()
        };
        match self {
            SweepCommand::Monitors { monitor_id } => (SweepKind::Monitors, targeted(monitor_id)),
            SweepCommand::NodeApps { app_id } => (SweepKind::NodeApps, targeted(app_id)),
            SweepCommand::Heartbeats {
                server_id,
                threshold_minutes,
            } => (
                SweepKind::Heartbeats,
                SweepOverrides {
                    target_id: server_id,
                    threshold_minutes,
                    ..Default::default()
                },
            ),
            SweepCommand::FirewallRollback { rule_id } => (SweepKind::FirewallRollback, targeted(rule_id)),
            SweepCommand::SslRenewal { certificate_id } => (SweepKind::SslRenewal, targeted(certificate_id)),
            SweepCommand::StatsCleanup { days } => (
                SweepKind::StatsCleanup,
                SweepOverrides {
                    days,
                    ..Default::default()
                },
            ),
            SweepCommand::ServiceStatsPrune { hours } => (
                SweepKind::ServiceStatsPrune,
                SweepOverrides {
                    hours,
                    ..Default::default()
                },
            ),
            SweepCommand::DatabaseBackups { schedule_id } => (SweepKind::DatabaseBackups, targeted(schedule_id)),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match FleetConfig::load(Some(cli.config.as_str())) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("fleet-sweep: {e}");
            return ExitCode::from(EXIT_FAILURE as u8);
        }
    };
    let _log_guard = init_logging(&config.log_dir, "fleet-sweep.log");

    let connection = match db::connect(&config.database_url).await {
        Ok(connection) => connection,
        Err(e) => {
            error!(error = %e, "Database unreachable.");
            return ExitCode::from(EXIT_FAILURE as u8);
        }
    };
    if let Err(e) = db::schema::sync(&connection).await {
        error!(error = %e, "Failed to prepare database schema.");
        return ExitCode::from(EXIT_FAILURE as u8);
    }

    let services = CoreServices::new(connection, config, EventBus::default());
    let (kind, overrides) = cli.sweep.into_parts();
    let code = run_sweep_for_exit(&services, kind, overrides).await;
    ExitCode::from(code as u8)
}
