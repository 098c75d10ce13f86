use std::error::Error;
use std::net::SocketAddr;

use clap::Parser;
use fleet_control::db;
use fleet_control::events::EventBus;
use fleet_control::notifications::NotificationDispatcher;
use fleet_control::scheduler;
use fleet_control::server::config::FleetConfig;
use fleet_control::server::core_services::CoreServices;
use fleet_control::server::logging::init_logging;
use fleet_control::version::VERSION;
use fleet_control::web::create_axum_router;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "fleet-control", version = VERSION, about = "Fleet control plane: agent API, monitors and sweeps")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "fleet-control.toml")]
    config: String,
    /// Overrides `listen_addr` from the configuration.
    #[arg(long)]
    listen: Option<String>,
    /// Serve the API only; leave periodic sweeps to another instance or to cron.
    #[arg(long)]
    no_scheduler: bool,
}

async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal.");
        return;
    }
    info!("Shutdown signal received.");
    let _ = shutdown_tx.send(true);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let mut config = FleetConfig::load(Some(cli.config.as_str()))?;
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }

    let _log_guard = init_logging(&config.log_dir, "fleet-control.log");
    info!(version = VERSION, "Starting fleet control plane...");

    let connection = db::connect(&config.database_url).await?;
    db::schema::sync(&connection).await?;

    let events = EventBus::default();
    let services = CoreServices::new(connection, config.clone(), events.clone());

    match NotificationDispatcher::from_config(&config.notifications) {
        Ok(dispatcher) => {
            dispatcher.spawn(&events);
        }
        Err(e) => warn!(error = %e, "Notification webhook disabled."),
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweep_tasks = if config.scheduler.enabled && !cli.no_scheduler {
        scheduler::spawn_all(&services, shutdown_rx.clone())
    } else {
        info!("Scheduler disabled; sweeps must be run externally.");
        Vec::new()
    };

    let addr: SocketAddr = config.listen_addr.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server listening.");

    axum::serve(listener, create_axum_router(services))
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await?;

    for task in sweep_tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "Sweep loop ended abnormally.");
        }
    }
    info!("Fleet control plane stopped.");
    Ok(())
}
