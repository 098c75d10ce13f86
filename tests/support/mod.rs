#![allow(dead_code)]

use std::net::SocketAddr;

use axum::{Router, http::StatusCode, routing::get};
use chrono::{DateTime, Utc};
use fleet_control::db::{self, entities::server, enums::ServerStatus};
use fleet_control::events::EventBus;
use fleet_control::server::config::FleetConfig;
use fleet_control::server::core_services::CoreServices;
use sea_orm::{ActiveModelTrait, DatabaseConnection, Set};

pub fn test_config() -> FleetConfig {
    FleetConfig {
        database_url: "sqlite::memory:".to_string(),
        saas_url: "https://fleet.example.com".to_string(),
        ..FleetConfig::default()
    }
}

pub async fn services() -> CoreServices {
    services_with(test_config()).await
}

pub async fn services_with(config: FleetConfig) -> CoreServices {
    let connection = db::connect(&config.database_url).await.unwrap();
    db::schema::sync(&connection).await.unwrap();
    CoreServices::new(connection, config, EventBus::new(64))
}

pub struct NewServer {
    pub status: ServerStatus,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub ip_address: Option<String>,
    pub provision_token: Option<String>,
    pub agent_token: Option<String>,
    pub agent_token_expires_at: Option<DateTime<Utc>>,
}

impl Default for NewServer {
    fn default() -> Self {
        Self {
            status: ServerStatus::Active,
            last_heartbeat_at: None,
            ip_address: Some("127.0.0.1".to_string()),
            provision_token: None,
            agent_token: None,
            agent_token_expires_at: None,
        }
    }
}

pub async fn insert_server(db: &DatabaseConnection, new: NewServer) -> server::Model {
    let now = Utc::now();
    server::ActiveModel {
        team_id: Set(1),
        name: Set("web-1".to_string()),
        ip_address: Set(new.ip_address),
        ssh_port: Set(22),
        agent_port: Set(None),
        status: Set(new.status),
        last_heartbeat_at: Set(new.last_heartbeat_at),
        provision_token: Set(new.provision_token),
        agent_token: Set(new.agent_token),
        agent_token_expires_at: Set(new.agent_token_expires_at),
        public_key: Set(None),
        os_name: Set(None),
        os_version: Set(None),
        cpu_cores: Set(None),
        memory_mb: Set(None),
        disk_gb: Set(None),
        cpu_percent: Set(None),
        memory_percent: Set(None),
        disk_percent: Set(None),
        load_1m: Set(None),
        load_alert_threshold: Set(None),
        memory_alert_threshold: Set(None),
        disk_alert_threshold: Set(None),
        load_alert_active: Set(false),
        memory_alert_active: Set(false),
        disk_alert_active: Set(false),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(db)
    .await
    .unwrap()
}

pub async fn active_server(db: &DatabaseConnection) -> server::Model {
    insert_server(
        db,
        NewServer {
            last_heartbeat_at: Some(Utc::now()),
            ..Default::default()
        },
    )
    .await
}

/// A local HTTP target: `/ok` answers 200, `/fail` answers 500.
pub async fn spawn_http_fixture() -> SocketAddr {
    let app = Router::new()
        .route("/ok", get(|| async { "healthy" }))
        .route("/fail", get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "broken") }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// A loopback port with nothing listening on it.
pub async fn closed_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}
