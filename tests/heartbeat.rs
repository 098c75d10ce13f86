mod support;

use chrono::{Duration, Utc};
use fleet_control::db::entities::{server, server_stat, service_stat};
use fleet_control::db::enums::ServerStatus;
use fleet_control::db::services::heartbeat_service::{HeartbeatStats, ServiceSample};
use fleet_control::events::FleetEvent;
use sea_orm::{ActiveModelTrait, EntityTrait, IntoActiveModel, PaginatorTrait, Set};
use support::NewServer;

#[tokio::test]
async fn server_that_never_reported_goes_offline_with_reason() {
    let services = support::services().await;
    let server = support::insert_server(&services.db, NewServer::default()).await;
    let mut events = services.events.subscribe();

    let report = services
        .heartbeats
        .check_stale_servers_at(5, None, Utc::now())
        .await
        .unwrap();
    assert_eq!(report.marked_offline, 1);

    let reloaded = server::Entity::find_by_id(server.id)
        .one(services.db.as_ref())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reloaded.status, ServerStatus::Offline);

    match events.try_recv().unwrap() {
        FleetEvent::ServerWentOffline {
            server_id,
            reason,
            last_heartbeat_at,
            ..
        } => {
            assert_eq!(server_id, server.id);
            assert_eq!(reason, "No heartbeat received for 5+ minutes.");
            assert!(last_heartbeat_at.is_none());
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn stale_sweep_is_idempotent_and_spares_recent_servers() {
    let services = support::services().await;
    let now = Utc::now();
    let stale = support::insert_server(
        &services.db,
        NewServer {
            last_heartbeat_at: Some(now - Duration::minutes(12)),
            ..Default::default()
        },
    )
    .await;
    let fresh = support::insert_server(
        &services.db,
        NewServer {
            last_heartbeat_at: Some(now - Duration::minutes(1)),
            ..Default::default()
        },
    )
    .await;

    let first = services.heartbeats.check_stale_servers_at(5, None, now).await.unwrap();
    assert_eq!(first.marked_offline, 1);
    let second = services.heartbeats.check_stale_servers_at(5, None, now).await.unwrap();
    assert_eq!(second.marked_offline, 0);

    let statuses: Vec<(i32, ServerStatus)> = server::Entity::find()
        .all(services.db.as_ref())
        .await
        .unwrap()
        .into_iter()
        .map(|s| (s.id, s.status))
        .collect();
    assert!(statuses.contains(&(stale.id, ServerStatus::Offline)));
    assert!(statuses.contains(&(fresh.id, ServerStatus::Active)));
}

#[tokio::test]
async fn heartbeat_records_stats_and_brings_server_back() {
    let services = support::services().await;
    let server = support::insert_server(
        &services.db,
        NewServer {
            status: ServerStatus::Offline,
            last_heartbeat_at: Some(Utc::now() - Duration::hours(1)),
            ..Default::default()
        },
    )
    .await;
    let mut events = services.events.subscribe();

    let stats = HeartbeatStats {
        cpu_percent: Some(12.5),
        memory_percent: Some(40.0),
        disk_percent: Some(55.0),
        load_1m: Some(0.4),
        services: vec![
            ServiceSample {
                name: "nginx".into(),
                is_running: true,
                cpu_percent: Some(1.0),
                memory_mb: Some(20.0),
            },
            ServiceSample {
                name: "mysql".into(),
                is_running: false,
                cpu_percent: None,
                memory_mb: None,
            },
        ],
        ..Default::default()
    };
    let now = Utc::now();
    let updated = services.heartbeats.record_heartbeat_at(server.id, stats, now).await.unwrap();

    assert_eq!(updated.status, ServerStatus::Active);
    assert_eq!(updated.cpu_percent, Some(12.5));
    assert!(updated.last_heartbeat_at.is_some());
    assert_eq!(server_stat::Entity::find().count(services.db.as_ref()).await.unwrap(), 1);
    assert_eq!(service_stat::Entity::find().count(services.db.as_ref()).await.unwrap(), 2);
    assert!(matches!(
        events.try_recv().unwrap(),
        FleetEvent::ServerReconnected { server_id, .. } if server_id == server.id
    ));
}

#[tokio::test]
async fn resource_alert_fires_once_until_recovery() {
    let services = support::services().await;
    let server = support::active_server(&services.db).await;
    let mut active = server.clone().into_active_model();
    active.disk_alert_threshold = Set(Some(90.0));
    active.update(services.db.as_ref()).await.unwrap();
    let mut events = services.events.subscribe();

    let full = || HeartbeatStats {
        disk_percent: Some(95.0),
        ..Default::default()
    };
    services.heartbeats.record_heartbeat(server.id, full()).await.unwrap();
    services.heartbeats.record_heartbeat(server.id, full()).await.unwrap();
    services
        .heartbeats
        .record_heartbeat(
            server.id,
            HeartbeatStats {
                disk_percent: Some(60.0),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(event.kind());
    }
    assert_eq!(kinds, vec!["resource_alert", "resource_recovered"]);
}

#[tokio::test]
async fn overlapping_heartbeats_raise_an_alert_once() {
    let services = support::services().await;
    let server = support::active_server(&services.db).await;
    let mut active = server.clone().into_active_model();
    active.memory_alert_threshold = Set(Some(80.0));
    active.update(services.db.as_ref()).await.unwrap();
    let mut events = services.events.subscribe();

    let hot = || HeartbeatStats {
        memory_percent: Some(97.0),
        ..Default::default()
    };
    let now = Utc::now();
    let (first, second) = tokio::join!(
        services.heartbeats.record_heartbeat_at(server.id, hot(), now),
        services.heartbeats.record_heartbeat_at(server.id, hot(), now),
    );
    assert!(first.unwrap().memory_alert_active);
    assert!(second.unwrap().memory_alert_active);

    let mut alerts = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, FleetEvent::ResourceAlert { .. }) {
            alerts += 1;
        }
    }
    assert_eq!(alerts, 1);
}
