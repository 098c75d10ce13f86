mod support;

use chrono::{Duration, Utc};
use fleet_control::db::entities::monitor_check;
use fleet_control::db::enums::{MonitorStatus, MonitorType};
use fleet_control::db::services::monitor_service::{CheckOutcome, NewMonitor, SkipReason};
use fleet_control::events::FleetEvent;
use fleet_control::state::MonitorTransition;
use sea_orm::{ActiveModelTrait, EntityTrait, IntoActiveModel, PaginatorTrait, Set};

fn monitor(name: &str, monitor_type: MonitorType, target: String) -> NewMonitor {
    NewMonitor {
        team_id: 1,
        server_id: None,
        name: name.to_string(),
        monitor_type,
        check_target: target,
        http_method: None,
        expected_status: None,
        expected_content: None,
        interval_seconds: Some(60),
        timeout_seconds: Some(2),
        failure_threshold: Some(2),
        recovery_threshold: Some(2),
        ssl_expiry_days_warning: None,
    }
}

fn drain_kinds(rx: &mut tokio::sync::broadcast::Receiver<FleetEvent>) -> Vec<&'static str> {
    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        kinds.push(event.kind());
    }
    kinds
}

#[tokio::test]
async fn http_monitor_goes_down_after_two_failures_and_notifies_once() {
    let services = support::services().await;
    let addr = support::spawn_http_fixture().await;
    let created = services
        .monitors
        .create(monitor("api", MonitorType::Http, format!("http://{addr}/fail")))
        .await
        .unwrap();
    let mut events = services.events.subscribe();

    let first = services.monitors.check_monitor(created.id).await.unwrap();
    assert!(matches!(
        first,
        CheckOutcome::Recorded { status: MonitorStatus::Pending, success: false, transition: None }
    ));

    let second = services.monitors.check_monitor(created.id).await.unwrap();
    assert!(matches!(
        second,
        CheckOutcome::Recorded {
            status: MonitorStatus::Down,
            transition: Some(MonitorTransition::WentDown),
            ..
        }
    ));

    services.monitors.check_monitor(created.id).await.unwrap();
    assert_eq!(drain_kinds(&mut events), vec!["monitor_down"]);

    let stored = services.monitors.get(created.id).await.unwrap();
    assert_eq!(stored.status, MonitorStatus::Down);
    assert_eq!(stored.consecutive_failures, 3);
    assert!(stored.last_down_at.is_some());
    assert!(stored.last_error.unwrap().contains("500"));
    assert_eq!(monitor_check::Entity::find().count(services.db.as_ref()).await.unwrap(), 3);
}

#[tokio::test]
async fn recovery_needs_consecutive_successes() {
    let services = support::services().await;
    let addr = support::spawn_http_fixture().await;
    let created = services
        .monitors
        .create(monitor("site", MonitorType::Http, format!("http://{addr}/fail")))
        .await
        .unwrap();
    services.monitors.check_monitor(created.id).await.unwrap();
    services.monitors.check_monitor(created.id).await.unwrap();

    let mut active = services.monitors.get(created.id).await.unwrap().into_active_model();
    active.check_target = Set(format!("http://{addr}/ok"));
    active.update(services.db.as_ref()).await.unwrap();
    let mut events = services.events.subscribe();

    let one = services.monitors.check_monitor(created.id).await.unwrap();
    assert!(matches!(one, CheckOutcome::Recorded { status: MonitorStatus::Down, success: true, .. }));
    let two = services.monitors.check_monitor(created.id).await.unwrap();
    assert!(matches!(
        two,
        CheckOutcome::Recorded {
            status: MonitorStatus::Up,
            transition: Some(MonitorTransition::Recovered),
            ..
        }
    ));
    assert_eq!(drain_kinds(&mut events), vec!["monitor_recovered"]);
}

#[tokio::test]
async fn tcp_monitor_against_closed_port_fails() {
    let services = support::services().await;
    let port = support::closed_port().await;
    let created = services
        .monitors
        .create(monitor("db", MonitorType::Tcp, format!("127.0.0.1:{port}")))
        .await
        .unwrap();

    let outcome = services.monitors.check_monitor(created.id).await.unwrap();
    assert!(matches!(outcome, CheckOutcome::Recorded { success: false, .. }));
}

#[tokio::test]
async fn sweep_only_checks_due_monitors() {
    let services = support::services().await;
    let addr = support::spawn_http_fixture().await;
    services
        .monitors
        .create(monitor("ok", MonitorType::Http, format!("http://{addr}/ok")))
        .await
        .unwrap();
    let now = Utc::now();

    let first = services.monitors.sweep_at(None, now).await.unwrap();
    assert_eq!(first.checked, 1);
    assert_eq!(first.up, 1);
    assert_eq!(first.uptime_recalculated, 1);

    let again = services.monitors.sweep_at(None, now + Duration::seconds(10)).await.unwrap();
    assert_eq!(again.checked, 0);

    let later = services.monitors.sweep_at(None, now + Duration::seconds(61)).await.unwrap();
    assert_eq!(later.checked, 1);
}

#[tokio::test]
async fn heartbeat_monitor_goes_down_when_pings_stop_and_recovers_on_ping() {
    let services = support::services().await;
    let mut new = monitor("nightly-backup", MonitorType::Heartbeat, String::new());
    new.failure_threshold = Some(1);
    new.recovery_threshold = Some(1);
    let created = services.monitors.create(new).await.unwrap();
    let token = created.heartbeat_token.clone().unwrap();

    // Grace is 60s * 1.5 from creation.
    let early = services
        .monitors
        .check_loaded(created.clone(), created.created_at + Duration::seconds(80))
        .await
        .unwrap();
    assert_eq!(early, CheckOutcome::Skipped(SkipReason::NotDue));

    let late = services
        .monitors
        .check_loaded(created.clone(), created.created_at + Duration::seconds(100))
        .await
        .unwrap();
    assert!(matches!(late, CheckOutcome::Recorded { status: MonitorStatus::Down, .. }));

    let ping = services
        .monitors
        .record_heartbeat_ping_at(&token, created.created_at + Duration::seconds(120))
        .await
        .unwrap();
    assert!(matches!(
        ping,
        CheckOutcome::Recorded {
            status: MonitorStatus::Up,
            transition: Some(MonitorTransition::Recovered),
            ..
        }
    ));
}

#[tokio::test]
async fn stale_version_discards_the_result() {
    let services = support::services().await;
    let addr = support::spawn_http_fixture().await;
    let created = services
        .monitors
        .create(monitor("raced", MonitorType::Http, format!("http://{addr}/ok")))
        .await
        .unwrap();

    // Someone else writes first, bumping the version.
    services.monitors.pause(created.id).await.unwrap();
    services.monitors.resume(created.id).await.unwrap();

    let outcome = services
        .monitors
        .apply_result(&created, fleet_control::monitoring::probe::ProbeResult::up(5), Utc::now())
        .await
        .unwrap();
    assert_eq!(outcome, CheckOutcome::Skipped(SkipReason::StaleVersion));
    assert_eq!(monitor_check::Entity::find().count(services.db.as_ref()).await.unwrap(), 0);

    let paused = services.monitors.pause(created.id).await.unwrap();
    assert_eq!(paused.status, MonitorStatus::Paused);
    let skipped = services.monitors.check_loaded(paused, Utc::now()).await.unwrap();
    assert_eq!(skipped, CheckOutcome::Skipped(SkipReason::Paused));
}
