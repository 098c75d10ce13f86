mod support;

use chrono::{Duration, Utc};
use fleet_control::db::entities::{agent_job, server};
use fleet_control::db::enums::{ServerStatus, StepStatus};
use fleet_control::db::services::job_handlers::PROVISION_STEP;
use fleet_control::db::services::provisioning_service::{
    DEFAULT_PLAN, ProvisioningError, ServerFacts, StepUpdate,
};
use fleet_control::server::core_services::CoreServices;
use sea_orm::{ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter};
use support::NewServer;

fn step(status: StepStatus) -> StepUpdate {
    StepUpdate {
        status,
        error_message: None,
        duration_seconds: Some(3),
    }
}

async fn pending_server(services: &CoreServices, token: &str) -> server::Model {
    support::insert_server(
        services.db.as_ref(),
        NewServer {
            status: ServerStatus::Pending,
            ip_address: None,
            provision_token: Some(token.to_string()),
            ..Default::default()
        },
    )
    .await
}

async fn server_status(services: &CoreServices, server_id: i32) -> ServerStatus {
    server::Entity::find_by_id(server_id)
        .one(services.db.as_ref())
        .await
        .unwrap()
        .unwrap()
        .status
}

#[tokio::test]
async fn callback_consumes_the_token_and_issues_an_agent_token() {
    let services = support::services().await;
    let srv = pending_server(&services, "prov-1").await;
    services.provisioning.seed_steps(srv.id).await.unwrap();
    let now = Utc::now();

    let registration = services
        .provisioning
        .provision_callback_at(
            "prov-1",
            ServerFacts {
                ip_address: Some("203.0.113.7".into()),
                os_name: Some("Ubuntu".into()),
                cpu_cores: Some(4),
                ..Default::default()
            },
            now,
        )
        .await
        .unwrap();
    assert_eq!(registration.server_id, srv.id);
    assert_eq!(registration.status, ServerStatus::Provisioning);
    assert_eq!(registration.agent_token.len(), 64);
    assert_eq!(registration.agent_token_expires_at, now + Duration::days(365));

    let stored = server::Entity::find_by_id(srv.id)
        .one(services.db.as_ref())
        .await
        .unwrap()
        .unwrap();
    assert!(stored.provision_token.is_none());
    assert_eq!(stored.ip_address.as_deref(), Some("203.0.113.7"));
    assert_eq!(stored.os_name.as_deref(), Some("Ubuntu"));
    assert!(stored.last_heartbeat_at.is_some());

    let reused = services.provisioning.provision_callback("prov-1", ServerFacts::default()).await;
    assert!(matches!(reused, Err(ProvisioningError::UnknownToken)));

    let authed = services
        .provisioning
        .authenticate_agent(&registration.agent_token, now)
        .await
        .unwrap();
    assert_eq!(authed.id, srv.id);
    let expired = services
        .provisioning
        .authenticate_agent(&registration.agent_token, now + Duration::days(366))
        .await;
    assert!(matches!(expired, Err(ProvisioningError::AgentTokenExpired)));
}

#[tokio::test]
async fn server_without_a_plan_goes_straight_to_active() {
    let services = support::services().await;
    pending_server(&services, "prov-2").await;

    let registration = services
        .provisioning
        .provision_callback("prov-2", ServerFacts::default())
        .await
        .unwrap();
    assert_eq!(registration.status, ServerStatus::Active);
}

#[tokio::test]
async fn finishing_every_step_activates_the_server() {
    let services = support::services().await;
    let srv = pending_server(&services, "prov-3").await;
    let steps = services.provisioning.seed_steps(srv.id).await.unwrap();
    assert_eq!(steps.len(), DEFAULT_PLAN.len());
    assert!(steps.windows(2).all(|w| w[0].sort_order < w[1].sort_order));
    // Seeding twice keeps the existing plan.
    assert_eq!(services.provisioning.seed_steps(srv.id).await.unwrap().len(), DEFAULT_PLAN.len());

    services
        .provisioning
        .provision_callback("prov-3", ServerFacts::default())
        .await
        .unwrap();

    let (last, rest) = steps.split_last().unwrap();
    for s in rest {
        services.provisioning.update_step(s.id, srv.id, step(StepStatus::InProgress)).await.unwrap();
        services.provisioning.update_step(s.id, srv.id, step(StepStatus::Completed)).await.unwrap();
    }
    assert_eq!(server_status(&services, srv.id).await, ServerStatus::Provisioning);

    let skipped = services
        .provisioning
        .update_step(last.id, srv.id, step(StepStatus::Skipped))
        .await
        .unwrap();
    assert!(skipped.completed_at.is_some());
    assert_eq!(server_status(&services, srv.id).await, ServerStatus::Active);
}

#[tokio::test]
async fn failed_step_fails_the_server_until_retried() {
    let services = support::services().await;
    let srv = pending_server(&services, "prov-4").await;
    let steps = services.provisioning.seed_steps(srv.id).await.unwrap();
    services
        .provisioning
        .provision_callback("prov-4", ServerFacts::default())
        .await
        .unwrap();

    let first = &steps[0];
    let started = services
        .provisioning
        .update_step(first.id, srv.id, step(StepStatus::InProgress))
        .await
        .unwrap();
    assert_eq!(started.attempts, 1);
    let failed = services
        .provisioning
        .update_step(first.id, srv.id, step(StepStatus::Failed))
        .await
        .unwrap();
    assert_eq!(failed.error_message.as_deref(), Some("Step failed without an error message"));

    assert_eq!(server_status(&services, srv.id).await, ServerStatus::Failed);

    let retried = services.provisioning.retry_step(first.id).await.unwrap();
    assert_eq!(retried.status, StepStatus::Pending);
    assert!(retried.error_message.is_none());
    assert_eq!(server_status(&services, srv.id).await, ServerStatus::Provisioning);

    let queued = agent_job::Entity::find()
        .filter(agent_job::Column::ServerId.eq(srv.id))
        .filter(agent_job::Column::JobType.eq(PROVISION_STEP))
        .count(services.db.as_ref())
        .await
        .unwrap();
    assert_eq!(queued, 1);
}

#[tokio::test]
async fn step_updates_are_checked() {
    let services = support::services().await;
    let srv = pending_server(&services, "prov-5").await;
    let other = support::active_server(services.db.as_ref()).await;
    let steps = services.provisioning.seed_steps(srv.id).await.unwrap();

    let skipped_ahead = services
        .provisioning
        .update_step(steps[0].id, srv.id, step(StepStatus::Completed))
        .await;
    assert!(matches!(skipped_ahead, Err(ProvisioningError::InvalidTransition(_))));

    let foreign = services
        .provisioning
        .update_step(steps[0].id, other.id, step(StepStatus::InProgress))
        .await;
    assert!(matches!(foreign, Err(ProvisioningError::StepNotFound(_))));

    let not_failed = services.provisioning.retry_step(steps[0].id).await;
    assert!(matches!(not_failed, Err(ProvisioningError::InvalidTransition(_))));
}
