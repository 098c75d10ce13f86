mod support;

use chrono::Utc;
use fleet_control::db::entities::server_ssh_key;
use fleet_control::db::enums::{JobStatus, ResourceStatus};
use fleet_control::db::services::job_handlers::{SSH_KEY_ADD, SSH_KEY_REMOVE};
use fleet_control::db::services::job_service::{ClaimOutcome, CompletionReport, JobError};
use fleet_control::events::FleetEvent;
use sea_orm::{ActiveModelTrait, EntityTrait, Set};
use serde_json::json;

#[tokio::test]
async fn ssh_key_add_round_trip_activates_the_pivot() {
    let services = support::services().await;
    let server = support::active_server(&services.db).await;
    let now = Utc::now();
    let pivot = server_ssh_key::ActiveModel {
        server_id: Set(server.id),
        ssh_key_id: Set(9),
        username: Set("deploy".to_string()),
        status: Set(ResourceStatus::Pending),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(services.db.as_ref())
    .await
    .unwrap();

    let job = services
        .jobs
        .enqueue_default(server.id, SSH_KEY_ADD, json!({ "key_id": 9, "public_key": "ssh-ed25519 AAAA", "username": "deploy" }))
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Pending);

    let fetched = services.jobs.fetch_pending(server.id).await.unwrap();
    assert_eq!(fetched.len(), 1);
    assert_eq!(fetched[0].id, job.id);
    assert_eq!(fetched[0].status, JobStatus::Queued);

    let claimed = match services.jobs.claim(job.id, server.id).await.unwrap() {
        ClaimOutcome::Claimed(job) => job,
        ClaimOutcome::AlreadyClaimed => panic!("first claim must win"),
    };
    assert_eq!(claimed.status, JobStatus::Running);
    assert!(claimed.started_at.is_some());

    let done = services
        .jobs
        .report_completion(
            job.id,
            server.id,
            CompletionReport {
                success: true,
                output: Some("key installed".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.exit_code, Some(0));

    let pivot = server_ssh_key::Entity::find_by_id(pivot.id)
        .one(services.db.as_ref())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pivot.status, ResourceStatus::Active);
}

#[tokio::test]
async fn only_one_concurrent_claim_wins() {
    let services = support::services().await;
    let server = support::active_server(&services.db).await;
    let job = services
        .jobs
        .enqueue_default(server.id, "custom_script", json!({}))
        .await
        .unwrap();

    let (a, b) = tokio::join!(
        services.jobs.claim(job.id, server.id),
        services.jobs.claim(job.id, server.id)
    );
    let outcomes = [a.unwrap(), b.unwrap()];
    let winners = outcomes
        .iter()
        .filter(|o| matches!(o, ClaimOutcome::Claimed(_)))
        .count();
    assert_eq!(winners, 1);

    let third = services.jobs.claim(job.id, server.id).await.unwrap();
    assert_eq!(third, ClaimOutcome::AlreadyClaimed);
}

#[tokio::test]
async fn jobs_of_other_servers_are_invisible() {
    let services = support::services().await;
    let owner = support::active_server(&services.db).await;
    let stranger = support::active_server(&services.db).await;
    let job = services
        .jobs
        .enqueue_default(owner.id, "custom_script", json!({}))
        .await
        .unwrap();

    assert!(services.jobs.fetch_pending(stranger.id).await.unwrap().is_empty());
    assert!(matches!(
        services.jobs.claim(job.id, stranger.id).await,
        Err(JobError::NotFound(_))
    ));
}

#[tokio::test]
async fn pending_jobs_come_out_by_priority_then_age() {
    let services = support::services().await;
    let server = support::active_server(&services.db).await;
    let low = services.jobs.enqueue(server.id, "a", json!({}), 9).await.unwrap();
    let high = services.jobs.enqueue(server.id, "b", json!({}), 1).await.unwrap();
    let mid = services.jobs.enqueue(server.id, "c", json!({}), 5).await.unwrap();

    let order: Vec<i32> = services
        .jobs
        .fetch_pending(server.id)
        .await
        .unwrap()
        .into_iter()
        .map(|j| j.id)
        .collect();
    assert_eq!(order, vec![high.id, mid.id, low.id]);
}

#[tokio::test]
async fn failed_completion_gets_default_error_and_can_be_retried() {
    let services = support::services().await;
    let server = support::active_server(&services.db).await;
    let job = services
        .jobs
        .enqueue_default(server.id, "custom_script", json!({}))
        .await
        .unwrap();
    services.jobs.claim(job.id, server.id).await.unwrap();

    let failed = services
        .jobs
        .report_completion(
            job.id,
            server.id,
            CompletionReport {
                success: false,
                exit_code: Some(2),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.exit_code, Some(2));
    assert_eq!(failed.error.as_deref(), Some("Job failed with exit code 2"));

    let retried = services.jobs.retry(job.id).await.unwrap();
    assert_eq!(retried.status, JobStatus::Pending);
    assert_eq!(retried.retry_count, 1);
    assert!(retried.error.is_none());
}

#[tokio::test]
async fn cancelled_jobs_reject_late_completions() {
    let services = support::services().await;
    let server = support::active_server(&services.db).await;
    let mut events = services.events.subscribe();
    let job = services
        .jobs
        .enqueue_default(server.id, "custom_script", json!({}))
        .await
        .unwrap();
    services.jobs.claim(job.id, server.id).await.unwrap();

    let cancelled = services.jobs.cancel(job.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);

    let late = services
        .jobs
        .report_completion(
            job.id,
            server.id,
            CompletionReport {
                success: true,
                ..Default::default()
            },
        )
        .await;
    assert!(matches!(late, Err(JobError::Cancelled(id)) if id == job.id));

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let FleetEvent::JobStatusChanged { to, .. } = event {
            seen.push(to);
        }
    }
    assert_eq!(seen, vec![JobStatus::Pending, JobStatus::Running, JobStatus::Cancelled]);
}

async fn installed_pivot(db: &sea_orm::DatabaseConnection, server_id: i32, username: &str) -> server_ssh_key::Model {
    let now = Utc::now();
    server_ssh_key::ActiveModel {
        server_id: Set(server_id),
        ssh_key_id: Set(9),
        username: Set(username.to_string()),
        status: Set(ResourceStatus::Active),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(db)
    .await
    .unwrap()
}

#[tokio::test]
async fn ssh_key_remove_matches_key_and_username() {
    let services = support::services().await;
    let server = support::active_server(&services.db).await;
    let deploy = installed_pivot(&services.db, server.id, "deploy").await;
    let root = installed_pivot(&services.db, server.id, "root").await;

    let job = services
        .jobs
        .enqueue_default(server.id, SSH_KEY_REMOVE, json!({ "key_id": 9, "username": "root" }))
        .await
        .unwrap();
    services.jobs.fetch_pending(server.id).await.unwrap();
    assert!(matches!(
        services.jobs.claim(job.id, server.id).await.unwrap(),
        ClaimOutcome::Claimed(_)
    ));
    services
        .jobs
        .report_completion(
            job.id,
            server.id,
            CompletionReport {
                success: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let db = services.db.as_ref();
    assert!(server_ssh_key::Entity::find_by_id(root.id).one(db).await.unwrap().is_none());
    assert!(server_ssh_key::Entity::find_by_id(deploy.id).one(db).await.unwrap().is_some());
}
