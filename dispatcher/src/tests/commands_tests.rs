//! Tests for the command surface: validation, tier gates, batches, queue
//! control and sync reconciliation.

use super::helpers::{create_tenant, test_config, test_db};
use crate::commands::{
    BatchItem, BatchSpec, Commands, EndpointSpec, MonitorSpec, SyncRequest, TaskPatch, TaskSpec,
};
use crate::counter::ExecutionCounter;
use shared::model::{
    ExecutionStatus, MonitorScheduleType, MonitorStatus, PlanTier, ScheduleType,
};
use shared::utils::current_timestamp_millis;
use shared::DispatchError;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Notify;

fn commands(db: &Arc<tokio::sync::Mutex<crate::database::DispatcherDatabase>>) -> Commands {
    Commands::new(
        Arc::clone(db),
        ExecutionCounter::new(),
        test_config(),
        Arc::new(Notify::new()),
    )
}

fn once_spec(name: &str, url: &str, at: i64) -> TaskSpec {
    TaskSpec {
        name: name.to_string(),
        url: url.to_string(),
        method: "POST".to_string(),
        headers: BTreeMap::new(),
        body: None,
        schedule_type: ScheduleType::Once,
        cron_expression: None,
        scheduled_at: Some(at),
        queue: String::new(),
        timeout_ms: 30_000,
        retry_attempts: 3,
        expected_status_codes: None,
        expected_body_pattern: None,
        callback_url: None,
        alert_on_failure: true,
        muted: false,
        enabled: true,
    }
}

fn cron_spec(name: &str, expr: &str) -> TaskSpec {
    let mut spec = once_spec(name, "https://example.com/cron", 0);
    spec.schedule_type = ScheduleType::Cron;
    spec.cron_expression = Some(expr.to_string());
    spec.scheduled_at = None;
    spec
}

fn is_validation(error: &anyhow::Error) -> bool {
    matches!(
        error.downcast_ref::<DispatchError>(),
        Some(DispatchError::Validation { .. })
    )
}

#[tokio::test]
async fn test_create_task_validates_inputs() {
    let (_dir, db) = test_db().await;
    let now = current_timestamp_millis();
    let tenant = create_tenant(&db, PlanTier::Pro, now).await;
    let commands = commands(&db);

    // Private destinations are rejected.
    let spec = once_spec("t", "http://127.0.0.1/hook", now + 5000);
    assert!(is_validation(
        &commands.create_task(tenant.id, spec, now).await.unwrap_err()
    ));

    // A once task must be scheduled in the future.
    let spec = once_spec("t", "https://example.com", now - 1000);
    assert!(is_validation(
        &commands.create_task(tenant.id, spec, now).await.unwrap_err()
    ));

    // Retry attempts are bounded 0-10.
    let mut spec = once_spec("t", "https://example.com", now + 5000);
    spec.retry_attempts = 11;
    assert!(is_validation(
        &commands.create_task(tenant.id, spec, now).await.unwrap_err()
    ));

    // Malformed status code lists are rejected.
    let mut spec = once_spec("t", "https://example.com", now + 5000);
    spec.expected_status_codes = Some("200,nope".to_string());
    assert!(is_validation(
        &commands.create_task(tenant.id, spec, now).await.unwrap_err()
    ));

    // A valid spec lands with next_run_at set to its instant.
    let spec = once_spec("t", "https://example.com", now + 5000);
    let task = commands.create_task(tenant.id, spec, now).await.unwrap();
    assert_eq!(task.next_run_at, Some(now + 5000));
    assert_eq!(task.schedule_type, ScheduleType::Once);
}

#[tokio::test]
async fn test_free_tier_rejects_sub_hourly_cron() {
    let (_dir, db) = test_db().await;
    let now = current_timestamp_millis();
    let free = create_tenant(&db, PlanTier::Free, now).await;
    let commands = commands(&db);

    let error = commands
        .create_task(free.id, cron_spec("every5", "*/5 * * * *"), now)
        .await
        .unwrap_err();
    assert!(is_validation(&error));

    // Hourly is fine on the free tier.
    let task = commands
        .create_task(free.id, cron_spec("hourly", "0 * * * *"), now)
        .await
        .unwrap();
    assert_eq!(task.interval_minutes, Some(60));
    assert!(task.next_run_at.unwrap() > now);
}

#[tokio::test]
async fn test_pro_tier_allows_sub_hourly_cron() {
    let (_dir, db) = test_db().await;
    let now = current_timestamp_millis();
    let pro = create_tenant(&db, PlanTier::Pro, now).await;
    let commands = commands(&db);

    let task = commands
        .create_task(pro.id, cron_spec("every5", "*/5 * * * *"), now)
        .await
        .unwrap();
    assert_eq!(task.interval_minutes, Some(5));
}

#[tokio::test]
async fn test_cross_tenant_access_is_not_found() {
    let (_dir, db) = test_db().await;
    let now = current_timestamp_millis();
    let owner = create_tenant(&db, PlanTier::Pro, now).await;
    let other = {
        let mut db_guard = db.lock().await;
        db_guard
            .create_tenant("intruder", PlanTier::Pro, None, now)
            .await
            .unwrap()
    };

    let commands = commands(&db);
    let task = commands
        .create_task(owner.id, once_spec("t", "https://example.com", now + 5000), now)
        .await
        .unwrap();

    // The other tenant sees "not found", never "forbidden".
    let error = commands
        .soft_delete_task(other.id, task.id, now)
        .await
        .unwrap_err();
    assert!(matches!(
        error.downcast_ref::<DispatchError>(),
        Some(DispatchError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_update_task_recomputes_schedule() {
    let (_dir, db) = test_db().await;
    let now = current_timestamp_millis();
    let tenant = create_tenant(&db, PlanTier::Pro, now).await;
    let commands = commands(&db);

    let task = commands
        .create_task(tenant.id, cron_spec("job", "0 * * * *"), now)
        .await
        .unwrap();
    let original_next = task.next_run_at.unwrap();

    let patch = TaskPatch {
        cron_expression: Some(Some("*/5 * * * *".to_string())),
        ..Default::default()
    };
    let updated = commands
        .update_task(tenant.id, task.id, patch, now)
        .await
        .unwrap();

    assert_eq!(updated.interval_minutes, Some(5));
    assert!(updated.next_run_at.unwrap() <= original_next);
}

#[tokio::test]
async fn test_toggle_task_parks_and_restores() {
    let (_dir, db) = test_db().await;
    let now = current_timestamp_millis();
    let tenant = create_tenant(&db, PlanTier::Pro, now).await;
    let commands = commands(&db);

    let task = commands
        .create_task(tenant.id, cron_spec("job", "0 * * * *"), now)
        .await
        .unwrap();

    let disabled = commands.toggle_task(tenant.id, task.id, now).await.unwrap();
    assert!(!disabled.enabled);
    assert!(disabled.next_run_at.is_none());

    let enabled = commands.toggle_task(tenant.id, task.id, now).await.unwrap();
    assert!(enabled.enabled);
    assert!(enabled.next_run_at.unwrap() > now);
}

#[tokio::test]
async fn test_trigger_task_creates_due_execution() {
    let (_dir, db) = test_db().await;
    let now = current_timestamp_millis();
    let tenant = create_tenant(&db, PlanTier::Pro, now).await;
    let commands = commands(&db);

    let task = commands
        .create_task(tenant.id, cron_spec("job", "0 * * * *"), now)
        .await
        .unwrap();

    let execution = commands
        .trigger_task(tenant.id, task.id, None, now)
        .await
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Pending);
    assert_eq!(execution.scheduled_for, now);
    assert_eq!(execution.attempt, 1);

    // Triggering twice at the same instant still yields two executions.
    let second = commands
        .trigger_task(tenant.id, task.id, Some(now), now)
        .await
        .unwrap();
    assert_ne!(second.id, execution.id);
}

#[tokio::test]
async fn test_batch_respects_cap_atomically() {
    let (_dir, db) = test_db().await;
    let now = current_timestamp_millis();
    let tenant = create_tenant(&db, PlanTier::Free, now).await;

    // One short of the cap: a batch of two must be rejected whole.
    {
        let mut db_guard = db.lock().await;
        db_guard.add_execution_count(tenant.id, 9_999).await.unwrap();
    }

    let commands = commands(&db);
    let spec = BatchSpec {
        queue: Some("bulk".to_string()),
        scheduled_at: Some(now + 5000),
        method: "POST".to_string(),
        headers: BTreeMap::new(),
        body: None,
        timeout_ms: 30_000,
        retry_attempts: 0,
        callback_url: None,
        alert_on_failure: true,
        muted: false,
    };
    let items = vec![
        BatchItem {
            name: None,
            url: "https://example.com/1".to_string(),
            body: None,
        },
        BatchItem {
            name: None,
            url: "https://example.com/2".to_string(),
            body: None,
        },
    ];

    let error = commands
        .create_batch(tenant.id, spec.clone(), items.clone(), now)
        .await
        .unwrap_err();
    assert!(matches!(
        error.downcast_ref::<DispatchError>(),
        Some(DispatchError::LimitExceeded(_))
    ));

    // Nothing was created and the counter is untouched.
    let tasks = commands.list_tasks(tenant.id).await.unwrap();
    assert!(tasks.is_empty());
    let usage = commands.current_usage(tenant.id).await.unwrap();
    assert_eq!(usage, 9_999);

    // With one item it fits.
    let result = commands
        .create_batch(tenant.id, spec, items[..1].to_vec(), now)
        .await
        .unwrap();
    assert_eq!(result.count, 1);
    assert_eq!(result.queue, "bulk");
    assert_eq!(result.scheduled_for, now + 5000);
}

#[tokio::test]
async fn test_batch_size_limit() {
    let (_dir, db) = test_db().await;
    let now = current_timestamp_millis();
    let tenant = create_tenant(&db, PlanTier::Pro, now).await;
    let commands = commands(&db);

    let spec = BatchSpec {
        queue: None,
        scheduled_at: None,
        method: "POST".to_string(),
        headers: BTreeMap::new(),
        body: None,
        timeout_ms: 30_000,
        retry_attempts: 0,
        callback_url: None,
        alert_on_failure: true,
        muted: false,
    };
    let items: Vec<BatchItem> = (0..1001)
        .map(|i| BatchItem {
            name: None,
            url: format!("https://example.com/{}", i),
            body: None,
        })
        .collect();

    let error = commands
        .create_batch(tenant.id, spec, items, now)
        .await
        .unwrap_err();
    assert!(matches!(
        error.downcast_ref::<DispatchError>(),
        Some(DispatchError::BatchTooLarge { size: 1001, max: 1000 })
    ));
}

#[tokio::test]
async fn test_pause_resume_queue_controls_claims() {
    let (_dir, db) = test_db().await;
    let now = current_timestamp_millis();
    let tenant = create_tenant(&db, PlanTier::Pro, now).await;
    let commands = commands(&db);

    commands.pause_queue(tenant.id, "payments").await.unwrap();
    let states = commands.list_queue_states(tenant.id).await.unwrap();
    assert_eq!(states.len(), 1);
    assert!(states[0].paused);

    commands.resume_queue(tenant.id, "payments").await.unwrap();
    let states = commands.list_queue_states(tenant.id).await.unwrap();
    assert!(!states[0].paused);
}

#[tokio::test]
async fn test_cancel_by_queue_reports_count() {
    let (_dir, db) = test_db().await;
    let now = current_timestamp_millis();
    let tenant = create_tenant(&db, PlanTier::Pro, now).await;
    let commands = commands(&db);

    let spec = BatchSpec {
        queue: Some("doomed".to_string()),
        scheduled_at: Some(now + 5000),
        method: "POST".to_string(),
        headers: BTreeMap::new(),
        body: None,
        timeout_ms: 30_000,
        retry_attempts: 0,
        callback_url: None,
        alert_on_failure: true,
        muted: false,
    };
    let items: Vec<BatchItem> = (0..3)
        .map(|i| BatchItem {
            name: None,
            url: format!("https://example.com/{}", i),
            body: None,
        })
        .collect();
    commands
        .create_batch(tenant.id, spec, items, now)
        .await
        .unwrap();

    // Batch tasks are materialized by the scheduler; cancel before that
    // still soft-deletes them, with zero executions to cancel.
    let cancelled = commands
        .cancel_by_queue(tenant.id, "doomed", now)
        .await
        .unwrap();
    assert_eq!(cancelled, 0);
    assert!(commands.list_tasks(tenant.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_create_monitor_generates_token() {
    let (_dir, db) = test_db().await;
    let now = current_timestamp_millis();
    let tenant = create_tenant(&db, PlanTier::Free, now).await;
    let commands = commands(&db);

    let monitor = commands
        .create_monitor(
            tenant.id,
            MonitorSpec {
                name: "heartbeat".to_string(),
                schedule_type: MonitorScheduleType::Interval,
                interval_seconds: Some(3600),
                cron_expression: None,
                grace_period_seconds: 60,
                muted: false,
                enabled: true,
            },
            now,
        )
        .await
        .unwrap();

    assert_eq!(monitor.status, MonitorStatus::New);
    assert_eq!(monitor.ping_token.len(), 24);
    assert!(monitor.next_expected_at.is_none());
}

#[tokio::test]
async fn test_endpoint_slug_defaults_to_name() {
    let (_dir, db) = test_db().await;
    let now = current_timestamp_millis();
    let tenant = create_tenant(&db, PlanTier::Pro, now).await;
    let commands = commands(&db);

    let endpoint = commands
        .create_endpoint(
            tenant.id,
            EndpointSpec {
                name: "Stripe Hooks".to_string(),
                slug: None,
                forward_urls: vec!["https://example.com/hook".to_string()],
                use_queue: true,
                retry_attempts: 2,
                alert_on_failure: true,
                callback_url: None,
                on_failure_url: None,
                on_recovery_url: None,
                secret: None,
                enabled: true,
            },
            now,
        )
        .await
        .unwrap();
    assert_eq!(endpoint.slug, "stripe-hooks");

    // Too many forward URLs is a validation error.
    let error = commands
        .create_endpoint(
            tenant.id,
            EndpointSpec {
                name: "Big".to_string(),
                slug: None,
                forward_urls: (0..11)
                    .map(|i| format!("https://example.com/{}", i))
                    .collect(),
                use_queue: false,
                retry_attempts: 0,
                alert_on_failure: true,
                callback_url: None,
                on_failure_url: None,
                on_recovery_url: None,
                secret: None,
                enabled: true,
            },
            now,
        )
        .await
        .unwrap_err();
    assert!(is_validation(&error));
}

#[tokio::test]
async fn test_sync_reconciles_by_name() {
    let (_dir, db) = test_db().await;
    let now = current_timestamp_millis();
    let tenant = create_tenant(&db, PlanTier::Pro, now).await;
    let commands = commands(&db);

    // Seed: two tasks.
    commands
        .create_task(tenant.id, cron_spec("keep", "0 * * * *"), now)
        .await
        .unwrap();
    commands
        .create_task(tenant.id, cron_spec("drop", "0 * * * *"), now)
        .await
        .unwrap();

    // Declare: "keep" with a new schedule, plus a new "fresh"; delete the
    // rest.
    let request = SyncRequest {
        tasks: Some(vec![
            cron_spec("keep", "*/10 * * * *"),
            cron_spec("fresh", "0 0 * * *"),
        ]),
        monitors: None,
        endpoints: None,
        delete_removed: true,
    };
    let summary = commands.sync(tenant.id, request, now).await.unwrap();

    assert_eq!(summary.tasks.created, 1);
    assert_eq!(summary.tasks.updated, 1);
    assert_eq!(summary.tasks.deleted, 1);

    let tasks = commands.list_tasks(tenant.id).await.unwrap();
    let names: Vec<&str> = tasks.iter().map(|t| t.name.as_str()).collect();
    assert!(names.contains(&"keep"));
    assert!(names.contains(&"fresh"));
    assert!(!names.contains(&"drop"));

    let kept = tasks.iter().find(|t| t.name == "keep").unwrap();
    assert_eq!(kept.interval_minutes, Some(10));
}

#[tokio::test]
async fn test_trigger_disabled_task_is_rejected() {
    let (_dir, db) = test_db().await;
    let now = current_timestamp_millis();
    let tenant = create_tenant(&db, PlanTier::Pro, now).await;
    let commands = commands(&db);

    let mut spec = cron_spec("job", "0 * * * *");
    spec.enabled = false;
    let task = commands.create_task(tenant.id, spec, now).await.unwrap();

    assert!(commands
        .trigger_task(tenant.id, task.id, None, now)
        .await
        .is_err());
}
