//! Tests for the worker dispatch path: assertion semantics, retry
//! scheduling, Retry-After override, host blocking and recovery emails.

use super::helpers::{
    create_tenant, start_mock_server, task_with_pending, test_config, test_db, worker_context,
    MockResponse,
};
use crate::database::EmailKind;
use crate::workers::{classify_for_tests, process_execution};
use shared::model::{ExecutionStatus, PlanTier, ScheduleType, Task};
use shared::utils::current_timestamp_millis;
use std::collections::BTreeMap;

fn assertion_task(expected_codes: Option<&str>, body_pattern: Option<&str>) -> Task {
    Task {
        id: 1,
        tenant_id: 1,
        name: "assert".to_string(),
        url: "https://example.com".to_string(),
        method: "GET".to_string(),
        headers: BTreeMap::new(),
        body: None,
        schedule_type: ScheduleType::Once,
        cron_expression: None,
        scheduled_at: Some(0),
        enabled: true,
        queue: String::new(),
        timeout_ms: 5000,
        retry_attempts: 0,
        expected_status_codes: expected_codes.map(str::to_string),
        expected_body_pattern: body_pattern.map(str::to_string),
        callback_url: None,
        alert_on_failure: true,
        muted: false,
        interval_minutes: None,
        next_run_at: None,
        inserted_at: 0,
        updated_at: 0,
        deleted_at: None,
        source_endpoint_id: None,
    }
}

#[test]
fn test_assertion_semantics() {
    // expected_status_codes="200,201": a 201 is success, a 204 is a
    // permanent failure.
    let task = assertion_task(Some("200,201"), None);
    assert_eq!(classify_for_tests(&task, Some(201), ""), "success");
    assert_eq!(classify_for_tests(&task, Some(204), ""), "permanent");

    // Without an expectation, any 2xx passes.
    let task = assertion_task(None, None);
    assert_eq!(classify_for_tests(&task, Some(204), ""), "success");
    assert_eq!(classify_for_tests(&task, Some(301), ""), "permanent");
}

#[test]
fn test_transient_status_classification() {
    let task = assertion_task(None, None);
    for code in [408, 425, 429, 500, 502, 503, 504] {
        assert_eq!(classify_for_tests(&task, Some(code), ""), "transient");
    }
    assert_eq!(classify_for_tests(&task, Some(404), ""), "permanent");
    // No response at all: network failure, transient.
    assert_eq!(classify_for_tests(&task, None, ""), "transient");
}

#[test]
fn test_body_pattern_assertion() {
    let task = assertion_task(None, Some("\"ok\":true"));
    assert_eq!(
        classify_for_tests(&task, Some(200), "{\"ok\":true}"),
        "success"
    );
    // Pattern missing on a 2xx: permanent, a retry won't change the body.
    assert_eq!(
        classify_for_tests(&task, Some(200), "{\"ok\":false}"),
        "permanent"
    );
}

#[tokio::test]
async fn test_retry_then_success_accounting() {
    let (_dir, db) = test_db().await;
    let now = current_timestamp_millis();
    let tenant = create_tenant(&db, PlanTier::Free, now).await;
    let server = start_mock_server(vec![
        MockResponse::with_status(500),
        MockResponse::with_status(200),
    ])
    .await;

    let (task, _execution_id) =
        task_with_pending(&db, tenant.id, &server.url(), "", 3, now).await;

    let config = test_config();
    let ctx = worker_context(&db, &config);

    // Attempt 1: the mock returns 500, transient, a retry is scheduled.
    let first = {
        let mut db_guard = db.lock().await;
        db_guard.claim_next_execution(now).await.unwrap().unwrap()
    };
    process_execution(&ctx, first).await.unwrap();

    // The retry sits in the future; claim it with a later clock.
    let later = current_timestamp_millis() + 2 * 60 * 60 * 1000;
    let second = {
        let mut db_guard = db.lock().await;
        db_guard.claim_next_execution(later).await.unwrap().unwrap()
    };
    assert_eq!(second.attempt, 2);
    process_execution(&ctx, second).await.unwrap();

    let mut db_guard = db.lock().await;
    let mut executions = db_guard
        .list_executions_for_task(tenant.id, task.id, 10)
        .await
        .unwrap();
    executions.sort_by_key(|e| e.attempt);

    assert_eq!(executions.len(), 2);
    assert_eq!(executions[0].attempt, 1);
    assert_eq!(executions[0].status, ExecutionStatus::Failed);
    assert_eq!(executions[0].status_code, Some(500));
    assert_eq!(executions[1].attempt, 2);
    assert_eq!(executions[1].status, ExecutionStatus::Success);
    assert_eq!(executions[1].status_code, Some(200));

    // Retry accounting: one logical run, one counter increment.
    assert_eq!(ctx.counter.pending_delta(tenant.id), 1);

    // The outbound requests carried the correlation headers.
    let hits = server.hits.lock().unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].headers.get("x-attempt").map(String::as_str), Some("1"));
    assert_eq!(hits[1].headers.get("x-attempt").map(String::as_str), Some("2"));
}

#[tokio::test]
async fn test_permanent_failure_does_not_retry() {
    let (_dir, db) = test_db().await;
    let now = current_timestamp_millis();
    let tenant = create_tenant(&db, PlanTier::Free, now).await;
    let server = start_mock_server(vec![MockResponse::with_status(404)]).await;

    let (task, _execution_id) =
        task_with_pending(&db, tenant.id, &server.url(), "", 5, now).await;

    let config = test_config();
    let ctx = worker_context(&db, &config);

    let claimed = {
        let mut db_guard = db.lock().await;
        db_guard.claim_next_execution(now).await.unwrap().unwrap()
    };
    process_execution(&ctx, claimed).await.unwrap();

    let mut db_guard = db.lock().await;
    let executions = db_guard
        .list_executions_for_task(tenant.id, task.id, 10)
        .await
        .unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, ExecutionStatus::Failed);
}

#[tokio::test]
async fn test_three_consecutive_5xx_block_host_and_defer() {
    let (_dir, db) = test_db().await;
    let now = current_timestamp_millis();
    let tenant = create_tenant(&db, PlanTier::Free, now).await;
    let server = start_mock_server(vec![
        MockResponse::with_status(500),
        MockResponse::with_status(500),
        MockResponse::with_status(500),
    ])
    .await;

    let config = test_config();
    let ctx = worker_context(&db, &config);

    // Three failures to the same host cross the threshold.
    for i in 0..3 {
        task_with_pending(&db, tenant.id, &server.url(), "", 0, now + i).await;
        let claimed = {
            let mut db_guard = db.lock().await;
            db_guard.claim_next_execution(now + 10).await.unwrap().unwrap()
        };
        process_execution(&ctx, claimed).await.unwrap();
    }

    // The next execution against the host is deferred, not dispatched.
    let (_task, execution_id) =
        task_with_pending(&db, tenant.id, &server.url(), "", 0, now + 10).await;
    let claimed = {
        let mut db_guard = db.lock().await;
        db_guard.claim_next_execution(now + 20).await.unwrap().unwrap()
    };
    process_execution(&ctx, claimed).await.unwrap();

    let mut db_guard = db.lock().await;
    let execution = db_guard.get_execution(execution_id).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Pending);
    assert!(execution.scheduled_for > current_timestamp_millis() - 1000);
    assert!(execution.started_at.is_none());

    // Only the three real dispatches reached the server.
    assert_eq!(server.hit_count(), 3);
}

#[tokio::test]
async fn test_retry_after_overrides_backoff() {
    let (_dir, db) = test_db().await;
    let now = current_timestamp_millis();
    let tenant = create_tenant(&db, PlanTier::Free, now).await;
    let server = start_mock_server(vec![MockResponse {
        status: 429,
        body: "slow down".to_string(),
        headers: vec![("Retry-After".to_string(), "120".to_string())],
    }])
    .await;

    let (task, _execution_id) =
        task_with_pending(&db, tenant.id, &server.url(), "", 2, now).await;

    let config = test_config();
    let ctx = worker_context(&db, &config);
    let claimed = {
        let mut db_guard = db.lock().await;
        db_guard.claim_next_execution(now).await.unwrap().unwrap()
    };
    process_execution(&ctx, claimed).await.unwrap();

    let mut db_guard = db.lock().await;
    let mut executions = db_guard
        .list_executions_for_task(tenant.id, task.id, 10)
        .await
        .unwrap();
    executions.sort_by_key(|e| e.attempt);
    assert_eq!(executions.len(), 2);

    // The retry is scheduled per the header, not the exponential backoff.
    let retry = &executions[1];
    let delay = retry.scheduled_for - executions[0].finished_at.unwrap();
    assert!(
        (118_000..=122_000).contains(&delay),
        "Retry-After delay was {}",
        delay
    );

    // A 429 also blocks the host for the requested window.
    let host = server.addr.ip().to_string();
    let blocked = ctx
        .blocker
        .blocked_until(tenant.id, &host, current_timestamp_millis())
        .await;
    assert!(blocked.is_some());
}

#[tokio::test]
async fn test_recovery_email_after_failure_then_success() {
    let (_dir, db) = test_db().await;
    let now = current_timestamp_millis();
    let tenant = create_tenant(&db, PlanTier::Free, now).await;
    let server = start_mock_server(vec![
        MockResponse::with_status(500),
        MockResponse::with_status(200),
    ])
    .await;

    task_with_pending(&db, tenant.id, &server.url(), "", 1, now).await;

    let config = test_config();
    let ctx = worker_context(&db, &config);

    let first = {
        let mut db_guard = db.lock().await;
        db_guard.claim_next_execution(now).await.unwrap().unwrap()
    };
    process_execution(&ctx, first).await.unwrap();

    let later = current_timestamp_millis() + 2 * 60 * 60 * 1000;
    let second = {
        let mut db_guard = db.lock().await;
        db_guard.claim_next_execution(later).await.unwrap().unwrap()
    };
    process_execution(&ctx, second).await.unwrap();

    let mut db_guard = db.lock().await;
    // The failure was retried, so no failure email; the success after a
    // failure enqueued a recovery email.
    let failures = db_guard
        .count_recent_emails(tenant.id, EmailKind::TaskFailure, 0)
        .await
        .unwrap();
    let recoveries = db_guard
        .count_recent_emails(tenant.id, EmailKind::TaskRecovery, 0)
        .await
        .unwrap();
    assert_eq!(failures, 0);
    assert_eq!(recoveries, 1);
}

#[tokio::test]
async fn test_final_failure_enqueues_alert_email() {
    let (_dir, db) = test_db().await;
    let now = current_timestamp_millis();
    let tenant = create_tenant(&db, PlanTier::Free, now).await;
    let server = start_mock_server(vec![MockResponse::with_status(500)]).await;

    // No retries: the first failure is final.
    task_with_pending(&db, tenant.id, &server.url(), "", 0, now).await;

    let config = test_config();
    let ctx = worker_context(&db, &config);
    let claimed = {
        let mut db_guard = db.lock().await;
        db_guard.claim_next_execution(now).await.unwrap().unwrap()
    };
    process_execution(&ctx, claimed).await.unwrap();

    let mut db_guard = db.lock().await;
    let failures = db_guard
        .count_recent_emails(tenant.id, EmailKind::TaskFailure, 0)
        .await
        .unwrap();
    assert_eq!(failures, 1);
}

#[tokio::test]
async fn test_response_body_is_truncated_for_storage() {
    let (_dir, db) = test_db().await;
    let now = current_timestamp_millis();
    let tenant = create_tenant(&db, PlanTier::Free, now).await;
    let big_body = "x".repeat(100 * 1024);
    let server = start_mock_server(vec![MockResponse {
        status: 200,
        body: big_body,
        headers: Vec::new(),
    }])
    .await;

    let (_task, execution_id) =
        task_with_pending(&db, tenant.id, &server.url(), "", 0, now).await;

    let config = test_config();
    let ctx = worker_context(&db, &config);
    let claimed = {
        let mut db_guard = db.lock().await;
        db_guard.claim_next_execution(now).await.unwrap().unwrap()
    };
    process_execution(&ctx, claimed).await.unwrap();

    let mut db_guard = db.lock().await;
    let execution = db_guard.get_execution(execution_id).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Success);
    let stored = execution.response_body.unwrap();
    assert!(stored.len() <= 4 * 1024);
}
