//! Tests for the store: claim protocol, queue FIFO, lifecycle updates and
//! purges.

use super::helpers::{create_tenant, once_task, task_with_pending, test_db};
use shared::model::{ExecutionStatus, PlanTier};
use shared::utils::current_timestamp_millis;
use std::collections::HashSet;
use std::sync::Arc;

#[tokio::test]
async fn test_create_pending_is_idempotent() {
    let (_dir, db) = test_db().await;
    let now = current_timestamp_millis();
    let tenant = create_tenant(&db, PlanTier::Free, now).await;
    let (task, _execution_id) = task_with_pending(&db, tenant.id, "https://example.com", "", 0, now).await;

    let mut db = db.lock().await;
    // Same (task, scheduled_for, attempt): the second insert is ignored.
    let duplicate = db
        .create_pending_execution(task.id, tenant.id, now, 1, None, now)
        .await
        .unwrap();
    assert!(duplicate.is_none());

    // A different attempt at the same instant is a separate row.
    let retry = db
        .create_pending_execution(task.id, tenant.id, now, 2, None, now)
        .await
        .unwrap();
    assert!(retry.is_some());
}

#[tokio::test]
async fn test_claim_transitions_to_running() {
    let (_dir, db) = test_db().await;
    let now = current_timestamp_millis();
    let tenant = create_tenant(&db, PlanTier::Free, now).await;
    let (_task, execution_id) =
        task_with_pending(&db, tenant.id, "https://example.com", "", 0, now).await;

    let mut db = db.lock().await;
    let claimed = db.claim_next_execution(now).await.unwrap().unwrap();
    assert_eq!(claimed.id, execution_id);
    assert_eq!(claimed.status, ExecutionStatus::Running);
    assert_eq!(claimed.started_at, Some(now));

    // The row is gone from the claimable set.
    assert!(db.claim_next_execution(now).await.unwrap().is_none());
}

#[tokio::test]
async fn test_claim_ignores_future_disabled_and_deleted() {
    let (_dir, db) = test_db().await;
    let now = current_timestamp_millis();
    let tenant = create_tenant(&db, PlanTier::Free, now).await;

    {
        let mut db = db.lock().await;

        // Future execution.
        let future_task = db
            .insert_task(&once_task(tenant.id, "https://example.com/f", now), now)
            .await
            .unwrap();
        db.create_pending_execution(future_task.id, tenant.id, now + 60_000, 1, None, now)
            .await
            .unwrap();

        // Disabled task.
        let mut disabled = once_task(tenant.id, "https://example.com/d", now);
        disabled.enabled = false;
        let disabled_task = db.insert_task(&disabled, now).await.unwrap();
        db.create_pending_execution(disabled_task.id, tenant.id, now, 1, None, now)
            .await
            .unwrap();

        assert!(db.claim_next_execution(now).await.unwrap().is_none());

        // Soft-deleted task: its pending work is cancelled with it.
        let deleted_task = db
            .insert_task(&once_task(tenant.id, "https://example.com/x", now), now)
            .await
            .unwrap();
        db.create_pending_execution(deleted_task.id, tenant.id, now, 1, None, now)
            .await
            .unwrap();
        db.soft_delete_task(tenant.id, deleted_task.id, now)
            .await
            .unwrap();

        assert!(db.claim_next_execution(now).await.unwrap().is_none());
    }
}

#[tokio::test]
async fn test_claim_exclusivity_under_concurrency() {
    let (_dir, db) = test_db().await;
    let now = current_timestamp_millis();
    let tenant = create_tenant(&db, PlanTier::Free, now).await;

    for i in 0..5 {
        task_with_pending(
            &db,
            tenant.id,
            &format!("https://example.com/{}", i),
            "",
            0,
            now,
        )
        .await;
    }

    // Ten concurrent claimers fight over five rows; every claim must be
    // unique and exactly five must succeed.
    let mut join_set = tokio::task::JoinSet::new();
    for _ in 0..10 {
        let db = Arc::clone(&db);
        join_set.spawn(async move {
            let mut db = db.lock().await;
            db.claim_next_execution(now).await.unwrap().map(|e| e.id)
        });
    }

    let mut claimed = Vec::new();
    while let Some(result) = join_set.join_next().await {
        if let Some(id) = result.unwrap() {
            claimed.push(id);
        }
    }

    assert_eq!(claimed.len(), 5);
    let unique: HashSet<i64> = claimed.iter().copied().collect();
    assert_eq!(unique.len(), 5);
}

#[tokio::test]
async fn test_queue_fifo_serializes_across_tasks() {
    let (_dir, db) = test_db().await;
    let now = current_timestamp_millis();
    let tenant = create_tenant(&db, PlanTier::Free, now).await;

    // A created strictly before B, same queue, both due.
    let (task_a, execution_a) =
        task_with_pending(&db, tenant.id, "https://example.com/a", "payments", 0, now).await;
    let (_task_b, execution_b) = task_with_pending(
        &db,
        tenant.id,
        "https://example.com/b",
        "payments",
        0,
        now + 1,
    )
    .await;

    let mut db = db.lock().await;

    // A is claimed first; while it runs, B is not claimable even though it
    // is due.
    let first = db.claim_next_execution(now + 10).await.unwrap().unwrap();
    assert_eq!(first.id, execution_a);
    assert_eq!(first.task_id, task_a.id);
    assert!(db.claim_next_execution(now + 10).await.unwrap().is_none());

    // Once A reaches a terminal state, B becomes claimable.
    db.finish_execution(
        execution_a,
        ExecutionStatus::Success,
        Some(200),
        None,
        None,
        now + 20,
    )
    .await
    .unwrap();

    let second = db.claim_next_execution(now + 30).await.unwrap().unwrap();
    assert_eq!(second.id, execution_b);
}

#[tokio::test]
async fn test_queueless_tasks_run_concurrently() {
    let (_dir, db) = test_db().await;
    let now = current_timestamp_millis();
    let tenant = create_tenant(&db, PlanTier::Free, now).await;

    task_with_pending(&db, tenant.id, "https://example.com/a", "", 0, now).await;
    task_with_pending(&db, tenant.id, "https://example.com/b", "", 0, now + 1).await;

    let mut db = db.lock().await;
    assert!(db.claim_next_execution(now + 10).await.unwrap().is_some());
    // No queue, no serialization: the second claim succeeds while the
    // first is still running.
    assert!(db.claim_next_execution(now + 10).await.unwrap().is_some());
}

#[tokio::test]
async fn test_paused_queue_blocks_claims() {
    let (_dir, db) = test_db().await;
    let now = current_timestamp_millis();
    let tenant = create_tenant(&db, PlanTier::Free, now).await;
    task_with_pending(&db, tenant.id, "https://example.com", "payments", 0, now).await;

    let mut db = db.lock().await;
    db.set_queue_paused(tenant.id, "payments", true).await.unwrap();
    assert!(db.claim_next_execution(now + 10).await.unwrap().is_none());

    db.set_queue_paused(tenant.id, "payments", false)
        .await
        .unwrap();
    assert!(db.claim_next_execution(now + 10).await.unwrap().is_some());
}

#[tokio::test]
async fn test_earlier_pending_blocks_even_when_scheduled_later() {
    let (_dir, db) = test_db().await;
    let now = current_timestamp_millis();
    let tenant = create_tenant(&db, PlanTier::Free, now).await;

    // A was created first but is scheduled in the future (e.g. pushed back
    // by a blocked host); B is due now. Queue order still holds: B waits.
    let mut new_a = once_task(tenant.id, "https://example.com/a", now);
    new_a.queue = "q".to_string();
    let mut new_b = once_task(tenant.id, "https://example.com/b", now);
    new_b.queue = "q".to_string();

    let mut db = db.lock().await;
    let task_a = db.insert_task(&new_a, now).await.unwrap();
    let task_b = db.insert_task(&new_b, now).await.unwrap();
    db.create_pending_execution(task_a.id, tenant.id, now + 60_000, 1, None, now)
        .await
        .unwrap();
    db.create_pending_execution(task_b.id, tenant.id, now, 1, None, now + 1)
        .await
        .unwrap();

    assert!(db.claim_next_execution(now + 10).await.unwrap().is_none());
}

#[tokio::test]
async fn test_finish_computes_duration_and_is_single_winner() {
    let (_dir, db) = test_db().await;
    let now = current_timestamp_millis();
    let tenant = create_tenant(&db, PlanTier::Free, now).await;
    let (_task, execution_id) =
        task_with_pending(&db, tenant.id, "https://example.com", "", 0, now).await;

    let mut db = db.lock().await;
    db.claim_next_execution(now).await.unwrap().unwrap();

    let recorded = db
        .finish_execution(
            execution_id,
            ExecutionStatus::Success,
            Some(200),
            Some("ok"),
            None,
            now + 450,
        )
        .await
        .unwrap();
    assert!(recorded);

    let execution = db.get_execution(execution_id).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Success);
    assert_eq!(execution.duration_ms, Some(450));
    assert_eq!(execution.finished_at, Some(now + 450));

    // A second terminal write loses: the row is no longer running.
    let second = db
        .finish_execution(
            execution_id,
            ExecutionStatus::Failed,
            Some(500),
            None,
            None,
            now + 900,
        )
        .await
        .unwrap();
    assert!(!second);
}

#[tokio::test]
async fn test_reschedule_returns_to_pending() {
    let (_dir, db) = test_db().await;
    let now = current_timestamp_millis();
    let tenant = create_tenant(&db, PlanTier::Free, now).await;
    let (_task, execution_id) =
        task_with_pending(&db, tenant.id, "https://example.com", "", 0, now).await;

    let mut db = db.lock().await;
    db.claim_next_execution(now).await.unwrap().unwrap();
    assert!(db
        .reschedule_execution(execution_id, now + 30_000)
        .await
        .unwrap());

    let execution = db.get_execution(execution_id).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Pending);
    assert_eq!(execution.scheduled_for, now + 30_000);
    assert!(execution.started_at.is_none());

    // Not claimable until its new instant.
    assert!(db.claim_next_execution(now + 10).await.unwrap().is_none());
    assert!(db
        .claim_next_execution(now + 31_000)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_orphan_sweep_promotes_to_timeout() {
    let (_dir, db) = test_db().await;
    let now = current_timestamp_millis();
    let tenant = create_tenant(&db, PlanTier::Free, now).await;
    // timeout_ms is 5000 in the fixture.
    let (_task, execution_id) =
        task_with_pending(&db, tenant.id, "https://example.com", "", 0, now).await;

    let mut db = db.lock().await;
    db.claim_next_execution(now).await.unwrap().unwrap();

    // Within timeout + slack: untouched.
    assert_eq!(db.sweep_orphan_executions(5000, now + 9000).await.unwrap(), 0);

    // Past started_at + timeout + slack: promoted.
    let swept = db
        .sweep_orphan_executions(5000, now + 10_001)
        .await
        .unwrap();
    assert_eq!(swept, 1);

    let execution = db.get_execution(execution_id).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Timeout);
    assert!(execution.finished_at.is_some());
}

#[tokio::test]
async fn test_cancel_queue_cancels_pending_and_soft_deletes() {
    let (_dir, db) = test_db().await;
    let now = current_timestamp_millis();
    let tenant = create_tenant(&db, PlanTier::Free, now).await;

    let (task_a, execution_a) =
        task_with_pending(&db, tenant.id, "https://example.com/a", "bulk", 0, now).await;
    task_with_pending(&db, tenant.id, "https://example.com/b", "bulk", 0, now + 1).await;

    let mut db = db.lock().await;
    let cancelled = db.cancel_queue(tenant.id, "bulk", now + 10).await.unwrap();
    assert_eq!(cancelled, 2);

    let execution = db.get_execution(execution_a).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Cancelled);

    // The tasks are soft-deleted and invisible to tenant-scoped reads.
    assert!(db.get_task(tenant.id, task_a.id).await.unwrap().is_none());
    assert!(db.claim_next_execution(now + 10).await.unwrap().is_none());
}

#[tokio::test]
async fn test_previous_terminal_status_skips_missed_and_cancelled() {
    let (_dir, db) = test_db().await;
    let now = current_timestamp_millis();
    let tenant = create_tenant(&db, PlanTier::Free, now).await;
    let (task, execution_a) =
        task_with_pending(&db, tenant.id, "https://example.com", "", 0, now).await;

    let mut db = db.lock().await;
    db.claim_next_execution(now).await.unwrap().unwrap();
    db.finish_execution(execution_a, ExecutionStatus::Failed, Some(500), None, None, now + 100)
        .await
        .unwrap();

    // A missed row lands after the failure; it must not mask it.
    db.create_missed_execution(task.id, tenant.id, now + 150, now + 200)
        .await
        .unwrap();

    let previous = db
        .previous_terminal_status(task.id, i64::MAX)
        .await
        .unwrap();
    assert_eq!(previous, Some(ExecutionStatus::Failed));
}

#[tokio::test]
async fn test_purges_respect_cutoffs() {
    let (_dir, db) = test_db().await;
    let now = current_timestamp_millis();
    let tenant = create_tenant(&db, PlanTier::Free, now).await;
    let (_task, execution_id) =
        task_with_pending(&db, tenant.id, "https://example.com", "", 0, now).await;

    let mut db = db.lock().await;
    db.claim_next_execution(now).await.unwrap().unwrap();
    db.finish_execution(execution_id, ExecutionStatus::Success, Some(200), None, None, now)
        .await
        .unwrap();

    // Cutoff before the row: kept.
    assert_eq!(db.purge_executions(tenant.id, now - 1000).await.unwrap(), 0);
    // Cutoff after the row: purged.
    assert_eq!(db.purge_executions(tenant.id, now + 1000).await.unwrap(), 1);
}

#[tokio::test]
async fn test_execution_stats_counts_by_status() {
    let (_dir, db) = test_db().await;
    let now = current_timestamp_millis();
    let tenant = create_tenant(&db, PlanTier::Free, now).await;
    let (task, execution_id) =
        task_with_pending(&db, tenant.id, "https://example.com", "", 0, now).await;

    let mut db = db.lock().await;
    db.create_missed_execution(task.id, tenant.id, now - 60_000, now)
        .await
        .unwrap();

    let stats = db.execution_stats().await.unwrap();
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.missed, 1);

    db.claim_next_execution(now).await.unwrap().unwrap();
    db.finish_execution(execution_id, ExecutionStatus::Success, Some(200), None, None, now)
        .await
        .unwrap();

    let stats = db.execution_stats().await.unwrap();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.success, 1);
}

#[tokio::test]
async fn test_monthly_counter_fold_and_reset() {
    let (_dir, db) = test_db().await;
    let now = current_timestamp_millis();
    let tenant = create_tenant(&db, PlanTier::Free, now).await;

    let mut db = db.lock().await;
    db.add_execution_count(tenant.id, 7).await.unwrap();
    db.add_execution_count(tenant.id, 3).await.unwrap();

    let stored = db.get_tenant(tenant.id).await.unwrap().unwrap();
    assert_eq!(stored.monthly_execution_count, 10);

    // Same month: nothing to reset.
    assert_eq!(db.reset_stale_monthly_counters(now).await.unwrap(), 0);

    // Far future (well into a later month): counter zeroed and stamped.
    let next_month = now + 40 * 24 * 60 * 60 * 1000;
    assert_eq!(db.reset_stale_monthly_counters(next_month).await.unwrap(), 1);
    let stored = db.get_tenant(tenant.id).await.unwrap().unwrap();
    assert_eq!(stored.monthly_execution_count, 0);
    assert_eq!(stored.monthly_execution_reset_at, next_month);
}
