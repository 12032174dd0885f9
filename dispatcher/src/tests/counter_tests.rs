//! Tests for the sharded execution counter

use super::helpers::{create_tenant, test_db};
use crate::counter::ExecutionCounter;
use shared::model::PlanTier;
use shared::utils::current_timestamp_millis;

#[test]
fn test_increment_and_delta() {
    let counter = ExecutionCounter::new();
    assert_eq!(counter.pending_delta(1), 0);

    counter.increment(1);
    counter.increment(1);
    counter.increment(2);

    assert_eq!(counter.pending_delta(1), 2);
    assert_eq!(counter.pending_delta(2), 1);
    assert_eq!(counter.pending_delta(3), 0);
}

#[test]
fn test_drain_empties_and_restore_returns() {
    let counter = ExecutionCounter::new();
    counter.increment(1);
    counter.increment(1);
    counter.increment(42);

    let drained = counter.drain();
    assert_eq!(drained.get(&1), Some(&2));
    assert_eq!(drained.get(&42), Some(&1));
    assert_eq!(counter.pending_delta(1), 0);
    assert_eq!(counter.pending_delta(42), 0);

    // A failed flush puts the deltas back.
    counter.restore(drained);
    assert_eq!(counter.pending_delta(1), 2);
    assert_eq!(counter.pending_delta(42), 1);
}

#[test]
fn test_concurrent_increments_are_not_lost() {
    let counter = ExecutionCounter::new();
    let mut handles = Vec::new();
    for _ in 0..8 {
        let counter = counter.clone();
        handles.push(std::thread::spawn(move || {
            for tenant_id in 0..100i64 {
                counter.increment(tenant_id);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    for tenant_id in 0..100i64 {
        assert_eq!(counter.pending_delta(tenant_id), 8);
    }
}

#[tokio::test]
async fn test_flush_folds_into_store() {
    let (_dir, db) = test_db().await;
    let now = current_timestamp_millis();
    let tenant = create_tenant(&db, PlanTier::Free, now).await;

    let counter = ExecutionCounter::new();
    for _ in 0..5 {
        counter.increment(tenant.id);
    }

    let drained = counter.drain();
    let mut db_guard = db.lock().await;
    for (tenant_id, delta) in drained {
        db_guard.add_execution_count(tenant_id, delta).await.unwrap();
    }

    let stored = db_guard.get_tenant(tenant.id).await.unwrap().unwrap();
    assert_eq!(stored.monthly_execution_count, 5);
    assert_eq!(counter.pending_delta(tenant.id), 0);
}
