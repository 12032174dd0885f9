//! In-process execution counter
//!
//! Workers increment per-tenant usage here instead of hitting the tenants
//! table on every terminal execution, which would serialize the whole pool
//! on one row. The counter is sharded by tenant id so concurrent increments
//! rarely contend on the same lock, and a flush loop periodically folds the
//! deltas into the store with one additive UPDATE per tenant.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

const SHARD_COUNT: usize = 16;

/// Sharded map of tenant id to pending (not yet persisted) execution count.
pub struct ExecutionCounter {
    shards: Arc<Vec<Mutex<HashMap<i64, i64>>>>,
}

impl ExecutionCounter {
    pub fn new() -> Self {
        let shards = (0..SHARD_COUNT)
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        Self {
            shards: Arc::new(shards),
        }
    }

    fn shard_for(&self, tenant_id: i64) -> &Mutex<HashMap<i64, i64>> {
        &self.shards[(tenant_id.unsigned_abs() as usize) % SHARD_COUNT]
    }

    /// Record one terminal first-attempt execution for a tenant. This is the
    /// hot path; it takes one shard lock for a map insert and nothing else.
    pub fn increment(&self, tenant_id: i64) {
        let mut shard = self
            .shard_for(tenant_id)
            .lock()
            .expect("counter shard poisoned");
        *shard.entry(tenant_id).or_insert(0) += 1;
    }

    /// The in-memory delta for one tenant, not yet folded into the store.
    /// Reads of "current month so far" add this to the persisted count.
    pub fn pending_delta(&self, tenant_id: i64) -> i64 {
        let shard = self
            .shard_for(tenant_id)
            .lock()
            .expect("counter shard poisoned");
        shard.get(&tenant_id).copied().unwrap_or(0)
    }

    /// Take all nonzero deltas, leaving the shards empty. The flush loop
    /// persists what this returns; on persist failure the caller re-adds
    /// the deltas so they are not lost.
    pub fn drain(&self) -> HashMap<i64, i64> {
        let mut drained = HashMap::new();
        for shard in self.shards.iter() {
            let mut map = shard.lock().expect("counter shard poisoned");
            for (tenant_id, delta) in map.drain() {
                if delta != 0 {
                    *drained.entry(tenant_id).or_insert(0) += delta;
                }
            }
        }
        if !drained.is_empty() {
            debug!("Drained counter deltas for {} tenants", drained.len());
        }
        drained
    }

    /// Put deltas back after a failed flush.
    pub fn restore(&self, deltas: HashMap<i64, i64>) {
        for (tenant_id, delta) in deltas {
            let mut shard = self
                .shard_for(tenant_id)
                .lock()
                .expect("counter shard poisoned");
            *shard.entry(tenant_id).or_insert(0) += delta;
        }
    }
}

impl Default for ExecutionCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for ExecutionCounter {
    fn clone(&self) -> Self {
        Self {
            shards: Arc::clone(&self.shards),
        }
    }
}
