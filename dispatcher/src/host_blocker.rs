//! Per-destination circuit breaker
//!
//! Tracks `(tenant, host)` pairs in process memory and defers dispatch to
//! hosts that are rate-limiting us (429) or failing repeatedly (5xx /
//! network errors). Block durations escalate on each fresh block and a
//! single success clears both the failure count and the escalation level.
//! The table is process-local and rebuilt empty on restart; a blocked host
//! at worst gets one extra probe after a deploy.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Block state for one `(tenant, host)` pair.
#[derive(Debug, Clone, Default)]
struct HostEntry {
    /// Unix ms until which dispatch to this host is deferred. Zero when not
    /// blocked.
    blocked_until: i64,
    /// Consecutive failures since the last success.
    consecutive_failures: u32,
    /// Escalation level; each fresh block doubles the duration from the
    /// previous one.
    level: u32,
}

/// Per-(tenant, host) circuit breaker table.
pub struct HostBlocker {
    entries: Arc<RwLock<HashMap<(i64, String), HostEntry>>>,
    /// Consecutive failures before a block kicks in.
    fail_threshold: u32,
    /// First block duration in ms.
    base_block_ms: i64,
    /// Longest a block can get, in ms.
    cap_block_ms: i64,
}

impl HostBlocker {
    /// Create a new host blocker.
    ///
    /// # Parameters
    /// * `fail_threshold` - consecutive failures before blocking
    /// * `base_block_s` - first block duration in seconds
    /// * `cap_block_s` - maximum block duration in seconds
    pub fn new(fail_threshold: u32, base_block_s: u64, cap_block_s: u64) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            fail_threshold: fail_threshold.max(1),
            base_block_ms: (base_block_s as i64) * 1000,
            cap_block_ms: (cap_block_s as i64) * 1000,
        }
    }

    /// If the host is blocked, returns the instant the block expires.
    pub async fn blocked_until(&self, tenant_id: i64, host: &str, now_ms: i64) -> Option<i64> {
        let entries = self.entries.read().await;
        let entry = entries.get(&(tenant_id, host.to_string()))?;
        if entry.blocked_until > now_ms {
            Some(entry.blocked_until)
        } else {
            None
        }
    }

    /// Whether dispatch to the host should currently be deferred.
    pub async fn is_blocked(&self, tenant_id: i64, host: &str, now_ms: i64) -> bool {
        self.blocked_until(tenant_id, host, now_ms).await.is_some()
    }

    /// Explicitly block a host for a duration, e.g. on a 429 with
    /// `Retry-After`. The duration is clamped to `[1s, cap]` and the
    /// escalation level still advances so repeat offenders back off harder.
    pub async fn block(
        &self,
        tenant_id: i64,
        host: &str,
        duration_ms: i64,
        reason: &str,
        now_ms: i64,
    ) -> i64 {
        let clamped = duration_ms.clamp(1000, self.cap_block_ms);
        let mut entries = self.entries.write().await;
        let entry = entries
            .entry((tenant_id, host.to_string()))
            .or_default();
        entry.blocked_until = now_ms + clamped;
        entry.level = entry.level.saturating_add(1);
        info!(
            tenant_id,
            host,
            duration_ms = clamped,
            reason,
            "Blocked host"
        );
        entry.blocked_until
    }

    /// Record a failed dispatch (5xx or network error). Once the threshold
    /// is crossed, the host is blocked with escalating backoff; returns the
    /// block expiry when that happens.
    pub async fn record_failure(&self, tenant_id: i64, host: &str, now_ms: i64) -> Option<i64> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .entry((tenant_id, host.to_string()))
            .or_default();
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);

        if entry.consecutive_failures < self.fail_threshold {
            debug!(
                tenant_id,
                host,
                failures = entry.consecutive_failures,
                "Recorded host failure"
            );
            return None;
        }

        // 30s, 60s, 120s, ... capped.
        let exponent = entry.level.min(20);
        let duration = (self.base_block_ms << exponent).min(self.cap_block_ms);
        entry.blocked_until = now_ms + duration;
        entry.level = entry.level.saturating_add(1);
        // A fresh block starts a fresh failure count toward the next one.
        entry.consecutive_failures = 0;

        warn!(
            tenant_id,
            host,
            duration_ms = duration,
            level = entry.level,
            "Host crossed failure threshold, blocking"
        );
        Some(entry.blocked_until)
    }

    /// Record a successful dispatch: clears the failure count, any active
    /// block, and the escalation level.
    pub async fn record_success(&self, tenant_id: i64, host: &str) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(&(tenant_id, host.to_string())) {
            if entry.consecutive_failures > 0 || entry.blocked_until > 0 || entry.level > 0 {
                debug!(tenant_id, host, "Host recovered, clearing block state");
            }
            *entry = HostEntry::default();
        }
    }

    /// Drop entries with no active block and no recorded failures. This
    /// prevents unbounded growth from hosts dispatched once and never again.
    pub async fn cleanup_stale_entries(&self, now_ms: i64) {
        let mut entries = self.entries.write().await;
        let before_count = entries.len();
        entries.retain(|_, entry| {
            entry.blocked_until > now_ms || entry.consecutive_failures > 0
        });
        let removed = before_count.saturating_sub(entries.len());
        if removed > 0 {
            debug!(
                removed,
                remaining = entries.len(),
                "Cleaned up stale host blocker entries"
            );
        }
    }

    /// Number of (tenant, host) pairs currently tracked.
    pub async fn tracked_host_count(&self) -> usize {
        self.entries.read().await.len()
    }
}

impl Clone for HostBlocker {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
            fail_threshold: self.fail_threshold,
            base_block_ms: self.base_block_ms,
            cap_block_ms: self.cap_block_ms,
        }
    }
}
