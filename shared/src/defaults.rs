//! Default values for configuration parameters
//!
//! This module centralizes all default value functions used by the
//! configuration structures. These functions are used by serde when
//! deserializing configuration files that don't specify certain optional
//! fields.

// Worker pool defaults

/// Default minimum number of workers kept alive (1)
pub fn default_min_workers() -> usize {
    1
}

/// Default maximum number of concurrent workers (50)
pub fn default_max_workers() -> usize {
    50
}

/// Default consecutive empty polls before a worker exits (30)
pub fn default_worker_idle_polls() -> u32 {
    30
}

/// Default worker poll interval when the queue is empty (1000 ms)
pub fn default_worker_poll_interval_ms() -> u64 {
    1000
}

// Scheduler defaults

/// Default scheduler tick interval (1 second)
pub fn default_scheduler_tick_ms() -> u64 {
    1000
}

/// Default scheduler look-ahead window (10 seconds)
pub fn default_scheduler_lookahead_ms() -> u64 {
    10_000
}

/// Default grace window before a run is classified as missed (30 seconds)
pub fn default_scheduler_grace_s() -> u64 {
    30
}

// Execution counter defaults

/// Default counter flush interval (5 seconds)
pub fn default_counter_flush_ms() -> u64 {
    5000
}

// Host blocker defaults

/// Default consecutive failures before a host is blocked (3)
pub fn default_host_blocker_fail_threshold() -> u32 {
    3
}

/// Default base block duration (30 seconds)
pub fn default_host_blocker_base_s() -> u64 {
    30
}

/// Default maximum block duration (24 hours)
pub fn default_host_blocker_cap_s() -> u64 {
    86_400
}

// Retry defaults

/// Default retry backoff base (30 seconds)
pub fn default_retry_backoff_base_ms() -> u64 {
    30_000
}

/// Default retry backoff cap (15 minutes)
pub fn default_retry_backoff_cap_ms() -> u64 {
    900_000
}

// Retention defaults

/// Default execution retention for free-tier tenants (7 days)
pub fn default_retention_days_free() -> u32 {
    7
}

/// Default execution retention for pro-tier tenants (30 days)
pub fn default_retention_days_pro() -> u32 {
    30
}

/// Default retention for soft-deleted tasks (30 days)
pub fn default_deleted_task_retention_days() -> u32 {
    30
}

/// Default retention for email log rows (90 days)
pub fn default_email_log_retention_days() -> u32 {
    90
}

/// Default retention for inbound event rows (30 days)
pub fn default_inbound_event_retention_days() -> u32 {
    30
}

// Tier defaults

/// Default monthly execution cap for free-tier tenants (10,000)
pub fn default_monthly_cap_free() -> i64 {
    10_000
}

// Monitor checker defaults

/// Default monitor overdue scan interval (30 seconds)
pub fn default_monitor_check_interval_s() -> u64 {
    30
}

// Cleanup defaults

/// Default data cleanup interval (24 hours)
pub fn default_cleanup_interval_hours() -> u32 {
    24
}

/// Default initial cleanup delay on startup (1 hour)
pub fn default_initial_cleanup_delay_seconds() -> u64 {
    3600
}

// Dispatch defaults

/// Default per-task dispatch timeout (30 seconds)
pub fn default_task_timeout_ms() -> i64 {
    30_000
}

/// Default orphan sweep slack beyond a task's timeout (5 seconds)
pub fn default_orphan_sweep_slack_ms() -> u64 {
    5000
}

/// Default maximum bytes of response body read for assertions (64 KiB)
pub fn default_assertion_read_limit() -> usize {
    64 * 1024
}

/// Default maximum bytes of response body persisted (4 KiB)
pub fn default_stored_body_limit() -> usize {
    4 * 1024
}

// Callback defaults

/// Default callback delivery attempts (3)
pub fn default_callback_attempts() -> u32 {
    3
}

/// Default callback retry backoff base (5 seconds)
pub fn default_callback_backoff_base_ms() -> u64 {
    5000
}

// Notification defaults

/// Default failure emails allowed per tenant per 5 minutes (3)
pub fn default_failure_emails_per_5min() -> usize {
    3
}

// HTTP surface defaults

/// Default listen address for the HTTP surface
pub fn default_listen_address() -> String {
    "127.0.0.1:8420".to_string()
}

/// Default maximum inbound request body size (1 MiB)
pub fn default_inbound_body_limit() -> usize {
    1024 * 1024
}

/// Default maximum forward URLs per endpoint (10)
pub fn default_max_forward_urls() -> usize {
    10
}

/// Default maximum items per batch (1000)
pub fn default_max_batch_items() -> usize {
    1000
}

// Infrastructure defaults

/// Default SQLite database busy timeout (5 seconds)
pub fn default_database_busy_timeout() -> u64 {
    5
}

/// Default WAL checkpoint interval (60 seconds)
pub fn default_wal_checkpoint_interval() -> u64 {
    60
}

/// Default HTTP client timeout for callbacks and alerts (30 seconds)
pub fn default_http_client_timeout() -> u64 {
    30
}

/// Default graceful shutdown timeout (30 seconds)
pub fn default_graceful_shutdown_timeout() -> u64 {
    30
}
