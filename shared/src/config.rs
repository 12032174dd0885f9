//! Configuration types and validation for the webhook dispatch service
//!
//! This module defines the service configuration structure loaded from
//! dispatcher.toml, including validation logic and serialization support.

use crate::defaults::*;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main service configuration loaded from dispatcher.toml
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceConfig {
    /// Address the HTTP surface listens on (inbound events, pings, status)
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// Directory holding the SQLite database
    #[serde(default)]
    pub data_dir: String,

    // Worker pool
    /// Minimum number of workers kept alive (default: 1)
    #[serde(default = "default_min_workers")]
    pub min_workers: usize,
    /// Maximum number of concurrent workers (default: 50)
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Consecutive empty polls before an idle worker exits (default: 30)
    #[serde(default = "default_worker_idle_polls")]
    pub worker_idle_polls: u32,
    /// Worker poll interval when no work is available in ms (default: 1000)
    #[serde(default = "default_worker_poll_interval_ms")]
    pub worker_poll_interval_ms: u64,

    // Scheduler
    /// Scheduler tick interval in ms (default: 1000)
    #[serde(default = "default_scheduler_tick_ms")]
    pub scheduler_tick_ms: u64,
    /// Scheduler look-ahead window in ms (default: 10000)
    #[serde(default = "default_scheduler_lookahead_ms")]
    pub scheduler_lookahead_ms: u64,
    /// Minimum grace window before a run is classified missed, in seconds
    /// (default: 30; the effective grace grows with the task interval)
    #[serde(default = "default_scheduler_grace_s")]
    pub scheduler_grace_default_s: u64,

    // Execution counter
    /// Counter flush interval in ms (default: 5000)
    #[serde(default = "default_counter_flush_ms")]
    pub counter_flush_ms: u64,

    // Host blocker
    /// Consecutive failures before a host is blocked (default: 3)
    #[serde(default = "default_host_blocker_fail_threshold")]
    pub host_blocker_fail_threshold: u32,
    /// Base block duration in seconds (default: 30)
    #[serde(default = "default_host_blocker_base_s")]
    pub host_blocker_base_s: u64,
    /// Maximum block duration in seconds (default: 86400)
    #[serde(default = "default_host_blocker_cap_s")]
    pub host_blocker_cap_s: u64,

    // Retry policy
    /// Retry backoff base in ms (default: 30000)
    #[serde(default = "default_retry_backoff_base_ms")]
    pub retry_backoff_base_ms: u64,
    /// Retry backoff cap in ms (default: 900000)
    #[serde(default = "default_retry_backoff_cap_ms")]
    pub retry_backoff_cap_ms: u64,

    // Retention
    /// Execution retention for free-tier tenants in days (default: 7)
    #[serde(default = "default_retention_days_free")]
    pub retention_days_free: u32,
    /// Execution retention for pro-tier tenants in days (default: 30)
    #[serde(default = "default_retention_days_pro")]
    pub retention_days_pro: u32,
    /// Retention for soft-deleted tasks in days (default: 30)
    #[serde(default = "default_deleted_task_retention_days")]
    pub deleted_task_retention_days: u32,
    /// Retention for email log rows in days (default: 90)
    #[serde(default = "default_email_log_retention_days")]
    pub email_log_retention_days: u32,
    /// Retention for inbound event rows in days (default: 30)
    #[serde(default = "default_inbound_event_retention_days")]
    pub inbound_event_retention_days: u32,

    // Tier limits
    /// Monthly execution cap for free-tier tenants (default: 10000)
    #[serde(default = "default_monthly_cap_free")]
    pub monthly_cap_free: i64,

    // Monitor checker
    /// Monitor overdue scan interval in seconds (default: 30)
    #[serde(default = "default_monitor_check_interval_s")]
    pub monitor_check_interval_s: u64,

    // Cleanup
    /// Data cleanup interval in hours (default: 24)
    #[serde(default = "default_cleanup_interval_hours")]
    pub cleanup_interval_hours: u32,
    /// Delay before the first cleanup run in seconds (default: 3600)
    #[serde(default = "default_initial_cleanup_delay_seconds")]
    pub initial_cleanup_delay_seconds: u64,

    // Dispatch
    /// Slack beyond a task's timeout before a running execution is treated
    /// as orphaned, in ms (default: 5000)
    #[serde(default = "default_orphan_sweep_slack_ms")]
    pub orphan_sweep_slack_ms: u64,

    // Callbacks & notifications
    /// Callback delivery attempts (default: 3)
    #[serde(default = "default_callback_attempts")]
    pub callback_attempts: u32,
    /// Callback retry backoff base in ms (default: 5000)
    #[serde(default = "default_callback_backoff_base_ms")]
    pub callback_backoff_base_ms: u64,
    /// Failure emails allowed per tenant per 5 minutes (default: 3)
    #[serde(default = "default_failure_emails_per_5min")]
    pub failure_emails_per_5min: usize,

    // Infrastructure
    /// SQLite busy timeout in seconds (default: 5)
    #[serde(default = "default_database_busy_timeout")]
    pub database_busy_timeout_seconds: u64,
    /// WAL checkpoint interval in seconds (default: 60)
    #[serde(default = "default_wal_checkpoint_interval")]
    pub wal_checkpoint_interval_seconds: u64,
    /// HTTP client timeout for callbacks and alert webhooks in seconds
    /// (default: 30)
    #[serde(default = "default_http_client_timeout")]
    pub http_client_timeout_seconds: u64,
    /// Wait time for in-flight dispatches during shutdown in seconds
    /// (default: 30)
    #[serde(default = "default_graceful_shutdown_timeout")]
    pub graceful_shutdown_timeout_seconds: u64,
    /// Maximum inbound request body size in bytes (default: 1 MiB)
    #[serde(default = "default_inbound_body_limit")]
    pub inbound_body_limit: usize,

    // Logging
    /// Optional log file path; stdout when unset
    #[serde(default)]
    pub log_file: Option<String>,
    /// Emit JSON log lines instead of the human format
    #[serde(default)]
    pub log_json: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        // Round-trip through an empty TOML table so every serde default
        // function is applied in one place.
        toml::from_str("").expect("empty config deserializes via defaults")
    }
}

impl ServiceConfig {
    /// Load and validate a configuration file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: ServiceConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.min_workers == 0 {
            anyhow::bail!("min_workers must be at least 1");
        }
        if self.max_workers < self.min_workers {
            anyhow::bail!(
                "max_workers ({}) must be >= min_workers ({})",
                self.max_workers,
                self.min_workers
            );
        }
        if self.scheduler_tick_ms == 0 {
            anyhow::bail!("scheduler_tick_ms must be positive");
        }
        if self.scheduler_lookahead_ms < self.scheduler_tick_ms {
            anyhow::bail!(
                "scheduler_lookahead_ms ({}) must be >= scheduler_tick_ms ({})",
                self.scheduler_lookahead_ms,
                self.scheduler_tick_ms
            );
        }
        if self.retry_backoff_base_ms == 0 {
            anyhow::bail!("retry_backoff_base_ms must be positive");
        }
        if self.retry_backoff_cap_ms < self.retry_backoff_base_ms {
            anyhow::bail!("retry_backoff_cap_ms must be >= retry_backoff_base_ms");
        }
        if self.host_blocker_cap_s < self.host_blocker_base_s {
            anyhow::bail!("host_blocker_cap_s must be >= host_blocker_base_s");
        }
        if self.monthly_cap_free <= 0 {
            anyhow::bail!("monthly_cap_free must be positive");
        }
        self.listen_address
            .parse::<std::net::SocketAddr>()
            .with_context(|| format!("Invalid listen_address: '{}'", self.listen_address))?;
        Ok(())
    }

    /// Effective data directory, defaulting to ./data.
    pub fn data_dir(&self) -> &str {
        if self.data_dir.is_empty() {
            "./data"
        } else {
            &self.data_dir
        }
    }
}
