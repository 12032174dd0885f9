//! Domain model for the webhook dispatch service
//!
//! This module defines the persisted entities (tenants, tasks, executions,
//! monitors, endpoints, inbound events, queue state) and the status enums
//! used throughout the dispatcher. Status enums carry `as_str`/`from_str`
//! conversions for storage in SQLite text columns.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Billing tier of a tenant. The tier gates the monthly execution cap,
/// minimum cron frequency, and execution retention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    Free,
    Pro,
}

impl PlanTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Free => "free",
            PlanTier::Pro => "pro",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "free" => Ok(PlanTier::Free),
            "pro" => Ok(PlanTier::Pro),
            _ => Err(anyhow::anyhow!("Invalid plan tier: {}", s)),
        }
    }
}

/// How a task decides when it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleType {
    /// Recurring, driven by a five-field cron expression.
    Cron,
    /// One-shot, at `scheduled_at`.
    Once,
}

impl ScheduleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleType::Cron => "cron",
            ScheduleType::Once => "once",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "cron" => Ok(ScheduleType::Cron),
            "once" => Ok(ScheduleType::Once),
            _ => Err(anyhow::anyhow!("Invalid schedule type: {}", s)),
        }
    }
}

/// Lifecycle state of an execution.
///
/// Legal live transitions are `pending -> running -> {success, failed,
/// timeout}`. `missed` and `cancelled` are terminal states set outside the
/// worker path (scheduler and cancel commands respectively).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failed,
    Timeout,
    Missed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::Missed => "missed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ExecutionStatus::Pending),
            "running" => Ok(ExecutionStatus::Running),
            "success" => Ok(ExecutionStatus::Success),
            "failed" => Ok(ExecutionStatus::Failed),
            "timeout" => Ok(ExecutionStatus::Timeout),
            "missed" => Ok(ExecutionStatus::Missed),
            "cancelled" => Ok(ExecutionStatus::Cancelled),
            _ => Err(anyhow::anyhow!("Invalid execution status: {}", s)),
        }
    }

    /// Whether this status is final. Terminal executions never move again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Pending | ExecutionStatus::Running)
    }
}

/// How a monitor computes its next expected ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorScheduleType {
    /// A ping every `interval_seconds`.
    Interval,
    /// Pings at the instants of a cron expression.
    Cron,
}

impl MonitorScheduleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorScheduleType::Interval => "interval",
            MonitorScheduleType::Cron => "cron",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "interval" => Ok(MonitorScheduleType::Interval),
            "cron" => Ok(MonitorScheduleType::Cron),
            _ => Err(anyhow::anyhow!("Invalid monitor schedule type: {}", s)),
        }
    }
}

/// State of a heartbeat monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorStatus {
    /// Created but never pinged.
    New,
    Up,
    Down,
    Paused,
}

impl MonitorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorStatus::New => "new",
            MonitorStatus::Up => "up",
            MonitorStatus::Down => "down",
            MonitorStatus::Paused => "paused",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "new" => Ok(MonitorStatus::New),
            "up" => Ok(MonitorStatus::Up),
            "down" => Ok(MonitorStatus::Down),
            "paused" => Ok(MonitorStatus::Paused),
            _ => Err(anyhow::anyhow!("Invalid monitor status: {}", s)),
        }
    }
}

/// A tenant owns every other entity and carries the monthly usage counter
/// plus notification preferences.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: i64,
    pub name: String,
    pub plan: PlanTier,
    /// Secret used to sign outbound callbacks (HMAC-SHA256).
    pub webhook_secret: String,
    /// Count of terminal first-attempt executions this month. The live value
    /// combines this with the in-process counter delta.
    pub monthly_execution_count: i64,
    /// When the counter was last zeroed (unix ms).
    pub monthly_execution_reset_at: i64,
    pub notify_on_failure: bool,
    pub notify_on_recovery: bool,
    pub email: Option<String>,
    pub created_at: i64,
}

/// A scheduled HTTP call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub tenant_id: i64,
    pub name: String,
    pub url: String,
    pub method: String,
    /// Request headers. BTreeMap keeps serialization stable.
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    pub schedule_type: ScheduleType,
    pub cron_expression: Option<String>,
    /// For `once` tasks: the single instant to run at (unix ms).
    pub scheduled_at: Option<i64>,
    pub enabled: bool,
    /// Serialization group within the tenant. Empty string means no queue.
    pub queue: String,
    pub timeout_ms: i64,
    /// Extra attempts after the first (0-10).
    pub retry_attempts: i64,
    /// Comma-separated status codes that count as success; empty means 2xx.
    pub expected_status_codes: Option<String>,
    /// Substring that must appear in the response body.
    pub expected_body_pattern: Option<String>,
    pub callback_url: Option<String>,
    pub alert_on_failure: bool,
    pub muted: bool,
    /// Estimated minutes between runs, derived from the cron expression.
    pub interval_minutes: Option<i64>,
    /// Next instant the scheduler should materialize (unix ms). Nil means
    /// the task will not run.
    pub next_run_at: Option<i64>,
    pub inserted_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
    /// Set when the task was synthesized by inbound fan-out.
    pub source_endpoint_id: Option<i64>,
}

impl Task {
    /// Parse `expected_status_codes` into a list. Empty/absent means "2xx".
    pub fn expected_codes(&self) -> Vec<u16> {
        self.expected_status_codes
            .as_deref()
            .unwrap_or("")
            .split(',')
            .filter_map(|part| part.trim().parse::<u16>().ok())
            .collect()
    }
}

/// A single attempt (or planned attempt) of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: i64,
    pub task_id: i64,
    pub tenant_id: i64,
    pub status: ExecutionStatus,
    pub scheduled_for: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub status_code: Option<i64>,
    pub duration_ms: Option<i64>,
    /// Truncated response body (at most 4 KiB) for terminal executions.
    pub response_body: Option<String>,
    pub error_message: Option<String>,
    /// 1-based attempt number. Retries allocate a new row with attempt + 1.
    pub attempt: i64,
    /// Per-execution callback override; falls back to the task's.
    pub callback_url: Option<String>,
    /// Creation timestamp, used as the tiebreaker in queue FIFO claims.
    pub created_at: i64,
}

/// A passive heartbeat listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Monitor {
    pub id: i64,
    pub tenant_id: i64,
    pub name: String,
    pub ping_token: String,
    pub schedule_type: MonitorScheduleType,
    pub interval_seconds: Option<i64>,
    pub cron_expression: Option<String>,
    pub grace_period_seconds: i64,
    pub status: MonitorStatus,
    pub last_ping_at: Option<i64>,
    pub next_expected_at: Option<i64>,
    pub enabled: bool,
    pub muted: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

/// An inbound webhook receiver that fans out to configured destinations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: i64,
    pub tenant_id: i64,
    pub name: String,
    pub slug: String,
    pub forward_urls: Vec<String>,
    /// When set, fan-out tasks share a queue named after the endpoint so
    /// destinations are dispatched serially.
    pub use_queue: bool,
    pub retry_attempts: i64,
    pub alert_on_failure: bool,
    pub callback_url: Option<String>,
    /// Endpoint-scoped alert webhooks, distinct from execution callbacks.
    pub on_failure_url: Option<String>,
    pub on_recovery_url: Option<String>,
    /// Optional shared secret; inbound requests must then carry a valid
    /// `X-Signature` header.
    pub secret: Option<String>,
    pub enabled: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

/// One received request against an endpoint, kept for replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub id: i64,
    pub endpoint_id: i64,
    pub tenant_id: i64,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    /// Body text; non-UTF-8 payloads are stored base64-encoded with
    /// `body_base64` set.
    pub body: String,
    pub body_base64: bool,
    pub source_ip: Option<String>,
    pub received_at: i64,
    /// Task ids generated by fan-out, recorded for replay.
    pub task_ids: Vec<i64>,
}

/// Pause flag for a named queue within a tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueState {
    pub tenant_id: i64,
    pub name: String,
    pub paused: bool,
}
