//! Outbound callbacks and alert notifications
//!
//! Terminal executions fan out here: signed HTTP callbacks to the tenant's
//! configured URLs, and alert emails enqueued to the email log. Callback
//! delivery has its own bounded retry schedule and runs detached from the
//! worker, so a slow callback receiver never stalls dispatch and a failed
//! callback never affects the source execution.

use crate::database::{DispatcherDatabase, EmailKind};
use anyhow::{Context, Result};
use shared::config::ServiceConfig;
use shared::model::{Execution, Monitor, Task, Tenant};
use shared::utils::{current_timestamp_millis, sign_payload};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Callback event names on the wire.
pub const EVENT_COMPLETED: &str = "execution.completed";
pub const EVENT_FAILED: &str = "execution.failed";
pub const EVENT_RECOVERED: &str = "task.recovered";

/// Throttle window for failure emails.
const FAILURE_EMAIL_WINDOW_MS: i64 = 5 * 60 * 1000;

/// Dispatches signed callbacks and enqueues alert emails.
pub struct Notifier {
    database: Arc<Mutex<DispatcherDatabase>>,
    http_client: reqwest::Client,
    config: Arc<ServiceConfig>,
}

impl Notifier {
    pub fn new(database: Arc<Mutex<DispatcherDatabase>>, config: Arc<ServiceConfig>) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_client_timeout_seconds))
            .build()
            .context("Failed to create callback HTTP client")?;

        Ok(Self {
            database,
            http_client,
            config,
        })
    }

    /// Build the callback body for a terminal execution.
    pub fn execution_payload(event: &str, task: &Task, execution: &Execution) -> serde_json::Value {
        serde_json::json!({
            "event": event,
            "task": {
                "id": task.id,
                "name": task.name,
            },
            "execution": {
                "id": execution.id,
                "status": execution.status.as_str(),
                "status_code": execution.status_code,
                "duration_ms": execution.duration_ms,
                "error_message": execution.error_message,
                "attempt": execution.attempt,
                "scheduled_for": execution.scheduled_for,
                "finished_at": execution.finished_at,
                "response_body": execution.response_body,
            },
        })
    }

    /// Fire a signed callback in the background. Delivery failures are
    /// logged, retried on the callback's own schedule, and then dropped.
    pub fn spawn_callback(
        &self,
        url: String,
        secret: String,
        payload: serde_json::Value,
        task_id: i64,
        execution_id: i64,
    ) {
        let client = self.http_client.clone();
        let attempts = self.config.callback_attempts.max(1);
        let backoff_base_ms = self.config.callback_backoff_base_ms;

        tokio::spawn(async move {
            deliver_signed(
                client,
                url,
                secret,
                payload,
                task_id,
                execution_id,
                attempts,
                backoff_base_ms,
            )
            .await;
        });
    }

    /// Enqueue a failure alert email, rate-limited per tenant so a flapping
    /// task cannot flood an inbox.
    pub async fn notify_task_failure(
        &self,
        tenant: &Tenant,
        task: &Task,
        execution: &Execution,
    ) -> Result<()> {
        if !tenant.notify_on_failure || task.muted || !task.alert_on_failure {
            return Ok(());
        }

        let now_ms = current_timestamp_millis();
        let mut db = self.database.lock().await;

        let recent = db
            .count_recent_emails(
                tenant.id,
                EmailKind::TaskFailure,
                now_ms - FAILURE_EMAIL_WINDOW_MS,
            )
            .await?;
        if recent >= self.config.failure_emails_per_5min as i64 {
            debug!(
                tenant_id = tenant.id,
                task_id = task.id,
                "Failure email throttled"
            );
            return Ok(());
        }

        let subject = format!("Task '{}' failed", task.name);
        let body = format!(
            "Task '{}' failed on attempt {}: {}",
            task.name,
            execution.attempt,
            execution
                .error_message
                .as_deref()
                .unwrap_or("assertion or status mismatch")
        );
        db.enqueue_email(
            tenant.id,
            EmailKind::TaskFailure,
            &subject,
            Some(&body),
            now_ms,
        )
        .await?;
        info!(tenant_id = tenant.id, task_id = task.id, "Enqueued failure email");
        Ok(())
    }

    /// Enqueue a recovery email after a success that follows a failure.
    pub async fn notify_task_recovery(&self, tenant: &Tenant, task: &Task) -> Result<()> {
        if !tenant.notify_on_recovery || task.muted {
            return Ok(());
        }

        let now_ms = current_timestamp_millis();
        let subject = format!("Task '{}' recovered", task.name);
        let mut db = self.database.lock().await;
        db.enqueue_email(tenant.id, EmailKind::TaskRecovery, &subject, None, now_ms)
            .await?;
        info!(tenant_id = tenant.id, task_id = task.id, "Enqueued recovery email");
        Ok(())
    }

    /// Enqueue a monitor-down email.
    pub async fn notify_monitor_down(&self, tenant: &Tenant, monitor: &Monitor) -> Result<()> {
        if !tenant.notify_on_failure || monitor.muted {
            return Ok(());
        }

        let now_ms = current_timestamp_millis();
        let subject = format!("Monitor '{}' is down", monitor.name);
        let body = format!(
            "Monitor '{}' did not receive its expected ping within the grace period.",
            monitor.name
        );
        let mut db = self.database.lock().await;
        db.enqueue_email(
            tenant.id,
            EmailKind::MonitorDown,
            &subject,
            Some(&body),
            now_ms,
        )
        .await?;
        info!(
            tenant_id = tenant.id,
            monitor_id = monitor.id,
            "Enqueued monitor-down email"
        );
        Ok(())
    }

    /// Enqueue a monitor-recovery email after a ping to a down monitor.
    pub async fn notify_monitor_recovery(&self, tenant: &Tenant, monitor: &Monitor) -> Result<()> {
        if !tenant.notify_on_recovery || monitor.muted {
            return Ok(());
        }

        let now_ms = current_timestamp_millis();
        let subject = format!("Monitor '{}' recovered", monitor.name);
        let mut db = self.database.lock().await;
        db.enqueue_email(tenant.id, EmailKind::MonitorRecovery, &subject, None, now_ms)
            .await?;
        Ok(())
    }
}

impl Clone for Notifier {
    fn clone(&self) -> Self {
        Self {
            database: Arc::clone(&self.database),
            http_client: self.http_client.clone(),
            config: Arc::clone(&self.config),
        }
    }
}

/// POST a signed payload with bounded retries. Exponential backoff between
/// attempts; any 2xx counts as delivered.
#[allow(clippy::too_many_arguments)]
async fn deliver_signed(
    client: reqwest::Client,
    url: String,
    secret: String,
    payload: serde_json::Value,
    task_id: i64,
    execution_id: i64,
    attempts: u32,
    backoff_base_ms: u64,
) {
    let body = match serde_json::to_vec(&payload) {
        Ok(body) => body,
        Err(e) => {
            warn!("Failed to serialize callback payload: {}", e);
            return;
        }
    };
    let signature = sign_payload(&secret, &body);

    for attempt in 1..=attempts {
        let result = client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("X-Signature", &signature)
            .header("X-Task-Id", task_id.to_string())
            .header("X-Execution-Id", execution_id.to_string())
            .body(body.clone())
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                debug!(
                    url = %url,
                    execution_id,
                    attempt,
                    "Callback delivered"
                );
                return;
            }
            Ok(response) => {
                warn!(
                    url = %url,
                    execution_id,
                    attempt,
                    status = response.status().as_u16(),
                    "Callback rejected"
                );
            }
            Err(e) => {
                warn!(url = %url, execution_id, attempt, "Callback failed: {}", e);
            }
        }

        if attempt < attempts {
            let delay = backoff_base_ms.saturating_mul(1u64 << (attempt - 1).min(10));
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }

    warn!(
        url = %url,
        execution_id,
        "Callback abandoned after {} attempts",
        attempts
    );
}
