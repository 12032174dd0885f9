//! Command surface consumed by the API layer
//!
//! The HTTP/JSON API is an external collaborator; what it calls into is
//! this module. Commands accept already-parsed specs, run the validation
//! the core owns (URL blocklist, cron validity, tier gates, caps), and
//! return domain rows or classified business errors. Cross-tenant lookups
//! come back as "not found", never "forbidden".

use crate::counter::ExecutionCounter;
use crate::database::{DispatcherDatabase, NewEndpoint, NewMonitor, NewTask};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use shared::config::ServiceConfig;
use shared::model::{
    Endpoint, Execution, Monitor, MonitorScheduleType, MonitorStatus, PlanTier, QueueState,
    ScheduleType, Task, Tenant,
};
use shared::utils::{generate_token, slugify, validate_destination_url};
use shared::{cron, DispatchError};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info};

const MAX_NAME_LEN: usize = 200;
const MAX_RETRY_ATTEMPTS: i64 = 10;
const MIN_TIMEOUT_MS: i64 = 1000;
const MAX_TIMEOUT_MS: i64 = 300_000;
const SUB_HOURLY_MINUTES: i64 = 60;

fn default_method() -> String {
    "POST".to_string()
}

fn default_true() -> bool {
    true
}

fn default_timeout_ms() -> i64 {
    shared::defaults::default_task_timeout_ms()
}

fn default_grace_period() -> i64 {
    60
}

/// Caller-supplied task description. Already parsed JSON; validation
/// happens in `create_task`/`update_task`.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    pub schedule_type: ScheduleType,
    #[serde(default)]
    pub cron_expression: Option<String>,
    #[serde(default)]
    pub scheduled_at: Option<i64>,
    #[serde(default)]
    pub queue: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: i64,
    #[serde(default)]
    pub retry_attempts: i64,
    #[serde(default)]
    pub expected_status_codes: Option<String>,
    #[serde(default)]
    pub expected_body_pattern: Option<String>,
    #[serde(default)]
    pub callback_url: Option<String>,
    #[serde(default = "default_true")]
    pub alert_on_failure: bool,
    #[serde(default)]
    pub muted: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Partial task update. Absent fields keep their current value; `body`,
/// `cron_expression` and friends can be cleared by sending null inside the
/// outer Some.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskPatch {
    pub name: Option<String>,
    pub url: Option<String>,
    pub method: Option<String>,
    pub headers: Option<BTreeMap<String, String>>,
    pub body: Option<Option<String>>,
    pub schedule_type: Option<ScheduleType>,
    pub cron_expression: Option<Option<String>>,
    pub scheduled_at: Option<Option<i64>>,
    pub queue: Option<String>,
    pub timeout_ms: Option<i64>,
    pub retry_attempts: Option<i64>,
    pub expected_status_codes: Option<Option<String>>,
    pub expected_body_pattern: Option<Option<String>>,
    pub callback_url: Option<Option<String>>,
    pub alert_on_failure: Option<bool>,
    pub muted: Option<bool>,
    pub enabled: Option<bool>,
}

/// Caller-supplied monitor description.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorSpec {
    pub name: String,
    pub schedule_type: MonitorScheduleType,
    #[serde(default)]
    pub interval_seconds: Option<i64>,
    #[serde(default)]
    pub cron_expression: Option<String>,
    #[serde(default = "default_grace_period")]
    pub grace_period_seconds: i64,
    #[serde(default)]
    pub muted: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Caller-supplied endpoint description.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointSpec {
    pub name: String,
    #[serde(default)]
    pub slug: Option<String>,
    pub forward_urls: Vec<String>,
    #[serde(default)]
    pub use_queue: bool,
    #[serde(default)]
    pub retry_attempts: i64,
    #[serde(default = "default_true")]
    pub alert_on_failure: bool,
    #[serde(default)]
    pub callback_url: Option<String>,
    #[serde(default)]
    pub on_failure_url: Option<String>,
    #[serde(default)]
    pub on_recovery_url: Option<String>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Shared settings for a batch of one-shot tasks.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchSpec {
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub scheduled_at: Option<i64>,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: i64,
    #[serde(default)]
    pub retry_attempts: i64,
    #[serde(default)]
    pub callback_url: Option<String>,
    #[serde(default = "default_true")]
    pub alert_on_failure: bool,
    #[serde(default)]
    pub muted: bool,
}

/// One destination in a batch.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchItem {
    #[serde(default)]
    pub name: Option<String>,
    pub url: String,
    #[serde(default)]
    pub body: Option<String>,
}

/// What a batch submission produced.
#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub queue: String,
    pub count: usize,
    pub scheduled_for: i64,
}

/// Declarative sync input: desired state per kind, matched by name.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SyncRequest {
    #[serde(default)]
    pub tasks: Option<Vec<TaskSpec>>,
    #[serde(default)]
    pub monitors: Option<Vec<MonitorSpec>>,
    #[serde(default)]
    pub endpoints: Option<Vec<EndpointSpec>>,
    #[serde(default)]
    pub delete_removed: bool,
}

/// Reconciliation counts per kind.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncCounts {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncSummary {
    pub tasks: SyncCounts,
    pub monitors: SyncCounts,
    pub endpoints: SyncCounts,
}

/// The command surface. One instance is shared with the HTTP layer.
pub struct Commands {
    database: Arc<Mutex<DispatcherDatabase>>,
    counter: ExecutionCounter,
    config: Arc<ServiceConfig>,
    worker_notify: Arc<Notify>,
}

impl Commands {
    pub fn new(
        database: Arc<Mutex<DispatcherDatabase>>,
        counter: ExecutionCounter,
        config: Arc<ServiceConfig>,
        worker_notify: Arc<Notify>,
    ) -> Self {
        Self {
            database,
            counter,
            config,
            worker_notify,
        }
    }

    // ========== Tasks ==========

    /// Create a task. Validation covers the destination URL (scheme +
    /// private-address blocklist), schedule coherence, the free-tier
    /// sub-hourly cron gate, and attempt/timeout ranges.
    pub async fn create_task(&self, tenant_id: i64, spec: TaskSpec, now_ms: i64) -> Result<Task> {
        let tenant = self.require_tenant(tenant_id).await?;
        let (interval_minutes, next_run_at) =
            validate_task_spec(&tenant, &spec, now_ms, true)?;

        let new = NewTask {
            tenant_id,
            name: spec.name,
            url: spec.url,
            method: spec.method.to_uppercase(),
            headers: spec.headers,
            body: spec.body,
            schedule_type: spec.schedule_type,
            cron_expression: spec.cron_expression,
            scheduled_at: spec.scheduled_at,
            enabled: spec.enabled,
            queue: spec.queue,
            timeout_ms: spec.timeout_ms,
            retry_attempts: spec.retry_attempts,
            expected_status_codes: spec.expected_status_codes,
            expected_body_pattern: spec.expected_body_pattern,
            callback_url: spec.callback_url,
            alert_on_failure: spec.alert_on_failure,
            muted: spec.muted,
            interval_minutes,
            next_run_at: if spec.enabled { next_run_at } else { None },
            source_endpoint_id: None,
        };

        let mut db = self.database.lock().await;
        let task = db.insert_task(&new, now_ms).await?;
        info!(tenant_id, task_id = task.id, "Task created");
        Ok(task)
    }

    /// Patch a task. Schedule-affecting changes recompute
    /// `interval_minutes` and `next_run_at`.
    pub async fn update_task(
        &self,
        tenant_id: i64,
        task_id: i64,
        patch: TaskPatch,
        now_ms: i64,
    ) -> Result<Task> {
        let tenant = self.require_tenant(tenant_id).await?;
        let mut task = self.require_task(tenant_id, task_id).await?;

        let schedule_before = (
            task.schedule_type,
            task.cron_expression.clone(),
            task.scheduled_at,
            task.enabled,
        );

        apply_task_patch(&mut task, patch);

        let spec = spec_from_task(&task);
        let (interval_minutes, next_run_at) =
            validate_task_spec(&tenant, &spec, now_ms, false)?;
        task.interval_minutes = interval_minutes;

        let schedule_after = (
            task.schedule_type,
            task.cron_expression.clone(),
            task.scheduled_at,
            task.enabled,
        );
        if schedule_before != schedule_after {
            task.next_run_at = if task.enabled { next_run_at } else { None };
        }

        let mut db = self.database.lock().await;
        db.update_task(&task, now_ms).await?;
        drop(db);
        debug!(tenant_id, task_id, "Task updated");
        self.require_task(tenant_id, task_id).await
    }

    /// Soft-delete a task and cancel its pending executions.
    pub async fn soft_delete_task(&self, tenant_id: i64, task_id: i64, now_ms: i64) -> Result<()> {
        let mut db = self.database.lock().await;
        if !db.soft_delete_task(tenant_id, task_id, now_ms).await? {
            return Err(DispatchError::NotFound("Task").into());
        }
        Ok(())
    }

    /// Flip a task's enabled flag, recomputing `next_run_at` on re-enable.
    pub async fn toggle_task(&self, tenant_id: i64, task_id: i64, now_ms: i64) -> Result<Task> {
        let task = self.require_task(tenant_id, task_id).await?;
        let enable = !task.enabled;

        let next_run_at = if enable {
            match task.schedule_type {
                ScheduleType::Cron => match task.cron_expression.as_deref() {
                    Some(expr) => cron::next_after(expr, now_ms)?,
                    None => None,
                },
                // A once-task whose instant already passed stays parked.
                ScheduleType::Once => task.scheduled_at.filter(|at| *at > now_ms),
            }
        } else {
            None
        };

        let mut db = self.database.lock().await;
        db.set_task_enabled(task.id, enable, next_run_at, now_ms)
            .await?;
        drop(db);
        info!(tenant_id, task_id, enabled = enable, "Task toggled");
        self.require_task(tenant_id, task_id).await
    }

    pub async fn get_task(&self, tenant_id: i64, task_id: i64) -> Result<Option<Task>> {
        let mut db = self.database.lock().await;
        db.get_task(tenant_id, task_id).await
    }

    pub async fn list_tasks(&self, tenant_id: i64) -> Result<Vec<Task>> {
        let mut db = self.database.lock().await;
        db.list_tasks(tenant_id).await
    }

    pub async fn list_executions(
        &self,
        tenant_id: i64,
        task_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Execution>> {
        let mut db = self.database.lock().await;
        match task_id {
            Some(task_id) => db.list_executions_for_task(tenant_id, task_id, limit).await,
            None => db.list_executions_for_tenant(tenant_id, limit).await,
        }
    }

    /// Create an immediate (or explicitly timed) execution for a task,
    /// outside its schedule.
    pub async fn trigger_task(
        &self,
        tenant_id: i64,
        task_id: i64,
        at_ms: Option<i64>,
        now_ms: i64,
    ) -> Result<Execution> {
        let tenant = self.require_tenant(tenant_id).await?;
        let task = self.require_task(tenant_id, task_id).await?;

        if !task.enabled {
            return Err(
                DispatchError::validation("task", "Cannot trigger a disabled task").into(),
            );
        }
        self.check_cap(&tenant, 1).await?;

        let scheduled_for = at_ms.unwrap_or(now_ms);
        let mut db = self.database.lock().await;
        let execution_id = match db
            .create_pending_execution(task.id, tenant_id, scheduled_for, 1, None, now_ms)
            .await?
        {
            Some(id) => id,
            // An execution already exists at this exact instant; nudge by a
            // millisecond rather than failing the trigger.
            None => db
                .create_pending_execution(task.id, tenant_id, scheduled_for + 1, 1, None, now_ms)
                .await?
                .ok_or_else(|| {
                    DispatchError::validation("at", "Execution already scheduled at this instant")
                })?,
        };

        let execution = db
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Execution {} vanished after insert", execution_id))?;
        drop(db);

        self.worker_notify.notify_waiters();
        info!(tenant_id, task_id, execution_id, "Task triggered");
        Ok(execution)
    }

    /// Create up to 1000 one-shot tasks sharing a queue and settings. The
    /// tier cap is checked up front: either the whole batch fits or
    /// nothing is created.
    pub async fn create_batch(
        &self,
        tenant_id: i64,
        spec: BatchSpec,
        items: Vec<BatchItem>,
        now_ms: i64,
    ) -> Result<BatchResult> {
        let tenant = self.require_tenant(tenant_id).await?;

        let max_items = shared::defaults::default_max_batch_items();
        if items.is_empty() {
            return Err(DispatchError::validation("items", "Batch is empty").into());
        }
        if items.len() > max_items {
            return Err(DispatchError::BatchTooLarge {
                size: items.len(),
                max: max_items,
            }
            .into());
        }
        for item in &items {
            validate_destination_url(&item.url)?;
        }
        if !(0..=MAX_RETRY_ATTEMPTS).contains(&spec.retry_attempts) {
            return Err(DispatchError::validation(
                "retry_attempts",
                format!("Must be between 0 and {}", MAX_RETRY_ATTEMPTS),
            )
            .into());
        }

        self.check_cap(&tenant, items.len() as i64).await?;

        let scheduled_for = spec.scheduled_at.unwrap_or(now_ms + 1000).max(now_ms);
        let queue = spec
            .queue
            .clone()
            .filter(|q| !q.is_empty())
            .unwrap_or_else(|| format!("batch-{}", now_ms));

        let count = items.len();
        let mut db = self.database.lock().await;
        for (index, item) in items.into_iter().enumerate() {
            let new = NewTask {
                tenant_id,
                name: item
                    .name
                    .unwrap_or_else(|| format!("{} #{}", queue, index + 1)),
                url: item.url,
                method: spec.method.to_uppercase(),
                headers: spec.headers.clone(),
                body: item.body.or_else(|| spec.body.clone()),
                schedule_type: ScheduleType::Once,
                cron_expression: None,
                scheduled_at: Some(scheduled_for),
                enabled: true,
                queue: queue.clone(),
                timeout_ms: spec.timeout_ms,
                retry_attempts: spec.retry_attempts,
                expected_status_codes: None,
                expected_body_pattern: None,
                callback_url: spec.callback_url.clone(),
                alert_on_failure: spec.alert_on_failure,
                muted: spec.muted,
                interval_minutes: None,
                next_run_at: Some(scheduled_for),
                source_endpoint_id: None,
            };
            db.insert_task(&new, now_ms).await?;
        }
        drop(db);

        info!(tenant_id, queue = %queue, count, "Batch created");
        Ok(BatchResult {
            queue,
            count,
            scheduled_for,
        })
    }

    /// Cancel everything in a queue: pending executions and the tasks
    /// themselves. Returns the number of cancelled executions.
    pub async fn cancel_by_queue(&self, tenant_id: i64, queue: &str, now_ms: i64) -> Result<usize> {
        if queue.is_empty() {
            return Err(DispatchError::validation("queue", "Queue name required").into());
        }
        self.require_tenant(tenant_id).await?;
        let mut db = self.database.lock().await;
        db.cancel_queue(tenant_id, queue, now_ms).await
    }

    pub async fn pause_queue(&self, tenant_id: i64, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(DispatchError::validation("queue", "Queue name required").into());
        }
        self.require_tenant(tenant_id).await?;
        let mut db = self.database.lock().await;
        db.set_queue_paused(tenant_id, name, true).await
    }

    pub async fn resume_queue(&self, tenant_id: i64, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(DispatchError::validation("queue", "Queue name required").into());
        }
        self.require_tenant(tenant_id).await?;
        let mut db = self.database.lock().await;
        db.set_queue_paused(tenant_id, name, false).await?;
        drop(db);
        // Resuming may unblock claimable work immediately.
        self.worker_notify.notify_waiters();
        Ok(())
    }

    pub async fn list_queue_states(&self, tenant_id: i64) -> Result<Vec<QueueState>> {
        let mut db = self.database.lock().await;
        db.list_queue_states(tenant_id).await
    }

    // ========== Monitors ==========

    pub async fn create_monitor(
        &self,
        tenant_id: i64,
        spec: MonitorSpec,
        now_ms: i64,
    ) -> Result<Monitor> {
        self.require_tenant(tenant_id).await?;
        validate_monitor_spec(&spec)?;

        let new = NewMonitor {
            tenant_id,
            name: spec.name,
            ping_token: generate_token(24),
            schedule_type: spec.schedule_type,
            interval_seconds: spec.interval_seconds,
            cron_expression: spec.cron_expression,
            grace_period_seconds: spec.grace_period_seconds,
            enabled: spec.enabled,
            muted: spec.muted,
        };

        let mut db = self.database.lock().await;
        db.insert_monitor(&new, now_ms).await
    }

    pub async fn update_monitor(
        &self,
        tenant_id: i64,
        monitor_id: i64,
        spec: MonitorSpec,
        now_ms: i64,
    ) -> Result<Monitor> {
        validate_monitor_spec(&spec)?;
        let mut monitor = self.require_monitor(tenant_id, monitor_id).await?;

        monitor.name = spec.name;
        monitor.schedule_type = spec.schedule_type;
        monitor.interval_seconds = spec.interval_seconds;
        monitor.cron_expression = spec.cron_expression;
        monitor.grace_period_seconds = spec.grace_period_seconds;
        monitor.muted = spec.muted;
        monitor.enabled = spec.enabled;

        let mut db = self.database.lock().await;
        db.update_monitor(&monitor, now_ms).await?;
        drop(db);
        self.require_monitor(tenant_id, monitor_id).await
    }

    pub async fn delete_monitor(&self, tenant_id: i64, monitor_id: i64) -> Result<()> {
        let mut db = self.database.lock().await;
        if !db.delete_monitor(tenant_id, monitor_id).await? {
            return Err(DispatchError::NotFound("Monitor").into());
        }
        Ok(())
    }

    /// Enable/disable a monitor. Disabling parks it in `paused`; enabling
    /// restores `up`/`new` and grants a fresh expectation window.
    pub async fn toggle_monitor(
        &self,
        tenant_id: i64,
        monitor_id: i64,
        now_ms: i64,
    ) -> Result<Monitor> {
        let mut monitor = self.require_monitor(tenant_id, monitor_id).await?;
        monitor.enabled = !monitor.enabled;

        if monitor.enabled {
            monitor.status = if monitor.last_ping_at.is_some() {
                MonitorStatus::Up
            } else {
                MonitorStatus::New
            };
            monitor.next_expected_at = match monitor.schedule_type {
                MonitorScheduleType::Interval => monitor
                    .interval_seconds
                    .filter(|s| *s > 0)
                    .map(|s| now_ms + s * 1000),
                MonitorScheduleType::Cron => match monitor.cron_expression.as_deref() {
                    Some(expr) => cron::next_after(expr, now_ms)?,
                    None => None,
                },
            };
        } else {
            monitor.status = MonitorStatus::Paused;
        }

        let mut db = self.database.lock().await;
        db.update_monitor(&monitor, now_ms).await?;
        drop(db);
        self.require_monitor(tenant_id, monitor_id).await
    }

    pub async fn list_monitors(&self, tenant_id: i64) -> Result<Vec<Monitor>> {
        let mut db = self.database.lock().await;
        db.list_monitors(tenant_id).await
    }

    // ========== Endpoints ==========

    pub async fn create_endpoint(
        &self,
        tenant_id: i64,
        spec: EndpointSpec,
        now_ms: i64,
    ) -> Result<Endpoint> {
        self.require_tenant(tenant_id).await?;
        let slug = resolve_slug(&spec)?;
        validate_endpoint_spec(&spec)?;

        let new = NewEndpoint {
            tenant_id,
            name: spec.name,
            slug,
            forward_urls: spec.forward_urls,
            use_queue: spec.use_queue,
            retry_attempts: spec.retry_attempts,
            alert_on_failure: spec.alert_on_failure,
            callback_url: spec.callback_url,
            on_failure_url: spec.on_failure_url,
            on_recovery_url: spec.on_recovery_url,
            secret: spec.secret,
            enabled: spec.enabled,
        };

        let mut db = self.database.lock().await;
        db.insert_endpoint(&new, now_ms).await
    }

    pub async fn update_endpoint(
        &self,
        tenant_id: i64,
        endpoint_id: i64,
        spec: EndpointSpec,
        now_ms: i64,
    ) -> Result<Endpoint> {
        let slug = resolve_slug(&spec)?;
        validate_endpoint_spec(&spec)?;
        let mut endpoint = self.require_endpoint(tenant_id, endpoint_id).await?;

        endpoint.name = spec.name;
        endpoint.slug = slug;
        endpoint.forward_urls = spec.forward_urls;
        endpoint.use_queue = spec.use_queue;
        endpoint.retry_attempts = spec.retry_attempts;
        endpoint.alert_on_failure = spec.alert_on_failure;
        endpoint.callback_url = spec.callback_url;
        endpoint.on_failure_url = spec.on_failure_url;
        endpoint.on_recovery_url = spec.on_recovery_url;
        endpoint.secret = spec.secret;
        endpoint.enabled = spec.enabled;

        let mut db = self.database.lock().await;
        db.update_endpoint(&endpoint, now_ms).await?;
        drop(db);
        self.require_endpoint(tenant_id, endpoint_id).await
    }

    pub async fn delete_endpoint(&self, tenant_id: i64, endpoint_id: i64) -> Result<()> {
        let mut db = self.database.lock().await;
        if !db.delete_endpoint(tenant_id, endpoint_id).await? {
            return Err(DispatchError::NotFound("Endpoint").into());
        }
        Ok(())
    }

    pub async fn list_endpoints(&self, tenant_id: i64) -> Result<Vec<Endpoint>> {
        let mut db = self.database.lock().await;
        db.list_endpoints(tenant_id).await
    }

    // ========== Sync ==========

    /// Reconcile declared state against stored state, matched by `name`
    /// within (tenant, kind). With `delete_removed`, entities absent from
    /// the declaration are removed (tasks soft-deleted, monitors and
    /// endpoints hard-deleted).
    pub async fn sync(
        &self,
        tenant_id: i64,
        request: SyncRequest,
        now_ms: i64,
    ) -> Result<SyncSummary> {
        self.require_tenant(tenant_id).await?;
        let mut summary = SyncSummary::default();

        if let Some(task_specs) = request.tasks {
            let declared: BTreeSet<String> =
                task_specs.iter().map(|s| s.name.clone()).collect();

            for spec in task_specs {
                let existing = {
                    let mut db = self.database.lock().await;
                    db.find_task_by_name(tenant_id, &spec.name).await?
                };
                match existing {
                    Some(task) => {
                        let patch = patch_from_spec(&spec);
                        self.update_task(tenant_id, task.id, patch, now_ms).await?;
                        summary.tasks.updated += 1;
                    }
                    None => {
                        self.create_task(tenant_id, spec, now_ms).await?;
                        summary.tasks.created += 1;
                    }
                }
            }

            if request.delete_removed {
                let existing = self.list_tasks(tenant_id).await?;
                for task in existing {
                    // Fan-out tasks are owned by their endpoint, not the
                    // declaration.
                    if task.source_endpoint_id.is_none() && !declared.contains(&task.name) {
                        self.soft_delete_task(tenant_id, task.id, now_ms).await?;
                        summary.tasks.deleted += 1;
                    }
                }
            }
        }

        if let Some(monitor_specs) = request.monitors {
            let declared: BTreeSet<String> =
                monitor_specs.iter().map(|s| s.name.clone()).collect();

            for spec in monitor_specs {
                let existing = {
                    let mut db = self.database.lock().await;
                    db.find_monitor_by_name(tenant_id, &spec.name).await?
                };
                match existing {
                    Some(monitor) => {
                        self.update_monitor(tenant_id, monitor.id, spec, now_ms)
                            .await?;
                        summary.monitors.updated += 1;
                    }
                    None => {
                        self.create_monitor(tenant_id, spec, now_ms).await?;
                        summary.monitors.created += 1;
                    }
                }
            }

            if request.delete_removed {
                for monitor in self.list_monitors(tenant_id).await? {
                    if !declared.contains(&monitor.name) {
                        self.delete_monitor(tenant_id, monitor.id).await?;
                        summary.monitors.deleted += 1;
                    }
                }
            }
        }

        if let Some(endpoint_specs) = request.endpoints {
            let declared: BTreeSet<String> =
                endpoint_specs.iter().map(|s| s.name.clone()).collect();

            for spec in endpoint_specs {
                let existing = {
                    let mut db = self.database.lock().await;
                    db.find_endpoint_by_name(tenant_id, &spec.name).await?
                };
                match existing {
                    Some(endpoint) => {
                        self.update_endpoint(tenant_id, endpoint.id, spec, now_ms)
                            .await?;
                        summary.endpoints.updated += 1;
                    }
                    None => {
                        self.create_endpoint(tenant_id, spec, now_ms).await?;
                        summary.endpoints.created += 1;
                    }
                }
            }

            if request.delete_removed {
                for endpoint in self.list_endpoints(tenant_id).await? {
                    if !declared.contains(&endpoint.name) {
                        self.delete_endpoint(tenant_id, endpoint.id).await?;
                        summary.endpoints.deleted += 1;
                    }
                }
            }
        }

        info!(tenant_id, ?summary, "Sync complete");
        Ok(summary)
    }

    // ========== Usage ==========

    /// The tenant's month-to-date execution count: persisted value plus the
    /// not-yet-flushed in-process delta.
    pub async fn current_usage(&self, tenant_id: i64) -> Result<i64> {
        let tenant = self.require_tenant(tenant_id).await?;
        Ok(tenant.monthly_execution_count + self.counter.pending_delta(tenant_id))
    }

    // ========== Internals ==========

    async fn require_tenant(&self, tenant_id: i64) -> Result<Tenant> {
        let mut db = self.database.lock().await;
        db.get_tenant(tenant_id)
            .await?
            .ok_or_else(|| DispatchError::NotFound("Tenant").into())
    }

    async fn require_task(&self, tenant_id: i64, task_id: i64) -> Result<Task> {
        let mut db = self.database.lock().await;
        db.get_task(tenant_id, task_id)
            .await?
            .ok_or_else(|| DispatchError::NotFound("Task").into())
    }

    async fn require_monitor(&self, tenant_id: i64, monitor_id: i64) -> Result<Monitor> {
        let mut db = self.database.lock().await;
        db.get_monitor(tenant_id, monitor_id)
            .await?
            .ok_or_else(|| DispatchError::NotFound("Monitor").into())
    }

    async fn require_endpoint(&self, tenant_id: i64, endpoint_id: i64) -> Result<Endpoint> {
        let mut db = self.database.lock().await;
        db.get_endpoint(tenant_id, endpoint_id)
            .await?
            .ok_or_else(|| DispatchError::NotFound("Endpoint").into())
    }

    /// Reject when adding `additional` runs would cross the tenant's tier
    /// cap. The counter is left untouched either way.
    async fn check_cap(&self, tenant: &Tenant, additional: i64) -> Result<()> {
        if tenant.plan == PlanTier::Pro {
            return Ok(());
        }
        let current = tenant.monthly_execution_count + self.counter.pending_delta(tenant.id);
        if current + additional > self.config.monthly_cap_free {
            return Err(DispatchError::LimitExceeded(format!(
                "Monthly execution cap of {} reached",
                self.config.monthly_cap_free
            ))
            .into());
        }
        Ok(())
    }
}

/// Validate a task spec against a tenant. Returns the derived
/// `(interval_minutes, next_run_at)` for the schedule.
fn validate_task_spec(
    tenant: &Tenant,
    spec: &TaskSpec,
    now_ms: i64,
    is_create: bool,
) -> Result<(Option<i64>, Option<i64>)> {
    if spec.name.trim().is_empty() {
        return Err(DispatchError::validation("name", "Name is required").into());
    }
    if spec.name.len() > MAX_NAME_LEN {
        return Err(DispatchError::validation(
            "name",
            format!("Name longer than {} characters", MAX_NAME_LEN),
        )
        .into());
    }

    validate_destination_url(&spec.url)?;
    if let Some(callback) = spec.callback_url.as_deref() {
        validate_destination_url(callback)?;
    }

    let method = spec.method.to_uppercase();
    const METHODS: [&str; 7] = ["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];
    if !METHODS.contains(&method.as_str()) {
        return Err(
            DispatchError::validation("method", format!("Unsupported method '{}'", spec.method))
                .into(),
        );
    }

    if !(0..=MAX_RETRY_ATTEMPTS).contains(&spec.retry_attempts) {
        return Err(DispatchError::validation(
            "retry_attempts",
            format!("Must be between 0 and {}", MAX_RETRY_ATTEMPTS),
        )
        .into());
    }
    if !(MIN_TIMEOUT_MS..=MAX_TIMEOUT_MS).contains(&spec.timeout_ms) {
        return Err(DispatchError::validation(
            "timeout_ms",
            format!("Must be between {} and {}", MIN_TIMEOUT_MS, MAX_TIMEOUT_MS),
        )
        .into());
    }

    if let Some(codes) = spec.expected_status_codes.as_deref() {
        if !codes.trim().is_empty() {
            for part in codes.split(',') {
                let code: u16 = part.trim().parse().map_err(|_| {
                    DispatchError::validation(
                        "expected_status_codes",
                        format!("'{}' is not a status code", part.trim()),
                    )
                })?;
                if !(100..=599).contains(&code) {
                    return Err(DispatchError::validation(
                        "expected_status_codes",
                        format!("{} is outside 100-599", code),
                    )
                    .into());
                }
            }
        }
    }

    match spec.schedule_type {
        ScheduleType::Cron => {
            let expr = spec.cron_expression.as_deref().ok_or_else(|| {
                DispatchError::validation("cron_expression", "Required for cron tasks")
            })?;
            cron::validate_expression(expr).map_err(|e| {
                DispatchError::validation("cron_expression", e.to_string())
            })?;

            let interval = cron::estimate_interval_minutes(expr)?;
            // Tier gate, enforced at create/update time, never at schedule
            // time.
            if tenant.plan == PlanTier::Free && interval < SUB_HOURLY_MINUTES {
                return Err(DispatchError::validation(
                    "cron_expression",
                    "Sub-hourly schedules require the pro plan",
                )
                .into());
            }

            let next = cron::next_after(expr, now_ms)?;
            Ok((Some(interval), next))
        }
        ScheduleType::Once => {
            let at = spec.scheduled_at.ok_or_else(|| {
                DispatchError::validation("scheduled_at", "Required for once tasks")
            })?;
            if is_create && at <= now_ms {
                return Err(DispatchError::validation(
                    "scheduled_at",
                    "Must be in the future",
                )
                .into());
            }
            Ok((None, Some(at)))
        }
    }
}

fn validate_monitor_spec(spec: &MonitorSpec) -> Result<()> {
    if spec.name.trim().is_empty() {
        return Err(DispatchError::validation("name", "Name is required").into());
    }
    if spec.grace_period_seconds < 0 {
        return Err(
            DispatchError::validation("grace_period_seconds", "Must not be negative").into(),
        );
    }

    match spec.schedule_type {
        MonitorScheduleType::Interval => {
            let interval = spec.interval_seconds.ok_or_else(|| {
                DispatchError::validation("interval_seconds", "Required for interval monitors")
            })?;
            if interval < 10 {
                return Err(DispatchError::validation(
                    "interval_seconds",
                    "Must be at least 10 seconds",
                )
                .into());
            }
        }
        MonitorScheduleType::Cron => {
            let expr = spec.cron_expression.as_deref().ok_or_else(|| {
                DispatchError::validation("cron_expression", "Required for cron monitors")
            })?;
            cron::validate_expression(expr)
                .map_err(|e| DispatchError::validation("cron_expression", e.to_string()))?;
        }
    }
    Ok(())
}

fn resolve_slug(spec: &EndpointSpec) -> Result<String> {
    let slug = match spec.slug.as_deref() {
        Some(slug) if !slug.is_empty() => slug.to_string(),
        _ => slugify(&spec.name),
    };
    if slug.is_empty() {
        return Err(DispatchError::validation("slug", "Slug is required").into());
    }
    if slugify(&slug) != slug {
        return Err(DispatchError::validation(
            "slug",
            "Only lowercase alphanumerics and hyphens",
        )
        .into());
    }
    Ok(slug)
}

fn validate_endpoint_spec(spec: &EndpointSpec) -> Result<()> {
    if spec.name.trim().is_empty() {
        return Err(DispatchError::validation("name", "Name is required").into());
    }
    let max_urls = shared::defaults::default_max_forward_urls();
    if spec.forward_urls.is_empty() {
        return Err(
            DispatchError::validation("forward_urls", "At least one forward URL").into(),
        );
    }
    if spec.forward_urls.len() > max_urls {
        return Err(DispatchError::validation(
            "forward_urls",
            format!("At most {} forward URLs", max_urls),
        )
        .into());
    }
    for url in &spec.forward_urls {
        validate_destination_url(url)?;
    }
    for url in [&spec.callback_url, &spec.on_failure_url, &spec.on_recovery_url]
        .into_iter()
        .flatten()
    {
        validate_destination_url(url)?;
    }
    if !(0..=MAX_RETRY_ATTEMPTS).contains(&spec.retry_attempts) {
        return Err(DispatchError::validation(
            "retry_attempts",
            format!("Must be between 0 and {}", MAX_RETRY_ATTEMPTS),
        )
        .into());
    }
    Ok(())
}

/// Overlay a patch onto a task in place.
fn apply_task_patch(task: &mut Task, patch: TaskPatch) {
    if let Some(name) = patch.name {
        task.name = name;
    }
    if let Some(url) = patch.url {
        task.url = url;
    }
    if let Some(method) = patch.method {
        task.method = method.to_uppercase();
    }
    if let Some(headers) = patch.headers {
        task.headers = headers;
    }
    if let Some(body) = patch.body {
        task.body = body;
    }
    if let Some(schedule_type) = patch.schedule_type {
        task.schedule_type = schedule_type;
    }
    if let Some(expr) = patch.cron_expression {
        task.cron_expression = expr;
    }
    if let Some(at) = patch.scheduled_at {
        task.scheduled_at = at;
    }
    if let Some(queue) = patch.queue {
        task.queue = queue;
    }
    if let Some(timeout_ms) = patch.timeout_ms {
        task.timeout_ms = timeout_ms;
    }
    if let Some(retry_attempts) = patch.retry_attempts {
        task.retry_attempts = retry_attempts;
    }
    if let Some(codes) = patch.expected_status_codes {
        task.expected_status_codes = codes;
    }
    if let Some(pattern) = patch.expected_body_pattern {
        task.expected_body_pattern = pattern;
    }
    if let Some(callback) = patch.callback_url {
        task.callback_url = callback;
    }
    if let Some(alert) = patch.alert_on_failure {
        task.alert_on_failure = alert;
    }
    if let Some(muted) = patch.muted {
        task.muted = muted;
    }
    if let Some(enabled) = patch.enabled {
        task.enabled = enabled;
    }
}

/// View a stored task as a spec, for re-validation after patching.
fn spec_from_task(task: &Task) -> TaskSpec {
    TaskSpec {
        name: task.name.clone(),
        url: task.url.clone(),
        method: task.method.clone(),
        headers: task.headers.clone(),
        body: task.body.clone(),
        schedule_type: task.schedule_type,
        cron_expression: task.cron_expression.clone(),
        scheduled_at: task.scheduled_at,
        queue: task.queue.clone(),
        timeout_ms: task.timeout_ms,
        retry_attempts: task.retry_attempts,
        expected_status_codes: task.expected_status_codes.clone(),
        expected_body_pattern: task.expected_body_pattern.clone(),
        callback_url: task.callback_url.clone(),
        alert_on_failure: task.alert_on_failure,
        muted: task.muted,
        enabled: task.enabled,
    }
}

/// Turn a full spec into a patch that overwrites every field, for Sync.
fn patch_from_spec(spec: &TaskSpec) -> TaskPatch {
    TaskPatch {
        name: Some(spec.name.clone()),
        url: Some(spec.url.clone()),
        method: Some(spec.method.clone()),
        headers: Some(spec.headers.clone()),
        body: Some(spec.body.clone()),
        schedule_type: Some(spec.schedule_type),
        cron_expression: Some(spec.cron_expression.clone()),
        scheduled_at: Some(spec.scheduled_at),
        queue: Some(spec.queue.clone()),
        timeout_ms: Some(spec.timeout_ms),
        retry_attempts: Some(spec.retry_attempts),
        expected_status_codes: Some(spec.expected_status_codes.clone()),
        expected_body_pattern: Some(spec.expected_body_pattern.clone()),
        callback_url: Some(spec.callback_url.clone()),
        alert_on_failure: Some(spec.alert_on_failure),
        muted: Some(spec.muted),
        enabled: Some(spec.enabled),
    }
}
