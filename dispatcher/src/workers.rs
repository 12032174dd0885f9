//! Worker pool: claim, dispatch, record
//!
//! A pool controller sizes a set of worker tasks against the pending queue
//! depth, between `min_workers` and `max_workers`. Each worker loops
//! claim -> dispatch -> update and exits after enough consecutive empty
//! polls; the controller respawns workers as depth returns. The controller
//! tick also runs the orphan sweep so executions whose worker died are
//! promoted to `timeout` instead of sticking in `running` forever.

use crate::callbacks::{Notifier, EVENT_COMPLETED, EVENT_FAILED, EVENT_RECOVERED};
use crate::counter::ExecutionCounter;
use crate::database::DispatcherDatabase;
use crate::host_blocker::HostBlocker;
use anyhow::{Context, Result};
use shared::config::ServiceConfig;
use shared::model::{Execution, ExecutionStatus, Task, Tenant};
use shared::utils::{current_timestamp_millis, parse_retry_after, retry_backoff_ms, truncate_string};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Status codes treated as transient downstream failures, eligible for
/// retry and counted against the host's health.
const TRANSIENT_STATUS: [u16; 7] = [408, 425, 429, 500, 502, 503, 504];

/// Everything a worker needs, cheap to clone into spawned tasks.
#[derive(Clone)]
pub struct WorkerContext {
    pub database: Arc<Mutex<DispatcherDatabase>>,
    pub blocker: HostBlocker,
    pub counter: ExecutionCounter,
    pub notifier: Notifier,
    pub config: Arc<ServiceConfig>,
    pub http_client: reqwest::Client,
    pub shutdown_tx: broadcast::Sender<()>,
}

/// What came back from one HTTP dispatch.
#[derive(Debug, Default)]
struct DispatchResult {
    status_code: Option<u16>,
    /// Response body, read up to the assertion limit.
    body: String,
    error: Option<String>,
    timed_out: bool,
    /// Parsed `Retry-After`, as a delay from now in ms.
    retry_after_ms: Option<i64>,
}

/// How a terminal outcome was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    TransientFailure,
    PermanentFailure,
}

/// Dynamically sized pool of dispatch workers.
pub struct WorkerPool {
    context: WorkerContext,
    worker_notify: Arc<Notify>,
    workers: Vec<JoinHandle<()>>,
    next_worker_id: u64,
}

impl WorkerPool {
    pub fn new(context: WorkerContext, worker_notify: Arc<Notify>) -> Self {
        Self {
            context,
            worker_notify,
            workers: Vec::new(),
            next_worker_id: 0,
        }
    }

    /// Controller loop: once a second (or when the scheduler signals fresh
    /// work) sweep orphans, prune finished workers, and grow the pool
    /// toward the current queue depth.
    pub async fn run(&mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            min_workers = self.context.config.min_workers,
            max_workers = self.context.config.max_workers,
            "Worker pool controller started"
        );
        let mut interval = tokio::time::interval(Duration::from_secs(1));

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.worker_notify.notified() => {}
                _ = shutdown_rx.recv() => {
                    info!("Worker pool received shutdown signal");
                    break;
                }
            }

            if let Err(e) = self.controller_tick().await {
                error!("Worker pool tick failed: {}", e);
            }
        }

        self.shutdown_workers().await;
    }

    /// One controller pass. Public-ish granularity so the run loop stays a
    /// skeleton.
    async fn controller_tick(&mut self) -> Result<()> {
        let now_ms = current_timestamp_millis();

        {
            let mut db = self.context.database.lock().await;
            db.sweep_orphan_executions(self.context.config.orphan_sweep_slack_ms as i64, now_ms)
                .await?;
        }

        self.workers.retain(|handle| !handle.is_finished());

        let depth = {
            let mut db = self.context.database.lock().await;
            db.pending_depth(now_ms).await?
        };

        let config = &self.context.config;
        let target = (depth.max(0) as usize)
            .max(config.min_workers)
            .min(config.max_workers);

        while self.workers.len() < target {
            let worker_id = self.next_worker_id;
            self.next_worker_id += 1;
            let ctx = self.context.clone();
            let notify = Arc::clone(&self.worker_notify);
            debug!(worker_id, "Spawning worker");
            self.workers
                .push(tokio::spawn(worker_loop(ctx, notify, worker_id)));
        }

        Ok(())
    }

    /// Let in-flight dispatches finish within the graceful window, then
    /// abort whatever is left.
    async fn shutdown_workers(&mut self) {
        let timeout =
            Duration::from_secs(self.context.config.graceful_shutdown_timeout_seconds);
        info!(
            workers = self.workers.len(),
            "Waiting for workers to finish (timeout: {:?})",
            timeout
        );

        let drain = async {
            for handle in self.workers.drain(..) {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(timeout, drain).await.is_err() {
            warn!("Graceful shutdown timeout reached, aborting remaining workers");
            for handle in self.workers.drain(..) {
                handle.abort();
            }
        }

        info!("Worker pool stopped");
    }
}

/// One worker: claim until the queue runs dry for long enough, then exit.
async fn worker_loop(ctx: WorkerContext, notify: Arc<Notify>, worker_id: u64) {
    let mut shutdown_rx = ctx.shutdown_tx.subscribe();
    let mut idle_polls: u32 = 0;

    loop {
        let now_ms = current_timestamp_millis();
        let claimed = {
            let mut db = ctx.database.lock().await;
            db.claim_next_execution(now_ms).await
        };

        match claimed {
            Ok(Some(execution)) => {
                idle_polls = 0;
                if let Err(e) = process_execution(&ctx, execution).await {
                    // The worker's top frame: log with correlation ids and
                    // keep claiming.
                    error!(worker_id, "Execution processing failed: {}", e);
                }
            }
            Ok(None) => {
                idle_polls += 1;
                if idle_polls >= ctx.config.worker_idle_polls {
                    debug!(worker_id, "Worker idle, terminating");
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(ctx.config.worker_poll_interval_ms)) => {}
                    _ = notify.notified() => {}
                    _ = shutdown_rx.recv() => {
                        debug!(worker_id, "Worker received shutdown signal");
                        return;
                    }
                }
            }
            Err(e) => {
                error!(worker_id, "Claim failed: {}", e);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(ctx.config.worker_poll_interval_ms)) => {}
                    _ = shutdown_rx.recv() => return,
                }
            }
        }

        if shutdown_rx.try_recv().is_ok() {
            debug!(worker_id, "Worker observed shutdown flag");
            return;
        }
    }
}

/// Dispatch one claimed execution and record its terminal state, retries,
/// counter bump, callbacks and alerts.
pub(crate) async fn process_execution(ctx: &WorkerContext, execution: Execution) -> Result<()> {
    let now_ms = current_timestamp_millis();

    let (task, tenant) = {
        let mut db = ctx.database.lock().await;
        let task = db.get_task_any(execution.task_id).await?;
        let tenant = db.get_tenant(execution.tenant_id).await?;
        (task, tenant)
    };

    let Some(task) = task else {
        // The task row went away under us; close the execution quietly.
        let mut db = ctx.database.lock().await;
        db.finish_execution(
            execution.id,
            ExecutionStatus::Failed,
            None,
            None,
            Some("Task no longer exists"),
            now_ms,
        )
        .await?;
        return Ok(());
    };
    let Some(tenant) = tenant else {
        let mut db = ctx.database.lock().await;
        db.finish_execution(
            execution.id,
            ExecutionStatus::Failed,
            None,
            None,
            Some("Tenant no longer exists"),
            now_ms,
        )
        .await?;
        return Ok(());
    };

    let host = url::Url::parse(&task.url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_default();

    // Circuit breaker: a blocked host defers the execution instead of
    // burning an attempt on it.
    if let Some(blocked_until) = ctx.blocker.blocked_until(tenant.id, &host, now_ms).await {
        debug!(
            execution_id = execution.id,
            host, blocked_until, "Host blocked, rescheduling execution"
        );
        let mut db = ctx.database.lock().await;
        db.reschedule_execution(execution.id, blocked_until).await?;
        return Ok(());
    }

    let result = dispatch(ctx, &task, &execution).await;
    let finished_ms = current_timestamp_millis();

    let outcome = classify(&task, &result);
    let status = match outcome {
        Outcome::Success => ExecutionStatus::Success,
        Outcome::TransientFailure if result.timed_out => ExecutionStatus::Timeout,
        _ => ExecutionStatus::Failed,
    };

    update_host_blocker(ctx, tenant.id, &host, &result, finished_ms).await;

    // Transient failures get a fresh pending row with attempt + 1; the
    // current row stays terminal either way.
    let mut retried = false;
    if outcome == Outcome::TransientFailure && execution.attempt < task.retry_attempts + 1 {
        let delay_ms = result.retry_after_ms.unwrap_or_else(|| {
            retry_backoff_ms(
                execution.attempt as u32,
                ctx.config.retry_backoff_base_ms,
                ctx.config.retry_backoff_cap_ms,
            ) as i64
        });
        let mut db = ctx.database.lock().await;
        db.create_pending_execution(
            task.id,
            tenant.id,
            finished_ms + delay_ms,
            execution.attempt + 1,
            execution.callback_url.as_deref(),
            finished_ms,
        )
        .await?;
        retried = true;
        info!(
            task_id = task.id,
            attempt = execution.attempt,
            delay_ms,
            "Scheduled retry"
        );
    }

    let stored_body = if result.body.is_empty() {
        None
    } else {
        Some(truncate_string(
            &result.body,
            shared::defaults::default_stored_body_limit(),
        ))
    };
    let error_message = result.error.as_deref().or_else(|| {
        if status == ExecutionStatus::Success {
            None
        } else if result.status_code.is_some() {
            Some("Response failed status or body assertions")
        } else {
            None
        }
    });

    let recorded = {
        let mut db = ctx.database.lock().await;
        db.finish_execution(
            execution.id,
            status,
            result.status_code.map(i64::from),
            stored_body.as_deref(),
            error_message,
            finished_ms,
        )
        .await?
    };
    if !recorded {
        // Poison execution: the row was cancelled or swept while we were
        // dispatching. Swallow and move on; no counter, no alerts.
        debug!(execution_id = execution.id, "Terminal update lost its row, skipping");
        return Ok(());
    }

    // The monthly counter counts logical task runs: only the first attempt's
    // terminal transition increments it, however many retries follow.
    if execution.attempt == 1 {
        ctx.counter.increment(tenant.id);
    }

    let finished_execution = {
        let mut db = ctx.database.lock().await;
        db.get_execution(execution.id).await?
    }
    .unwrap_or(execution);

    fan_out_notifications(ctx, &tenant, &task, &finished_execution, status, retried).await?;

    Ok(())
}

/// Issue the HTTP request for a task with its timeout, headers and body,
/// reading at most the assertion limit of the response.
async fn dispatch(ctx: &WorkerContext, task: &Task, execution: &Execution) -> DispatchResult {
    let method = reqwest::Method::from_bytes(task.method.as_bytes())
        .unwrap_or(reqwest::Method::POST);
    let timeout = Duration::from_millis(task.timeout_ms.max(1) as u64);

    let mut request = ctx
        .http_client
        .request(method, &task.url)
        .timeout(timeout)
        .header("X-Task-Id", task.id.to_string())
        .header("X-Execution-Id", execution.id.to_string())
        .header("X-Attempt", execution.attempt.to_string());

    for (name, value) in &task.headers {
        request = request.header(name, value);
    }
    if let Some(body) = &task.body {
        request = request.body(body.clone());
    }

    debug!(
        task_id = task.id,
        execution_id = execution.id,
        url = %task.url,
        attempt = execution.attempt,
        "Dispatching"
    );

    let mut response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            return DispatchResult {
                timed_out: e.is_timeout(),
                error: Some(format!("Request failed: {}", e)),
                ..Default::default()
            };
        }
    };

    let status_code = response.status().as_u16();
    let now_ms = current_timestamp_millis();
    let retry_after_ms = response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| parse_retry_after(v, now_ms));

    // Bounded body read: enough for the substring assertion, no more.
    let limit = shared::defaults::default_assertion_read_limit();
    let mut body_bytes: Vec<u8> = Vec::new();
    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                let remaining = limit.saturating_sub(body_bytes.len());
                if remaining == 0 {
                    break;
                }
                let take = chunk.len().min(remaining);
                body_bytes.extend_from_slice(&chunk[..take]);
            }
            Ok(None) => break,
            Err(e) => {
                // Keep what was read; a truncated body still serves the
                // assertion if the pattern landed early.
                return DispatchResult {
                    status_code: Some(status_code),
                    body: String::from_utf8_lossy(&body_bytes).into_owned(),
                    timed_out: e.is_timeout(),
                    error: Some(format!("Body read failed: {}", e)),
                    retry_after_ms,
                };
            }
        }
    }

    DispatchResult {
        status_code: Some(status_code),
        body: String::from_utf8_lossy(&body_bytes).into_owned(),
        error: None,
        timed_out: false,
        retry_after_ms,
    }
}

/// Evaluate assertions and classify the outcome.
fn classify(task: &Task, result: &DispatchResult) -> Outcome {
    if let Some(code) = result.status_code {
        let expected = task.expected_codes();
        let code_ok = if expected.is_empty() {
            (200..300).contains(&code)
        } else {
            expected.contains(&code)
        };
        let body_ok = match task.expected_body_pattern.as_deref() {
            Some(pattern) if !pattern.is_empty() => result.body.contains(pattern),
            _ => true,
        };

        if code_ok && body_ok && result.error.is_none() {
            return Outcome::Success;
        }
        if TRANSIENT_STATUS.contains(&code) {
            return Outcome::TransientFailure;
        }
        if result.error.is_some() {
            // The status arrived but the body read broke underneath us.
            return Outcome::TransientFailure;
        }
        // Non-transient status outside the asserted set, or an assertion
        // mismatch: retrying will not change the answer.
        return Outcome::PermanentFailure;
    }

    // No response at all: network failure or timeout.
    Outcome::TransientFailure
}

/// Feed the dispatch result into the per-(tenant, host) circuit breaker.
async fn update_host_blocker(
    ctx: &WorkerContext,
    tenant_id: i64,
    host: &str,
    result: &DispatchResult,
    now_ms: i64,
) {
    if host.is_empty() {
        return;
    }

    match result.status_code {
        Some(429) => {
            // Respect the server's pacing request, bounded to [1s, 24h].
            let duration_ms = result
                .retry_after_ms
                .unwrap_or((ctx.config.host_blocker_base_s as i64) * 1000);
            ctx.blocker
                .block(tenant_id, host, duration_ms, "rate limited", now_ms)
                .await;
        }
        Some(code) if code >= 500 => {
            ctx.blocker.record_failure(tenant_id, host, now_ms).await;
        }
        Some(_) => {
            ctx.blocker.record_success(tenant_id, host).await;
        }
        None => {
            // Connection-level failure counts against the host too.
            ctx.blocker.record_failure(tenant_id, host, now_ms).await;
        }
    }
}

/// Callbacks, alert emails and endpoint alert webhooks for one terminal
/// execution. `retried` marks that a follow-up attempt was scheduled, in
/// which case the failure is not yet final and alerting waits.
async fn fan_out_notifications(
    ctx: &WorkerContext,
    tenant: &Tenant,
    task: &Task,
    execution: &Execution,
    status: ExecutionStatus,
    retried: bool,
) -> Result<()> {
    let callback_url = execution
        .callback_url
        .clone()
        .or_else(|| task.callback_url.clone());

    let success = status == ExecutionStatus::Success;
    let event = if success { EVENT_COMPLETED } else { EVENT_FAILED };

    if let Some(url) = callback_url.clone() {
        let payload = Notifier::execution_payload(event, task, execution);
        ctx.notifier.spawn_callback(
            url,
            tenant.webhook_secret.clone(),
            payload,
            task.id,
            execution.id,
        );
    }

    let previous = {
        let mut db = ctx.database.lock().await;
        db.previous_terminal_status(task.id, execution.id).await?
    };
    let source_endpoint = match task.source_endpoint_id {
        Some(endpoint_id) => {
            let mut db = ctx.database.lock().await;
            db.get_endpoint(tenant.id, endpoint_id).await?
        }
        None => None,
    };

    if success {
        let recovered = matches!(
            previous,
            Some(ExecutionStatus::Failed) | Some(ExecutionStatus::Timeout)
        );
        if recovered {
            ctx.notifier.notify_task_recovery(tenant, task).await?;

            let payload = Notifier::execution_payload(EVENT_RECOVERED, task, execution);
            if let Some(url) = callback_url {
                ctx.notifier.spawn_callback(
                    url,
                    tenant.webhook_secret.clone(),
                    payload.clone(),
                    task.id,
                    execution.id,
                );
            }
            if let Some(url) = source_endpoint.as_ref().and_then(|e| e.on_recovery_url.clone()) {
                ctx.notifier.spawn_callback(
                    url,
                    tenant.webhook_secret.clone(),
                    payload,
                    task.id,
                    execution.id,
                );
            }
        }
    } else if !retried {
        // Final failure of the logical run: retries exhausted (or none).
        ctx.notifier
            .notify_task_failure(tenant, task, execution)
            .await?;

        if let Some(url) = source_endpoint.as_ref().and_then(|e| e.on_failure_url.clone()) {
            let payload = Notifier::execution_payload(EVENT_FAILED, task, execution);
            ctx.notifier.spawn_callback(
                url,
                tenant.webhook_secret.clone(),
                payload,
                task.id,
                execution.id,
            );
        }
    }

    Ok(())
}

/// Build the outbound dispatch HTTP client.
pub fn build_http_client(config: &ServiceConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(config.http_client_timeout_seconds.max(1)))
        .build()
        .context("Failed to create dispatch HTTP client")
}

#[cfg(test)]
pub(crate) fn classify_for_tests(task: &Task, status_code: Option<u16>, body: &str) -> &'static str {
    let result = DispatchResult {
        status_code,
        body: body.to_string(),
        ..Default::default()
    };
    match classify(task, &result) {
        Outcome::Success => "success",
        Outcome::TransientFailure => "transient",
        Outcome::PermanentFailure => "permanent",
    }
}
