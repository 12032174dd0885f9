//! Inbound event dispatcher
//!
//! Receives webhook deliveries addressed to an endpoint slug, persists them
//! as inbound events, and fans each one out into a task/execution pair per
//! forward URL. The caller gets its 2xx as soon as the rows are written;
//! dispatch happens on the worker pool afterwards. Recorded task ids make
//! replay possible long after the original delivery.

use crate::database::{DispatcherDatabase, NewTask};
use anyhow::Result;
use base64::Engine;
use shared::model::{Endpoint, ScheduleType};
use shared::utils::{sign_payload, slugify};
use shared::DispatchError;
use std::collections::BTreeMap;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

/// Fan-out creates executions one second out, giving the transaction room
/// to commit before a worker can claim them.
const FAN_OUT_DELAY_MS: i64 = 1000;

/// Headers never forwarded to destinations.
const DROPPED_HEADERS: [&str; 12] = [
    "host",
    "connection",
    "keep-alive",
    "transfer-encoding",
    "content-length",
    "upgrade",
    "expect",
    "te",
    "trailer",
    "proxy-authorization",
    "proxy-connection",
    "x-signature",
];

/// Result of receiving one inbound delivery.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ReceivedEvent {
    pub event_id: i64,
    pub task_count: usize,
}

/// Result of replaying an event.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ReplayResult {
    pub created: usize,
    pub skipped: usize,
}

/// Fans inbound deliveries out to their configured destinations.
pub struct InboundDispatcher {
    database: Arc<Mutex<DispatcherDatabase>>,
    worker_notify: Arc<Notify>,
}

impl InboundDispatcher {
    pub fn new(database: Arc<Mutex<DispatcherDatabase>>, worker_notify: Arc<Notify>) -> Self {
        Self {
            database,
            worker_notify,
        }
    }

    /// Handle one delivery to `/in/{slug}`.
    ///
    /// `signature` is the raw `X-Signature` header when present; endpoints
    /// with a configured secret require it to match the body.
    #[allow(clippy::too_many_arguments)]
    pub async fn receive_event(
        &self,
        slug: &str,
        method: &str,
        headers: &BTreeMap<String, String>,
        body: &[u8],
        source_ip: Option<&str>,
        signature: Option<&str>,
        now_ms: i64,
    ) -> Result<ReceivedEvent> {
        let endpoint = {
            let mut db = self.database.lock().await;
            db.get_endpoint_by_slug(slug).await?
        }
        .ok_or(DispatchError::NotFound("Endpoint"))?;

        if !endpoint.enabled {
            return Err(DispatchError::validation("endpoint", "Endpoint is disabled").into());
        }

        if let Some(secret) = endpoint.secret.as_deref() {
            verify_signature(secret, body, signature)?;
        }

        // Non-UTF-8 payloads are kept, base64-encoded, so replay loses
        // nothing.
        let (body_text, body_base64) = match std::str::from_utf8(body) {
            Ok(text) => (text.to_string(), false),
            Err(_) => (
                base64::engine::general_purpose::STANDARD.encode(body),
                true,
            ),
        };

        let forward_headers = forwarded_headers(headers, source_ip);

        let mut db = self.database.lock().await;
        let event_id = db
            .insert_inbound_event(
                endpoint.id,
                endpoint.tenant_id,
                method,
                headers,
                &body_text,
                body_base64,
                source_ip,
                now_ms,
            )
            .await?;

        let queue = if endpoint.use_queue {
            slugify(&endpoint.name)
        } else {
            String::new()
        };

        let mut task_ids = Vec::new();
        let max_urls = shared::defaults::default_max_forward_urls();
        for (index, url) in endpoint.forward_urls.iter().take(max_urls).enumerate() {
            let new_task = NewTask {
                tenant_id: endpoint.tenant_id,
                name: format!("{} #{}", endpoint.name, index + 1),
                url: url.clone(),
                method: method.to_string(),
                headers: forward_headers.clone(),
                body: if body_text.is_empty() {
                    None
                } else {
                    Some(body_text.clone())
                },
                schedule_type: ScheduleType::Once,
                cron_expression: None,
                scheduled_at: Some(now_ms + FAN_OUT_DELAY_MS),
                enabled: true,
                queue: queue.clone(),
                timeout_ms: shared::defaults::default_task_timeout_ms(),
                retry_attempts: endpoint.retry_attempts,
                expected_status_codes: None,
                expected_body_pattern: None,
                callback_url: endpoint.callback_url.clone(),
                alert_on_failure: endpoint.alert_on_failure,
                muted: false,
                interval_minutes: None,
                // Executions are created here directly; the scheduler has
                // nothing left to materialize for these tasks.
                next_run_at: None,
                source_endpoint_id: Some(endpoint.id),
            };

            let task = db.insert_task(&new_task, now_ms).await?;
            db.create_pending_execution(
                task.id,
                endpoint.tenant_id,
                now_ms + FAN_OUT_DELAY_MS,
                1,
                None,
                now_ms,
            )
            .await?;
            task_ids.push(task.id);
        }

        if endpoint.forward_urls.len() > max_urls {
            warn!(
                endpoint_id = endpoint.id,
                configured = endpoint.forward_urls.len(),
                "Endpoint has more forward URLs than the fan-out limit; extra ones ignored"
            );
        }

        db.set_event_task_ids(event_id, &task_ids).await?;
        drop(db);

        self.worker_notify.notify_waiters();
        info!(
            endpoint_id = endpoint.id,
            event_id,
            tasks = task_ids.len(),
            "Inbound event fanned out"
        );

        Ok(ReceivedEvent {
            event_id,
            task_count: task_ids.len(),
        })
    }

    /// Re-create executions for every task recorded on an event, skipping
    /// tasks deleted since. All-deleted is an error so the caller can tell
    /// "replayed nothing" from "replayed".
    pub async fn replay_event(
        &self,
        tenant_id: i64,
        endpoint_id: i64,
        event_id: i64,
        now_ms: i64,
    ) -> Result<ReplayResult> {
        let mut db = self.database.lock().await;

        let endpoint: Endpoint = db
            .get_endpoint(tenant_id, endpoint_id)
            .await?
            .ok_or(DispatchError::NotFound("Endpoint"))?;

        let event = db
            .get_inbound_event(endpoint.id, event_id)
            .await?
            .ok_or(DispatchError::NotFound("Event"))?;

        let mut created = 0usize;
        let mut skipped = 0usize;

        for task_id in &event.task_ids {
            let task = db.get_task_any(*task_id).await?;
            match task {
                Some(task) if task.deleted_at.is_none() => {
                    db.create_pending_execution(
                        task.id,
                        task.tenant_id,
                        now_ms + FAN_OUT_DELAY_MS,
                        1,
                        None,
                        now_ms,
                    )
                    .await?;
                    created += 1;
                }
                _ => {
                    debug!(task_id, event_id, "Replay skipping deleted task");
                    skipped += 1;
                }
            }
        }
        drop(db);

        if created == 0 {
            return Err(DispatchError::TaskDeleted.into());
        }

        self.worker_notify.notify_waiters();
        info!(event_id, created, skipped, "Replayed inbound event");

        Ok(ReplayResult { created, skipped })
    }
}

/// Constant-time signature check for endpoints with a shared secret.
fn verify_signature(secret: &str, body: &[u8], provided: Option<&str>) -> Result<()> {
    let Some(provided) = provided else {
        return Err(DispatchError::validation("signature", "Missing X-Signature header").into());
    };

    let expected = sign_payload(secret, body);
    let matches = expected.as_bytes().ct_eq(provided.as_bytes()).unwrap_u8() == 1;
    if !matches {
        warn!("Inbound signature mismatch");
        return Err(DispatchError::validation("signature", "Invalid signature").into());
    }
    Ok(())
}

/// Apply the forwarded-header rules: drop hop-by-hop and local headers,
/// stamp the original source address.
fn forwarded_headers(
    headers: &BTreeMap<String, String>,
    source_ip: Option<&str>,
) -> BTreeMap<String, String> {
    let mut forwarded: BTreeMap<String, String> = headers
        .iter()
        .filter(|(name, _)| {
            let lowered = name.to_ascii_lowercase();
            !DROPPED_HEADERS.contains(&lowered.as_str())
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();

    if let Some(ip) = source_ip {
        forwarded.insert("X-Forwarded-For".to_string(), ip.to_string());
    }

    forwarded
}
