//! Scheduler: turns due `next_run_at` instants into pending executions
//!
//! A single scheduler instance ticks about once a second. Each tick scans
//! tasks whose `next_run_at` falls inside a short look-ahead window,
//! materializes executions for the matching instants, and advances
//! `next_run_at`. Instants that slipped past the grace window become
//! terminal `missed` rows instead of being dispatched late.
//!
//! The tick is idempotent under crash: execution creation is keyed by
//! `(task_id, scheduled_for, attempt)`, so a tick that dies between
//! creating a row and advancing `next_run_at` simply re-observes the same
//! `next_run_at` and the insert is ignored the second time.

use crate::counter::ExecutionCounter;
use crate::database::DispatcherDatabase;
use anyhow::Result;
use shared::config::ServiceConfig;
use shared::model::{PlanTier, ScheduleType, Task, Tenant};
use shared::utils::current_timestamp_millis;
use shared::{cron, DispatchError};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, Notify};
use tracing::{debug, error, info, warn};

/// Upper bound on due tasks examined per tick.
const DUE_SCAN_LIMIT: usize = 500;

/// Upper bound on cron matches materialized per task per tick. A task that
/// has been offline for months gets its backlog drained across ticks
/// instead of stalling one tick indefinitely.
const MAX_MATCHES_PER_TICK: usize = 1000;

/// Converts due tasks into executions and advances their schedules.
pub struct Scheduler {
    database: Arc<Mutex<DispatcherDatabase>>,
    counter: ExecutionCounter,
    config: Arc<ServiceConfig>,
    /// Woken after any materialization so the pool controller reacts before
    /// its next timed tick.
    worker_notify: Arc<Notify>,
}

impl Scheduler {
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

    /// Main loop: tick until shutdown. Tick errors are logged and the loop
    /// continues; the scheduler never propagates failures upward.
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            tick_ms = self.config.scheduler_tick_ms,
            lookahead_ms = self.config.scheduler_lookahead_ms,
            "Scheduler started"
        );
        let mut interval = tokio::time::interval(std::time::Duration::from_millis(
            self.config.scheduler_tick_ms,
        ));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now_ms = current_timestamp_millis();
                    if let Err(e) = self.run_tick(now_ms).await {
                        error!("Scheduler tick failed: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Scheduler received shutdown signal");
                    break;
                }
            }
        }
    }

    /// One scheduler tick at an explicit instant. Returns the number of
    /// pending executions materialized.
    pub async fn run_tick(&self, now_ms: i64) -> Result<usize> {
        let horizon_ms = now_ms + self.config.scheduler_lookahead_ms as i64;

        let due = {
            let mut db = self.database.lock().await;
            db.due_tasks(horizon_ms, DUE_SCAN_LIMIT).await?
        };

        if due.is_empty() {
            return Ok(0);
        }
        debug!("Scheduler tick: {} due tasks", due.len());

        let mut tenants: HashMap<i64, Option<Tenant>> = HashMap::new();
        let mut created_pending = 0usize;

        for task in due {
            match self.schedule_task(&task, now_ms, horizon_ms, &mut tenants).await {
                Ok(created) => created_pending += created,
                Err(e) => {
                    // One broken task must not starve the rest of the tick.
                    error!(task_id = task.id, "Failed to schedule task: {}", e);
                }
            }
        }

        if created_pending > 0 {
            debug!("Materialized {} pending executions", created_pending);
            self.worker_notify.notify_waiters();
        }

        Ok(created_pending)
    }

    /// Materialize the due instants of one task and advance `next_run_at`.
    async fn schedule_task(
        &self,
        task: &Task,
        now_ms: i64,
        horizon_ms: i64,
        tenants: &mut HashMap<i64, Option<Tenant>>,
    ) -> Result<usize> {
        match task.schedule_type {
            ScheduleType::Once => self.schedule_once(task, now_ms, tenants).await,
            ScheduleType::Cron => self.schedule_cron(task, now_ms, horizon_ms, tenants).await,
        }
    }

    /// A once-task materializes exactly one execution at `scheduled_at`,
    /// then will not run again.
    async fn schedule_once(
        &self,
        task: &Task,
        now_ms: i64,
        tenants: &mut HashMap<i64, Option<Tenant>>,
    ) -> Result<usize> {
        let scheduled_for = task
            .scheduled_at
            .or(task.next_run_at)
            .ok_or_else(|| DispatchError::validation("scheduled_at", "once task without instant"))?;

        let mut created = 0;
        if self.under_cap(task.tenant_id, tenants).await? {
            let mut db = self.database.lock().await;
            if db
                .create_pending_execution(task.id, task.tenant_id, scheduled_for, 1, None, now_ms)
                .await?
                .is_some()
            {
                created = 1;
            }
        } else {
            warn!(
                task_id = task.id,
                tenant_id = task.tenant_id,
                "Monthly cap reached, skipping once task"
            );
        }

        let mut db = self.database.lock().await;
        db.set_next_run_at(task.id, None).await?;
        Ok(created)
    }

    /// A cron task materializes every match in `[next_run_at, horizon]`:
    /// matches within the grace window become pending executions, older
    /// ones become terminal `missed` rows, and matches that predate the
    /// task itself are skipped so newly created tasks don't get synthetic
    /// history.
    async fn schedule_cron(
        &self,
        task: &Task,
        now_ms: i64,
        horizon_ms: i64,
        tenants: &mut HashMap<i64, Option<Tenant>>,
    ) -> Result<usize> {
        let Some(expr) = task.cron_expression.as_deref() else {
            warn!(task_id = task.id, "Cron task without expression, disabling");
            let mut db = self.database.lock().await;
            db.set_next_run_at(task.id, None).await?;
            return Ok(0);
        };

        let grace_ms = self.grace_window_ms(task);
        let mut cursor = match task.next_run_at {
            Some(at) => at,
            None => return Ok(0),
        };

        let mut created = 0usize;
        let mut matches = 0usize;

        while cursor <= horizon_ms && matches < MAX_MATCHES_PER_TICK {
            matches += 1;

            if cursor >= task.inserted_at {
                if cursor < now_ms - grace_ms {
                    let mut db = self.database.lock().await;
                    db.create_missed_execution(task.id, task.tenant_id, cursor, now_ms)
                        .await?;
                } else if self.under_cap(task.tenant_id, tenants).await? {
                    let mut db = self.database.lock().await;
                    if db
                        .create_pending_execution(task.id, task.tenant_id, cursor, 1, None, now_ms)
                        .await?
                        .is_some()
                    {
                        created += 1;
                    }
                }
                // Cap reached: the instant is skipped but the schedule still
                // advances, per the tier contract.
            }

            match cron::next_after(expr, cursor)? {
                Some(next) => cursor = next,
                None => {
                    // Expression has no future matches; park the task.
                    let mut db = self.database.lock().await;
                    db.set_next_run_at(task.id, None).await?;
                    return Ok(created);
                }
            }
        }

        let mut db = self.database.lock().await;
        db.set_next_run_at(task.id, Some(cursor)).await?;
        Ok(created)
    }

    /// Grace window: at least the configured default, and half the task's
    /// interval for infrequent tasks.
    fn grace_window_ms(&self, task: &Task) -> i64 {
        let default_ms = (self.config.scheduler_grace_default_s as i64) * 1000;
        let half_interval_ms = task.interval_minutes.unwrap_or(0) * 60_000 / 2;
        default_ms.max(half_interval_ms)
    }

    /// Whether a tenant's tier cap still has room, counting both the
    /// persisted monthly count and the not-yet-flushed in-process delta.
    async fn under_cap(
        &self,
        tenant_id: i64,
        tenants: &mut HashMap<i64, Option<Tenant>>,
    ) -> Result<bool> {
        if !tenants.contains_key(&tenant_id) {
            let mut db = self.database.lock().await;
            let tenant = db.get_tenant(tenant_id).await?;
            tenants.insert(tenant_id, tenant);
        }

        let Some(tenant) = tenants.get(&tenant_id).and_then(|t| t.as_ref()) else {
            // Orphaned task; do not materialize for a missing tenant.
            return Ok(false);
        };

        match tenant.plan {
            PlanTier::Pro => Ok(true),
            PlanTier::Free => {
                let current =
                    tenant.monthly_execution_count + self.counter.pending_delta(tenant.id);
                Ok(current < self.config.monthly_cap_free)
            }
        }
    }
}
