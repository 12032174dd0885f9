//! Monitor checker: liveness from the absence of pings
//!
//! Monitors are heartbeat listeners. External systems ping them by token;
//! the checker periodically scans for monitors whose expected ping is
//! overdue past the grace period and flips them to `down`, enqueueing a
//! notification. A ping to a down monitor records a recovery.

use crate::callbacks::Notifier;
use crate::database::DispatcherDatabase;
use anyhow::Result;
use shared::config::ServiceConfig;
use shared::cron;
use shared::model::{Monitor, MonitorScheduleType, MonitorStatus};
use shared::utils::current_timestamp_millis;
use shared::DispatchError;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

/// Scans for overdue monitors and records pings.
pub struct MonitorChecker {
    database: Arc<Mutex<DispatcherDatabase>>,
    notifier: Notifier,
    config: Arc<ServiceConfig>,
}

impl MonitorChecker {
    pub fn new(
        database: Arc<Mutex<DispatcherDatabase>>,
        notifier: Notifier,
        config: Arc<ServiceConfig>,
    ) -> Self {
        Self {
            database,
            notifier,
            config,
        }
    }

    /// Main loop: scan every `monitor_check_interval_s` until shutdown.
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            interval_s = self.config.monitor_check_interval_s,
            "Monitor checker started"
        );
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(
            self.config.monitor_check_interval_s,
        ));

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now_ms = current_timestamp_millis();
                    if let Err(e) = self.run_tick(now_ms).await {
                        error!("Monitor check failed: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Monitor checker received shutdown signal");
                    break;
                }
            }
        }
    }

    /// One scan at an explicit instant. Returns how many monitors went
    /// down.
    pub async fn run_tick(&self, now_ms: i64) -> Result<usize> {
        let overdue = {
            let mut db = self.database.lock().await;
            db.overdue_monitors(now_ms).await?
        };

        if overdue.is_empty() {
            return Ok(0);
        }

        let mut transitioned = 0usize;
        for monitor in overdue {
            warn!(
                monitor_id = monitor.id,
                name = %monitor.name,
                "Monitor overdue, transitioning to down"
            );

            let tenant = {
                let mut db = self.database.lock().await;
                db.set_monitor_status(monitor.id, MonitorStatus::Down, now_ms)
                    .await?;
                db.get_tenant(monitor.tenant_id).await?
            };
            transitioned += 1;

            if let Some(tenant) = tenant {
                if let Err(e) = self.notifier.notify_monitor_down(&tenant, &monitor).await {
                    error!(monitor_id = monitor.id, "Monitor-down notification failed: {}", e);
                }
            }
        }

        Ok(transitioned)
    }

    /// Record a ping by token: stamp `last_ping_at`, compute the next
    /// expectation from the monitor's interval or cron expression, and
    /// transition to `up`. A ping to a down monitor records a recovery.
    pub async fn record_ping(&self, token: &str, now_ms: i64) -> Result<Monitor> {
        let monitor = {
            let mut db = self.database.lock().await;
            db.get_monitor_by_token(token).await?
        }
        .ok_or(DispatchError::NotFound("Monitor"))?;

        if !monitor.enabled {
            // Disabled monitors don't accept pings; don't leak that the
            // token exists.
            return Err(DispatchError::NotFound("Monitor").into());
        }

        let next_expected = next_expected_at(&monitor, now_ms)?;
        let was_down = monitor.status == MonitorStatus::Down;

        let (updated, tenant) = {
            let mut db = self.database.lock().await;
            db.record_monitor_ping(monitor.id, next_expected, now_ms)
                .await?;
            let updated = db
                .get_monitor(monitor.tenant_id, monitor.id)
                .await?
                .unwrap_or(monitor.clone());
            let tenant = db.get_tenant(monitor.tenant_id).await?;
            (updated, tenant)
        };

        debug!(
            monitor_id = updated.id,
            next_expected_at = ?next_expected,
            "Recorded ping"
        );

        if was_down {
            info!(monitor_id = updated.id, "Monitor recovered");
            if let Some(tenant) = tenant {
                if let Err(e) = self
                    .notifier
                    .notify_monitor_recovery(&tenant, &updated)
                    .await
                {
                    error!(
                        monitor_id = updated.id,
                        "Monitor-recovery notification failed: {}", e
                    );
                }
            }
        }

        Ok(updated)
    }
}

/// Compute when the next ping is expected after one arriving at `now_ms`.
fn next_expected_at(monitor: &Monitor, now_ms: i64) -> Result<Option<i64>> {
    match monitor.schedule_type {
        MonitorScheduleType::Interval => {
            let interval_s = monitor.interval_seconds.unwrap_or(0);
            if interval_s <= 0 {
                return Ok(None);
            }
            Ok(Some(now_ms + interval_s * 1000))
        }
        MonitorScheduleType::Cron => match monitor.cron_expression.as_deref() {
            Some(expr) => cron::next_after(expr, now_ms),
            None => Ok(None),
        },
    }
}
