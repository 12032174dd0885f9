//! Periodic retention cleanup
//!
//! Executions live as long as the owning tenant's tier allows (7 days free,
//! 30 days pro), soft-deleted tasks and their history a bit longer, email
//! log and inbound events on their own clocks. After a purge the database
//! is vacuumed and the WAL checkpointed so disk usage actually shrinks.

use crate::database::DispatcherDatabase;
use anyhow::Result;
use shared::config::ServiceConfig;
use shared::model::PlanTier;
use shared::utils::current_timestamp_millis;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{error, info};

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// Runs the retention purges on a long interval.
pub struct Cleaner {
    database: Arc<Mutex<DispatcherDatabase>>,
    config: Arc<ServiceConfig>,
}

impl Cleaner {
    pub fn new(database: Arc<Mutex<DispatcherDatabase>>, config: Arc<ServiceConfig>) -> Self {
        Self { database, config }
    }

    /// Main loop: an initial delay, then a purge every
    /// `cleanup_interval_hours`.
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            interval_hours = self.config.cleanup_interval_hours,
            "Cleanup task started"
        );

        // Stagger the first run so startup isn't dominated by a purge.
        let initial_delay =
            std::time::Duration::from_secs(self.config.initial_cleanup_delay_seconds);
        tokio::select! {
            _ = tokio::time::sleep(initial_delay) => {}
            _ = shutdown_rx.recv() => return,
        }

        let mut interval = tokio::time::interval(std::time::Duration::from_secs(
            (self.config.cleanup_interval_hours as u64) * 3600,
        ));

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now_ms = current_timestamp_millis();
                    if let Err(e) = self.run_once(now_ms).await {
                        error!("Cleanup failed: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Cleanup task received shutdown signal");
                    break;
                }
            }
        }
    }

    /// One full purge pass at an explicit instant. Returns the total number
    /// of rows removed.
    pub async fn run_once(&self, now_ms: i64) -> Result<usize> {
        let mut total = 0usize;
        let mut db = self.database.lock().await;

        // Executions age out per tenant tier.
        let tiers = db.list_tenant_tiers().await?;
        for (tenant_id, plan) in tiers {
            let retention_days = match plan {
                PlanTier::Free => self.config.retention_days_free,
                PlanTier::Pro => self.config.retention_days_pro,
            };
            let cutoff = now_ms - (retention_days as i64) * DAY_MS;
            total += db.purge_executions(tenant_id, cutoff).await?;
        }

        let deleted_cutoff = now_ms - (self.config.deleted_task_retention_days as i64) * DAY_MS;
        total += db.purge_soft_deleted_tasks(deleted_cutoff).await?;

        let email_cutoff = now_ms - (self.config.email_log_retention_days as i64) * DAY_MS;
        total += db.purge_email_log(email_cutoff).await?;

        let event_cutoff = now_ms - (self.config.inbound_event_retention_days as i64) * DAY_MS;
        total += db.purge_inbound_events(event_cutoff).await?;

        if total > 0 {
            db.vacuum().await?;
            db.checkpoint_wal().await?;
        }

        info!("Cleanup complete: {} rows removed", total);
        Ok(total)
    }
}
