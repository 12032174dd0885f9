//! Database management for the webhook dispatch service
//!
//! All durable state lives in one SQLite database: tenants, tasks,
//! executions, monitors, endpoints, inbound events, queue state and the
//! email log. Every invariant the dispatcher relies on (claim exclusivity,
//! queue FIFO, scheduler idempotence) is enforced here, so the components
//! above can stay simple loops.
//
// WAL mode keeps readers unblocked while the single writer works, and the
// busy timeout absorbs the short lock contention that remains. Multi-row
// invariants (claim, soft-delete, fan-out) run in explicit transactions.

// Table-specific database modules
mod db_endpoints;
mod db_executions;
mod db_monitors;
mod db_notifications;
mod db_queues;
mod db_tasks;
mod db_tenants;

use anyhow::{Context, Result};
use rusqlite::Connection;
use shared::model::{
    Endpoint, Execution, ExecutionStatus, InboundEvent, Monitor, MonitorStatus, PlanTier,
    QueueState, Task, Tenant,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Default database file name. Using a constant avoids magic strings.
const DATABASE_FILE: &str = "dispatcher.db";

// Re-export the payload types commands and components build
pub use db_endpoints::NewEndpoint;
pub use db_executions::ExecutionStats;
pub use db_monitors::NewMonitor;
pub use db_notifications::EmailKind;
pub use db_tasks::NewTask;

/// SQLite database manager for the dispatcher.
/// Encapsulates the connection and every storage operation; the connection
/// is opened lazily so constructing the manager never touches disk.
pub struct DispatcherDatabase {
    /// Path to the database file.
    db_path: PathBuf,
    /// The active SQLite connection, opened on first use.
    connection: Option<Connection>,
    /// Database busy timeout in seconds
    busy_timeout_seconds: u64,
}

impl DispatcherDatabase {
    /// Create a new database manager for a given data directory.
    /// Ensures the directory exists, creating it if necessary.
    pub fn new<P: AsRef<Path>>(data_dir: P, busy_timeout_seconds: u64) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        if !data_dir.exists() {
            std::fs::create_dir_all(data_dir).with_context(|| {
                format!("Failed to create data directory: {}", data_dir.display())
            })?;
        }

        let db_path = data_dir.join(DATABASE_FILE);

        Ok(Self {
            db_path,
            connection: None,
            busy_timeout_seconds,
        })
    }

    /// Initialize the database by creating the necessary tables and indexes.
    /// Idempotent; safe to call on every startup.
    pub async fn initialize(&mut self) -> Result<()> {
        info!("Initializing dispatcher database at {}", self.db_path.display());

        let conn = self.get_connection()?;

        db_tenants::create_tables(conn)?;
        db_tasks::create_tables(conn)?;
        db_executions::create_tables(conn)?;
        db_queues::create_tables(conn)?;
        db_monitors::create_tables(conn)?;
        db_endpoints::create_tables(conn)?;
        db_notifications::create_tables(conn)?;

        info!("Database initialization complete");
        Ok(())
    }

    /// Lazily gets a mutable reference to the database connection,
    /// opening and configuring it on first use.
    pub fn get_connection(&mut self) -> Result<&mut Connection> {
        if self.connection.is_none() {
            let conn = Connection::open(&self.db_path)
                .with_context(|| format!("Failed to open database: {}", self.db_path.display()))?;

            // WAL lets workers read while the scheduler writes.
            conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))
                .context("Failed to enable WAL mode")?;

            // Auto-checkpoint keeps the WAL file from growing unbounded.
            conn.query_row("PRAGMA wal_autocheckpoint=1000", [], |_| Ok(()))
                .context("Failed to set WAL auto-checkpoint")?;

            conn.busy_timeout(std::time::Duration::from_secs(self.busy_timeout_seconds))
                .context("Failed to set busy timeout")?;

            self.connection = Some(conn);
        }

        // `unwrap` is safe here because we've just ensured `self.connection` is `Some`.
        Ok(self.connection.as_mut().unwrap())
    }

    /// Close the database connection gracefully.
    pub async fn close(&mut self) {
        if let Some(conn) = self.connection.take() {
            if let Err(e) = conn.close() {
                warn!("Error closing database connection: {:?}", e);
            } else {
                debug!("Database connection closed");
            }
        }
    }

    /// Checkpoint WAL to prevent unbounded growth.
    ///
    /// # Returns
    /// Number of WAL frames that were checkpointed
    pub async fn checkpoint_wal(&mut self) -> Result<i64> {
        let conn = self.get_connection()?;

        let (busy, log_frames, checkpointed): (i64, i64, i64) =
            conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;

        if busy > 0 {
            debug!(
                "WAL checkpoint: {} frames checkpointed, {} busy, {} total in log",
                checkpointed, busy, log_frames
            );
        } else {
            debug!(
                "WAL checkpoint complete: {} frames checkpointed, WAL truncated",
                checkpointed
            );
        }

        Ok(checkpointed)
    }

    // ========== Tenants ==========

    pub async fn create_tenant(
        &mut self,
        name: &str,
        plan: PlanTier,
        email: Option<&str>,
        now_ms: i64,
    ) -> Result<Tenant> {
        let conn = self.get_connection()?;
        db_tenants::create_tenant(conn, name, plan, email, now_ms)
    }

    pub async fn get_tenant(&mut self, id: i64) -> Result<Option<Tenant>> {
        let conn = self.get_connection()?;
        db_tenants::get_tenant(conn, id)
    }

    /// Fold an in-process counter delta into the persisted monthly count.
    pub async fn add_execution_count(&mut self, tenant_id: i64, delta: i64) -> Result<()> {
        let conn = self.get_connection()?;
        db_tenants::add_execution_count(conn, tenant_id, delta)
    }

    /// Zero counters whose last reset predates the current month.
    pub async fn reset_stale_monthly_counters(&mut self, now_ms: i64) -> Result<usize> {
        let conn = self.get_connection()?;
        db_tenants::reset_stale_monthly_counters(conn, now_ms)
    }

    // ========== Tasks ==========

    pub async fn insert_task(&mut self, new: &NewTask, now_ms: i64) -> Result<Task> {
        let conn = self.get_connection()?;
        db_tasks::insert_task(conn, new, now_ms)
    }

    pub async fn get_task(&mut self, tenant_id: i64, id: i64) -> Result<Option<Task>> {
        let conn = self.get_connection()?;
        db_tasks::get_task(conn, tenant_id, id)
    }

    pub async fn get_task_any(&mut self, id: i64) -> Result<Option<Task>> {
        let conn = self.get_connection()?;
        db_tasks::get_task_any(conn, id)
    }

    pub async fn list_tasks(&mut self, tenant_id: i64) -> Result<Vec<Task>> {
        let conn = self.get_connection()?;
        db_tasks::list_tasks(conn, tenant_id)
    }

    pub async fn find_task_by_name(
        &mut self,
        tenant_id: i64,
        name: &str,
    ) -> Result<Option<Task>> {
        let conn = self.get_connection()?;
        db_tasks::find_task_by_name(conn, tenant_id, name)
    }

    /// Enabled, live tasks due within the scheduler's look-ahead horizon.
    pub async fn due_tasks(&mut self, horizon_ms: i64, limit: usize) -> Result<Vec<Task>> {
        let conn = self.get_connection()?;
        db_tasks::due_tasks(conn, horizon_ms, limit)
    }

    pub async fn update_task(&mut self, task: &Task, now_ms: i64) -> Result<()> {
        let conn = self.get_connection()?;
        db_tasks::update_task(conn, task, now_ms)
    }

    pub async fn set_next_run_at(
        &mut self,
        task_id: i64,
        next_run_at: Option<i64>,
    ) -> Result<()> {
        let conn = self.get_connection()?;
        db_tasks::set_next_run_at(conn, task_id, next_run_at)
    }

    pub async fn set_task_enabled(
        &mut self,
        task_id: i64,
        enabled: bool,
        next_run_at: Option<i64>,
        now_ms: i64,
    ) -> Result<()> {
        let conn = self.get_connection()?;
        db_tasks::set_enabled(conn, task_id, enabled, next_run_at, now_ms)
    }

    /// Soft-delete a task and cancel its pending executions.
    pub async fn soft_delete_task(
        &mut self,
        tenant_id: i64,
        task_id: i64,
        now_ms: i64,
    ) -> Result<bool> {
        let conn = self.get_connection()?;
        db_tasks::soft_delete_task(conn, tenant_id, task_id, now_ms)
    }

    /// Cancel a whole queue: soft-delete its tasks, cancel pending work.
    pub async fn cancel_queue(
        &mut self,
        tenant_id: i64,
        queue: &str,
        now_ms: i64,
    ) -> Result<usize> {
        let conn = self.get_connection()?;
        db_tasks::cancel_queue(conn, tenant_id, queue, now_ms)
    }

    // ========== Executions ==========

    /// Create a pending execution, idempotent on
    /// `(task_id, scheduled_for, attempt)`.
    pub async fn create_pending_execution(
        &mut self,
        task_id: i64,
        tenant_id: i64,
        scheduled_for: i64,
        attempt: i64,
        callback_url: Option<&str>,
        now_ms: i64,
    ) -> Result<Option<i64>> {
        let conn = self.get_connection()?;
        db_executions::create_pending(
            conn,
            task_id,
            tenant_id,
            scheduled_for,
            attempt,
            callback_url,
            now_ms,
        )
    }

    /// Record a run that passed the grace window without being dispatched.
    pub async fn create_missed_execution(
        &mut self,
        task_id: i64,
        tenant_id: i64,
        scheduled_for: i64,
        now_ms: i64,
    ) -> Result<Option<i64>> {
        let conn = self.get_connection()?;
        db_executions::create_missed(conn, task_id, tenant_id, scheduled_for, now_ms)
    }

    /// Atomically claim the next executable execution. `Ok(None)` is the
    /// normal "no work" outcome.
    pub async fn claim_next_execution(&mut self, now_ms: i64) -> Result<Option<Execution>> {
        let conn = self.get_connection()?;
        db_executions::claim_next(conn, now_ms)
    }

    /// Write a terminal state. Returns false when the row was gone.
    #[allow(clippy::too_many_arguments)]
    pub async fn finish_execution(
        &mut self,
        execution_id: i64,
        status: ExecutionStatus,
        status_code: Option<i64>,
        response_body: Option<&str>,
        error_message: Option<&str>,
        now_ms: i64,
    ) -> Result<bool> {
        let conn = self.get_connection()?;
        db_executions::finish(
            conn,
            execution_id,
            status,
            status_code,
            response_body,
            error_message,
            now_ms,
        )
    }

    /// Push a claimed execution back to pending at a later instant.
    pub async fn reschedule_execution(
        &mut self,
        execution_id: i64,
        scheduled_for: i64,
    ) -> Result<bool> {
        let conn = self.get_connection()?;
        db_executions::reschedule(conn, execution_id, scheduled_for)
    }

    /// Promote executions whose worker died to `timeout`.
    pub async fn sweep_orphan_executions(&mut self, slack_ms: i64, now_ms: i64) -> Result<usize> {
        let conn = self.get_connection()?;
        db_executions::sweep_orphans(conn, slack_ms, now_ms)
    }

    /// Number of due pending executions, for pool sizing.
    pub async fn pending_depth(&mut self, now_ms: i64) -> Result<i64> {
        let conn = self.get_connection()?;
        db_executions::pending_depth(conn, now_ms)
    }

    pub async fn get_execution(&mut self, id: i64) -> Result<Option<Execution>> {
        let conn = self.get_connection()?;
        db_executions::get_execution(conn, id)
    }

    pub async fn list_executions_for_task(
        &mut self,
        tenant_id: i64,
        task_id: i64,
        limit: usize,
    ) -> Result<Vec<Execution>> {
        let conn = self.get_connection()?;
        db_executions::list_for_task(conn, tenant_id, task_id, limit)
    }

    pub async fn list_executions_for_tenant(
        &mut self,
        tenant_id: i64,
        limit: usize,
    ) -> Result<Vec<Execution>> {
        let conn = self.get_connection()?;
        db_executions::list_for_tenant(conn, tenant_id, limit)
    }

    /// Status of the most recent dispatched terminal execution of a task,
    /// excluding one row. Drives failure->recovery detection.
    pub async fn previous_terminal_status(
        &mut self,
        task_id: i64,
        exclude_id: i64,
    ) -> Result<Option<ExecutionStatus>> {
        let conn = self.get_connection()?;
        db_executions::previous_terminal_status(conn, task_id, exclude_id)
    }

    pub async fn execution_stats(&mut self) -> Result<ExecutionStats> {
        let conn = self.get_connection()?;
        db_executions::get_stats(conn)
    }

    // ========== Queues ==========

    pub async fn set_queue_paused(
        &mut self,
        tenant_id: i64,
        name: &str,
        paused: bool,
    ) -> Result<()> {
        let conn = self.get_connection()?;
        db_queues::set_paused(conn, tenant_id, name, paused)
    }

    pub async fn is_queue_paused(&mut self, tenant_id: i64, name: &str) -> Result<bool> {
        let conn = self.get_connection()?;
        db_queues::is_paused(conn, tenant_id, name)
    }

    pub async fn list_queue_states(&mut self, tenant_id: i64) -> Result<Vec<QueueState>> {
        let conn = self.get_connection()?;
        db_queues::list_states(conn, tenant_id)
    }

    // ========== Monitors ==========

    pub async fn insert_monitor(&mut self, new: &NewMonitor, now_ms: i64) -> Result<Monitor> {
        let conn = self.get_connection()?;
        db_monitors::insert_monitor(conn, new, now_ms)
    }

    pub async fn get_monitor(&mut self, tenant_id: i64, id: i64) -> Result<Option<Monitor>> {
        let conn = self.get_connection()?;
        db_monitors::get_monitor(conn, tenant_id, id)
    }

    pub async fn get_monitor_by_token(&mut self, token: &str) -> Result<Option<Monitor>> {
        let conn = self.get_connection()?;
        db_monitors::get_by_token(conn, token)
    }

    pub async fn list_monitors(&mut self, tenant_id: i64) -> Result<Vec<Monitor>> {
        let conn = self.get_connection()?;
        db_monitors::list_monitors(conn, tenant_id)
    }

    pub async fn find_monitor_by_name(
        &mut self,
        tenant_id: i64,
        name: &str,
    ) -> Result<Option<Monitor>> {
        let conn = self.get_connection()?;
        db_monitors::find_monitor_by_name(conn, tenant_id, name)
    }

    pub async fn update_monitor(&mut self, monitor: &Monitor, now_ms: i64) -> Result<()> {
        let conn = self.get_connection()?;
        db_monitors::update_monitor(conn, monitor, now_ms)
    }

    pub async fn delete_monitor(&mut self, tenant_id: i64, id: i64) -> Result<bool> {
        let conn = self.get_connection()?;
        db_monitors::delete_monitor(conn, tenant_id, id)
    }

    /// Monitors whose expected ping has passed the grace window.
    pub async fn overdue_monitors(&mut self, now_ms: i64) -> Result<Vec<Monitor>> {
        let conn = self.get_connection()?;
        db_monitors::overdue_monitors(conn, now_ms)
    }

    pub async fn record_monitor_ping(
        &mut self,
        monitor_id: i64,
        next_expected_at: Option<i64>,
        now_ms: i64,
    ) -> Result<()> {
        let conn = self.get_connection()?;
        db_monitors::record_ping(conn, monitor_id, next_expected_at, now_ms)
    }

    pub async fn set_monitor_status(
        &mut self,
        monitor_id: i64,
        status: MonitorStatus,
        now_ms: i64,
    ) -> Result<()> {
        let conn = self.get_connection()?;
        db_monitors::set_status(conn, monitor_id, status, now_ms)
    }

    // ========== Endpoints & inbound events ==========

    pub async fn insert_endpoint(&mut self, new: &NewEndpoint, now_ms: i64) -> Result<Endpoint> {
        let conn = self.get_connection()?;
        db_endpoints::insert_endpoint(conn, new, now_ms)
    }

    pub async fn get_endpoint(&mut self, tenant_id: i64, id: i64) -> Result<Option<Endpoint>> {
        let conn = self.get_connection()?;
        db_endpoints::get_endpoint(conn, tenant_id, id)
    }

    pub async fn get_endpoint_by_slug(&mut self, slug: &str) -> Result<Option<Endpoint>> {
        let conn = self.get_connection()?;
        db_endpoints::get_by_slug(conn, slug)
    }

    pub async fn list_endpoints(&mut self, tenant_id: i64) -> Result<Vec<Endpoint>> {
        let conn = self.get_connection()?;
        db_endpoints::list_endpoints(conn, tenant_id)
    }

    pub async fn find_endpoint_by_name(
        &mut self,
        tenant_id: i64,
        name: &str,
    ) -> Result<Option<Endpoint>> {
        let conn = self.get_connection()?;
        db_endpoints::find_endpoint_by_name(conn, tenant_id, name)
    }

    pub async fn update_endpoint(&mut self, endpoint: &Endpoint, now_ms: i64) -> Result<()> {
        let conn = self.get_connection()?;
        db_endpoints::update_endpoint(conn, endpoint, now_ms)
    }

    pub async fn delete_endpoint(&mut self, tenant_id: i64, id: i64) -> Result<bool> {
        let conn = self.get_connection()?;
        db_endpoints::delete_endpoint(conn, tenant_id, id)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_inbound_event(
        &mut self,
        endpoint_id: i64,
        tenant_id: i64,
        method: &str,
        headers: &BTreeMap<String, String>,
        body: &str,
        body_base64: bool,
        source_ip: Option<&str>,
        now_ms: i64,
    ) -> Result<i64> {
        let conn = self.get_connection()?;
        db_endpoints::insert_event(
            conn,
            endpoint_id,
            tenant_id,
            method,
            headers,
            body,
            body_base64,
            source_ip,
            now_ms,
        )
    }

    pub async fn set_event_task_ids(&mut self, event_id: i64, task_ids: &[i64]) -> Result<()> {
        let conn = self.get_connection()?;
        db_endpoints::set_event_task_ids(conn, event_id, task_ids)
    }

    pub async fn get_inbound_event(
        &mut self,
        endpoint_id: i64,
        event_id: i64,
    ) -> Result<Option<InboundEvent>> {
        let conn = self.get_connection()?;
        db_endpoints::get_event(conn, endpoint_id, event_id)
    }

    // ========== Notifications ==========

    pub async fn enqueue_email(
        &mut self,
        tenant_id: i64,
        kind: EmailKind,
        subject: &str,
        body: Option<&str>,
        now_ms: i64,
    ) -> Result<i64> {
        let conn = self.get_connection()?;
        db_notifications::enqueue_email(conn, tenant_id, kind, subject, body, now_ms)
    }

    pub async fn count_recent_emails(
        &mut self,
        tenant_id: i64,
        kind: EmailKind,
        since_ms: i64,
    ) -> Result<i64> {
        let conn = self.get_connection()?;
        db_notifications::count_recent(conn, tenant_id, kind, since_ms)
    }

    // ========== Cleanup ==========

    /// Purge terminal executions for one tenant past its retention cutoff.
    pub async fn purge_executions(&mut self, tenant_id: i64, cutoff_ms: i64) -> Result<usize> {
        let conn = self.get_connection()?;
        db_executions::purge_terminal(conn, tenant_id, cutoff_ms)
    }

    /// Purge soft-deleted tasks past their retention.
    pub async fn purge_soft_deleted_tasks(&mut self, cutoff_ms: i64) -> Result<usize> {
        let conn = self.get_connection()?;
        db_tasks::purge_soft_deleted(conn, cutoff_ms)
    }

    /// Purge old email log rows.
    pub async fn purge_email_log(&mut self, cutoff_ms: i64) -> Result<usize> {
        let conn = self.get_connection()?;
        db_notifications::purge_email_log(conn, cutoff_ms)
    }

    /// Purge old inbound events.
    pub async fn purge_inbound_events(&mut self, cutoff_ms: i64) -> Result<usize> {
        let conn = self.get_connection()?;
        db_endpoints::purge_events(conn, cutoff_ms)
    }

    /// List every tenant id with its plan, for per-tier retention math.
    pub async fn list_tenant_tiers(&mut self) -> Result<Vec<(i64, PlanTier)>> {
        let conn = self.get_connection()?;
        let mut stmt = conn.prepare("SELECT id, plan FROM tenants")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut tiers = Vec::new();
        for row in rows {
            let (id, plan) = row?;
            tiers.push((id, PlanTier::from_str(&plan).unwrap_or(PlanTier::Free)));
        }
        Ok(tiers)
    }

    /// Rebuild the database file after large purges.
    pub async fn vacuum(&mut self) -> Result<()> {
        let conn = self.get_connection()?;
        conn.execute("VACUUM", [])?;
        debug!("Database vacuum complete");
        Ok(())
    }
}
