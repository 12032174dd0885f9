//! Task storage
//!
//! Tasks are soft-deleted: `deleted_at` is stamped, `enabled` is cleared and
//! `next_run_at` is nilled so the task disappears from every listing and
//! scheduling query, while its execution history stays queryable until the
//! retention purge.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use shared::model::{ScheduleType, Task};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Insert payload for a new task. Built by the command surface after
/// validation; the store trusts it.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub tenant_id: i64,
    pub name: String,
    pub url: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    pub schedule_type: ScheduleType,
    pub cron_expression: Option<String>,
    pub scheduled_at: Option<i64>,
    pub enabled: bool,
    pub queue: String,
    pub timeout_ms: i64,
    pub retry_attempts: i64,
    pub expected_status_codes: Option<String>,
    pub expected_body_pattern: Option<String>,
    pub callback_url: Option<String>,
    pub alert_on_failure: bool,
    pub muted: bool,
    pub interval_minutes: Option<i64>,
    pub next_run_at: Option<i64>,
    pub source_endpoint_id: Option<i64>,
}

/// Create the tasks table and its indexes
pub fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            url TEXT NOT NULL,
            method TEXT NOT NULL DEFAULT 'POST',
            headers TEXT NOT NULL DEFAULT '{}',
            body TEXT,
            schedule_type TEXT NOT NULL,
            cron_expression TEXT,
            scheduled_at INTEGER,
            enabled INTEGER NOT NULL DEFAULT 1,
            queue TEXT NOT NULL DEFAULT '',
            timeout_ms INTEGER NOT NULL DEFAULT 30000,
            retry_attempts INTEGER NOT NULL DEFAULT 0,
            expected_status_codes TEXT,
            expected_body_pattern TEXT,
            callback_url TEXT,
            alert_on_failure INTEGER NOT NULL DEFAULT 1,
            muted INTEGER NOT NULL DEFAULT 0,
            interval_minutes INTEGER,
            next_run_at INTEGER,
            inserted_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            deleted_at INTEGER,
            source_endpoint_id INTEGER
        )
        "#,
        [],
    )
    .context("Failed to create tasks table")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_tasks_tenant ON tasks(tenant_id)",
        [],
    )?;

    // Partial index backing the scheduler's due scan.
    conn.execute(
        r#"
        CREATE INDEX IF NOT EXISTS idx_tasks_due
        ON tasks(next_run_at)
        WHERE enabled = 1 AND deleted_at IS NULL AND next_run_at IS NOT NULL
        "#,
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_tasks_queue ON tasks(tenant_id, queue)",
        [],
    )?;

    Ok(())
}

const TASK_COLUMNS: &str = r#"
    id, tenant_id, name, url, method, headers, body, schedule_type,
    cron_expression, scheduled_at, enabled, queue, timeout_ms, retry_attempts,
    expected_status_codes, expected_body_pattern, callback_url,
    alert_on_failure, muted, interval_minutes, next_run_at, inserted_at,
    updated_at, deleted_at, source_endpoint_id
"#;

/// Insert a new task and return the stored row.
pub fn insert_task(conn: &Connection, new: &NewTask, now_ms: i64) -> Result<Task> {
    let headers_json = serde_json::to_string(&new.headers)?;
    conn.execute(
        r#"
        INSERT INTO tasks (
            tenant_id, name, url, method, headers, body, schedule_type,
            cron_expression, scheduled_at, enabled, queue, timeout_ms,
            retry_attempts, expected_status_codes, expected_body_pattern,
            callback_url, alert_on_failure, muted, interval_minutes,
            next_run_at, inserted_at, updated_at, source_endpoint_id
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                  ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?21, ?22)
        "#,
        params![
            new.tenant_id,
            new.name,
            new.url,
            new.method,
            headers_json,
            new.body,
            new.schedule_type.as_str(),
            new.cron_expression,
            new.scheduled_at,
            new.enabled as i64,
            new.queue,
            new.timeout_ms,
            new.retry_attempts,
            new.expected_status_codes,
            new.expected_body_pattern,
            new.callback_url,
            new.alert_on_failure as i64,
            new.muted as i64,
            new.interval_minutes,
            new.next_run_at,
            now_ms,
            new.source_endpoint_id,
        ],
    )?;

    let id = conn.last_insert_rowid();
    debug!("Inserted task '{}' (id={})", new.name, id);

    get_task_any(conn, id)?.ok_or_else(|| anyhow::anyhow!("Task {} vanished after insert", id))
}

/// Fetch a task scoped to a tenant, excluding soft-deleted rows.
pub fn get_task(conn: &Connection, tenant_id: i64, id: i64) -> Result<Option<Task>> {
    let sql = format!(
        "SELECT {} FROM tasks WHERE id = ?1 AND tenant_id = ?2 AND deleted_at IS NULL",
        TASK_COLUMNS
    );
    conn.query_row(&sql, params![id, tenant_id], row_to_task)
        .optional()
        .context("Failed to fetch task")
}

/// Fetch a task by id regardless of tenant or deletion, for the worker and
/// callback paths that hold an already-authorized execution.
pub fn get_task_any(conn: &Connection, id: i64) -> Result<Option<Task>> {
    let sql = format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS);
    conn.query_row(&sql, params![id], row_to_task)
        .optional()
        .context("Failed to fetch task")
}

/// List a tenant's live tasks, newest first.
pub fn list_tasks(conn: &Connection, tenant_id: i64) -> Result<Vec<Task>> {
    let sql = format!(
        "SELECT {} FROM tasks WHERE tenant_id = ?1 AND deleted_at IS NULL ORDER BY id DESC",
        TASK_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![tenant_id], row_to_task)?;
    rows.collect::<std::result::Result<Vec<_>, _>>()
        .context("Failed to list tasks")
}

/// Find a live task by display name within a tenant (used by Sync).
pub fn find_task_by_name(conn: &Connection, tenant_id: i64, name: &str) -> Result<Option<Task>> {
    let sql = format!(
        "SELECT {} FROM tasks WHERE tenant_id = ?1 AND name = ?2 AND deleted_at IS NULL LIMIT 1",
        TASK_COLUMNS
    );
    conn.query_row(&sql, params![tenant_id, name], row_to_task)
        .optional()
        .context("Failed to find task by name")
}

/// Enabled, live tasks whose `next_run_at` falls inside the scheduler's
/// look-ahead horizon.
pub fn due_tasks(conn: &Connection, horizon_ms: i64, limit: usize) -> Result<Vec<Task>> {
    let sql = format!(
        r#"
        SELECT {} FROM tasks
        WHERE enabled = 1 AND deleted_at IS NULL
          AND next_run_at IS NOT NULL AND next_run_at <= ?1
        ORDER BY next_run_at ASC
        LIMIT ?2
        "#,
        TASK_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![horizon_ms, limit as i64], row_to_task)?;
    rows.collect::<std::result::Result<Vec<_>, _>>()
        .context("Failed to scan due tasks")
}

/// Rewrite the mutable columns of a task. The caller owns recomputing
/// `interval_minutes` and `next_run_at` when the schedule changed.
pub fn update_task(conn: &Connection, task: &Task, now_ms: i64) -> Result<()> {
    let headers_json = serde_json::to_string(&task.headers)?;
    conn.execute(
        r#"
        UPDATE tasks SET
            name = ?1, url = ?2, method = ?3, headers = ?4, body = ?5,
            schedule_type = ?6, cron_expression = ?7, scheduled_at = ?8,
            enabled = ?9, queue = ?10, timeout_ms = ?11, retry_attempts = ?12,
            expected_status_codes = ?13, expected_body_pattern = ?14,
            callback_url = ?15, alert_on_failure = ?16, muted = ?17,
            interval_minutes = ?18, next_run_at = ?19, updated_at = ?20
        WHERE id = ?21
        "#,
        params![
            task.name,
            task.url,
            task.method,
            headers_json,
            task.body,
            task.schedule_type.as_str(),
            task.cron_expression,
            task.scheduled_at,
            task.enabled as i64,
            task.queue,
            task.timeout_ms,
            task.retry_attempts,
            task.expected_status_codes,
            task.expected_body_pattern,
            task.callback_url,
            task.alert_on_failure as i64,
            task.muted as i64,
            task.interval_minutes,
            task.next_run_at,
            now_ms,
            task.id,
        ],
    )?;
    Ok(())
}

/// Advance (or clear) a task's next materialization instant.
pub fn set_next_run_at(conn: &Connection, task_id: i64, next_run_at: Option<i64>) -> Result<()> {
    conn.execute(
        "UPDATE tasks SET next_run_at = ?1 WHERE id = ?2",
        params![next_run_at, task_id],
    )?;
    Ok(())
}

/// Flip the enabled flag, setting the recomputed `next_run_at` alongside it.
pub fn set_enabled(
    conn: &Connection,
    task_id: i64,
    enabled: bool,
    next_run_at: Option<i64>,
    now_ms: i64,
) -> Result<()> {
    conn.execute(
        "UPDATE tasks SET enabled = ?1, next_run_at = ?2, updated_at = ?3 WHERE id = ?4",
        params![enabled as i64, next_run_at, now_ms, task_id],
    )?;
    Ok(())
}

/// Soft-delete a task and cancel its pending executions, in one transaction.
/// Returns false when the task does not exist for this tenant.
pub fn soft_delete_task(
    conn: &mut Connection,
    tenant_id: i64,
    task_id: i64,
    now_ms: i64,
) -> Result<bool> {
    let tx = conn.transaction()?;

    let updated = tx.execute(
        r#"
        UPDATE tasks SET enabled = 0, next_run_at = NULL, deleted_at = ?1, updated_at = ?1
        WHERE id = ?2 AND tenant_id = ?3 AND deleted_at IS NULL
        "#,
        params![now_ms, task_id, tenant_id],
    )?;

    if updated == 0 {
        return Ok(false);
    }

    tx.execute(
        r#"
        UPDATE executions SET status = 'cancelled', finished_at = ?1
        WHERE task_id = ?2 AND status = 'pending'
        "#,
        params![now_ms, task_id],
    )?;

    tx.commit()?;
    info!("Soft-deleted task {} for tenant {}", task_id, tenant_id);
    Ok(true)
}

/// Cancel a whole queue: soft-delete its tasks and cancel their pending
/// executions. Returns the number of executions cancelled.
pub fn cancel_queue(
    conn: &mut Connection,
    tenant_id: i64,
    queue: &str,
    now_ms: i64,
) -> Result<usize> {
    let tx = conn.transaction()?;

    let cancelled = tx.execute(
        r#"
        UPDATE executions SET status = 'cancelled', finished_at = ?1
        WHERE status = 'pending' AND task_id IN (
            SELECT id FROM tasks
            WHERE tenant_id = ?2 AND queue = ?3 AND deleted_at IS NULL
        )
        "#,
        params![now_ms, tenant_id, queue],
    )?;

    tx.execute(
        r#"
        UPDATE tasks SET enabled = 0, next_run_at = NULL, deleted_at = ?1, updated_at = ?1
        WHERE tenant_id = ?2 AND queue = ?3 AND deleted_at IS NULL
        "#,
        params![now_ms, tenant_id, queue],
    )?;

    tx.commit()?;
    info!(
        "Cancelled queue '{}' for tenant {}: {} executions",
        queue, tenant_id, cancelled
    );
    Ok(cancelled)
}

/// Purge soft-deleted tasks past their retention. Execution rows referencing
/// them go with them.
pub fn purge_soft_deleted(conn: &mut Connection, cutoff_ms: i64) -> Result<usize> {
    let tx = conn.transaction()?;

    tx.execute(
        r#"
        DELETE FROM executions WHERE task_id IN (
            SELECT id FROM tasks WHERE deleted_at IS NOT NULL AND deleted_at < ?1
        )
        "#,
        params![cutoff_ms],
    )?;

    let purged = tx.execute(
        "DELETE FROM tasks WHERE deleted_at IS NOT NULL AND deleted_at < ?1",
        params![cutoff_ms],
    )?;

    tx.commit()?;
    if purged > 0 {
        debug!("Purged {} soft-deleted tasks", purged);
    }
    Ok(purged)
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let headers_json: String = row.get(5)?;
    let schedule_str: String = row.get(7)?;
    Ok(Task {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        name: row.get(2)?,
        url: row.get(3)?,
        method: row.get(4)?,
        headers: serde_json::from_str(&headers_json).unwrap_or_default(),
        body: row.get(6)?,
        schedule_type: ScheduleType::from_str(&schedule_str).unwrap_or(ScheduleType::Once),
        cron_expression: row.get(8)?,
        scheduled_at: row.get(9)?,
        enabled: row.get::<_, i64>(10)? != 0,
        queue: row.get(11)?,
        timeout_ms: row.get(12)?,
        retry_attempts: row.get(13)?,
        expected_status_codes: row.get(14)?,
        expected_body_pattern: row.get(15)?,
        callback_url: row.get(16)?,
        alert_on_failure: row.get::<_, i64>(17)? != 0,
        muted: row.get::<_, i64>(18)? != 0,
        interval_minutes: row.get(19)?,
        next_run_at: row.get(20)?,
        inserted_at: row.get(21)?,
        updated_at: row.get(22)?,
        deleted_at: row.get(23)?,
        source_endpoint_id: row.get(24)?,
    })
}
