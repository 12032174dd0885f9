//! Execution storage and the claim protocol
//!
//! An execution is one attempt (or planned attempt) of a task. Rows move
//! `pending -> running -> {success, failed, timeout}`; `missed` and
//! `cancelled` are terminal states written outside the worker path. Retries
//! are new rows with `attempt + 1`, never in-place resets.
//!
//! `claim_next` is the heart of the dispatcher: it atomically picks the next
//! executable row while enforcing queue pause state and per-queue FIFO, so
//! any number of workers can poll it without ever double-claiming.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use shared::model::{Execution, ExecutionStatus};
use tracing::{debug, warn};

/// Per-status execution counts, used by the status surface.
#[derive(Debug, Default, Clone)]
pub struct ExecutionStats {
    pub pending: i64,
    pub running: i64,
    pub success: i64,
    pub failed: i64,
    pub timeout: i64,
    pub missed: i64,
    pub cancelled: i64,
}

/// Create the executions table and its indexes
pub fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS executions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id INTEGER NOT NULL,
            tenant_id INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            scheduled_for INTEGER NOT NULL,
            started_at INTEGER,
            finished_at INTEGER,
            status_code INTEGER,
            duration_ms INTEGER,
            response_body TEXT,
            error_message TEXT,
            attempt INTEGER NOT NULL DEFAULT 1,
            callback_url TEXT,
            created_at INTEGER NOT NULL,

            -- The scheduler's idempotence key. Attempt is included so retry
            -- rows can never collide with a re-run of the scheduler tick.
            UNIQUE(task_id, scheduled_for, attempt)
        )
        "#,
        [],
    )
    .context("Failed to create executions table")?;

    // Claim scan: pending rows ordered by due time.
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_executions_claim
         ON executions(status, scheduled_for)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_executions_task ON executions(task_id)",
        [],
    )?;

    // FIFO resolution within (tenant, queue).
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_executions_fifo
         ON executions(tenant_id, created_at)",
        [],
    )?;

    Ok(())
}

const EXECUTION_COLUMNS: &str = r#"
    id, task_id, tenant_id, status, scheduled_for, started_at, finished_at,
    status_code, duration_ms, response_body, error_message, attempt,
    callback_url, created_at
"#;

/// Create a pending execution. `INSERT OR IGNORE` on the
/// `(task_id, scheduled_for, attempt)` key makes this idempotent, which is
/// what lets the scheduler crash between creating a row and advancing
/// `next_run_at` without duplicating work.
///
/// Returns the new row id, or `None` when an identical row already existed.
pub fn create_pending(
    conn: &Connection,
    task_id: i64,
    tenant_id: i64,
    scheduled_for: i64,
    attempt: i64,
    callback_url: Option<&str>,
    now_ms: i64,
) -> Result<Option<i64>> {
    let changed = conn.execute(
        r#"
        INSERT OR IGNORE INTO executions (
            task_id, tenant_id, status, scheduled_for, attempt, callback_url, created_at
        ) VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?6)
        "#,
        params![task_id, tenant_id, scheduled_for, attempt, callback_url, now_ms],
    )?;

    if changed == 0 {
        debug!(
            "Pending execution for task {} at {} attempt {} already exists",
            task_id, scheduled_for, attempt
        );
        return Ok(None);
    }
    Ok(Some(conn.last_insert_rowid()))
}

/// Record a run the scheduler arrived too late for. The row is terminal at
/// birth and never dispatched; it exists so the gap is visible to the user.
pub fn create_missed(
    conn: &Connection,
    task_id: i64,
    tenant_id: i64,
    scheduled_for: i64,
    now_ms: i64,
) -> Result<Option<i64>> {
    let changed = conn.execute(
        r#"
        INSERT OR IGNORE INTO executions (
            task_id, tenant_id, status, scheduled_for, finished_at,
            error_message, attempt, created_at
        ) VALUES (?1, ?2, 'missed', ?3, ?4, 'Scheduled instant passed the grace window', 1, ?4)
        "#,
        params![task_id, tenant_id, scheduled_for, now_ms],
    )?;
    if changed == 0 {
        return Ok(None);
    }
    Ok(Some(conn.last_insert_rowid()))
}

/// Atomically claim the next executable execution, transitioning it
/// `pending -> running` and stamping `started_at`.
///
/// A row is executable when all of the following hold:
/// 1. `scheduled_for <= now`,
/// 2. its task is live (not soft-deleted) and enabled,
/// 3. the task's `(tenant, queue)` is not paused,
/// 4. for queued tasks, no sibling execution in the same `(tenant, queue)`
///    is running or is pending with an earlier creation (tiebreak:
///    creation timestamp, then id) — the per-queue FIFO discipline, which
///    serializes across tasks, not only within one.
///
/// The select and the status CAS run inside one IMMEDIATE transaction, so
/// concurrent claimers (including other processes on the same database)
/// never both succeed on one row. `Ok(None)` means "no work", which is a
/// normal outcome, not an error.
pub fn claim_next(conn: &mut Connection, now_ms: i64) -> Result<Option<Execution>> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let candidate: Option<i64> = tx
        .query_row(
            r#"
            SELECT e.id
            FROM executions e
            JOIN tasks t ON t.id = e.task_id
            WHERE e.status = 'pending'
              AND e.scheduled_for <= ?1
              AND t.deleted_at IS NULL
              AND t.enabled = 1
              AND NOT EXISTS (
                  SELECT 1 FROM queue_states qs
                  WHERE qs.tenant_id = t.tenant_id
                    AND qs.name = t.queue
                    AND qs.paused = 1
              )
              AND (t.queue = '' OR NOT EXISTS (
                  SELECT 1 FROM executions e2
                  JOIN tasks t2 ON t2.id = e2.task_id
                  WHERE t2.tenant_id = t.tenant_id
                    AND t2.queue = t.queue
                    AND t2.deleted_at IS NULL
                    AND t2.enabled = 1
                    AND e2.id != e.id
                    AND (e2.status = 'running'
                         OR (e2.status = 'pending'
                             AND (e2.created_at < e.created_at
                                  OR (e2.created_at = e.created_at AND e2.id < e.id))))
              ))
            ORDER BY e.scheduled_for ASC, e.created_at ASC, e.id ASC
            LIMIT 1
            "#,
            params![now_ms],
            |row| row.get(0),
        )
        .optional()?;

    let Some(id) = candidate else {
        return Ok(None);
    };

    // CAS on status. Inside the immediate transaction this cannot lose a
    // race, but the guard keeps the transition single-winner even if the
    // selection logic above ever drifts.
    let changed = tx.execute(
        "UPDATE executions SET status = 'running', started_at = ?1
         WHERE id = ?2 AND status = 'pending'",
        params![now_ms, id],
    )?;
    if changed == 0 {
        warn!("Claim CAS lost execution {} to a concurrent writer", id);
        return Ok(None);
    }

    let sql = format!("SELECT {} FROM executions WHERE id = ?1", EXECUTION_COLUMNS);
    let execution = tx.query_row(&sql, params![id], row_to_execution)?;
    tx.commit()?;

    debug!(
        "Claimed execution {} (task {}, attempt {})",
        execution.id, execution.task_id, execution.attempt
    );
    Ok(Some(execution))
}

/// Write a terminal state for a running execution. `duration_ms` is derived
/// from the stored `started_at`.
///
/// Returns false when the row is gone or no longer running ("poison
/// execution"): the caller swallows that and moves on to the next claim.
pub fn finish(
    conn: &Connection,
    execution_id: i64,
    status: ExecutionStatus,
    status_code: Option<i64>,
    response_body: Option<&str>,
    error_message: Option<&str>,
    now_ms: i64,
) -> Result<bool> {
    debug_assert!(status.is_terminal());
    let changed = conn.execute(
        r#"
        UPDATE executions
        SET status = ?1, finished_at = ?2,
            duration_ms = CASE WHEN started_at IS NOT NULL THEN ?2 - started_at END,
            status_code = ?3, response_body = ?4, error_message = ?5
        WHERE id = ?6 AND status = 'running'
        "#,
        params![
            status.as_str(),
            now_ms,
            status_code,
            response_body,
            error_message,
            execution_id
        ],
    )?;
    Ok(changed == 1)
}

/// Push a claimed execution back to pending at a later instant, clearing
/// `started_at`. Used when the destination host is blocked.
pub fn reschedule(conn: &Connection, execution_id: i64, scheduled_for: i64) -> Result<bool> {
    let changed = conn.execute(
        r#"
        UPDATE executions
        SET status = 'pending', started_at = NULL, scheduled_for = ?1
        WHERE id = ?2 AND status = 'running'
        "#,
        params![scheduled_for, execution_id],
    )?;
    Ok(changed == 1)
}

/// Promote executions whose worker died to `timeout`. A row qualifies when
/// it has been running longer than its task's timeout plus slack.
pub fn sweep_orphans(conn: &Connection, slack_ms: i64, now_ms: i64) -> Result<usize> {
    let swept = conn.execute(
        r#"
        UPDATE executions
        SET status = 'timeout', finished_at = ?1,
            duration_ms = CASE WHEN started_at IS NOT NULL THEN ?1 - started_at END,
            error_message = 'Worker lost; execution timed out'
        WHERE id IN (
            SELECT e.id FROM executions e
            JOIN tasks t ON t.id = e.task_id
            WHERE e.status = 'running'
              AND e.started_at IS NOT NULL
              AND e.started_at + t.timeout_ms + ?2 <= ?1
        )
        "#,
        params![now_ms, slack_ms],
    )?;
    if swept > 0 {
        warn!("Orphan sweep promoted {} executions to timeout", swept);
    }
    Ok(swept)
}

/// Number of pending executions that are already due, which is what the
/// pool controller sizes the worker set against.
pub fn pending_depth(conn: &Connection, now_ms: i64) -> Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM executions WHERE status = 'pending' AND scheduled_for <= ?1",
        params![now_ms],
        |row| row.get(0),
    )
    .context("Failed to count pending executions")
}

/// Fetch one execution by id.
pub fn get_execution(conn: &Connection, id: i64) -> Result<Option<Execution>> {
    let sql = format!("SELECT {} FROM executions WHERE id = ?1", EXECUTION_COLUMNS);
    conn.query_row(&sql, params![id], row_to_execution)
        .optional()
        .context("Failed to fetch execution")
}

/// List executions for one task, newest first, tenant-scoped.
pub fn list_for_task(
    conn: &Connection,
    tenant_id: i64,
    task_id: i64,
    limit: usize,
) -> Result<Vec<Execution>> {
    let sql = format!(
        r#"
        SELECT {} FROM executions
        WHERE tenant_id = ?1 AND task_id = ?2
        ORDER BY created_at DESC, id DESC
        LIMIT ?3
        "#,
        EXECUTION_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![tenant_id, task_id, limit as i64], row_to_execution)?;
    rows.collect::<std::result::Result<Vec<_>, _>>()
        .context("Failed to list executions")
}

/// List a tenant's executions across tasks, newest first.
pub fn list_for_tenant(conn: &Connection, tenant_id: i64, limit: usize) -> Result<Vec<Execution>> {
    let sql = format!(
        r#"
        SELECT {} FROM executions
        WHERE tenant_id = ?1
        ORDER BY created_at DESC, id DESC
        LIMIT ?2
        "#,
        EXECUTION_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![tenant_id, limit as i64], row_to_execution)?;
    rows.collect::<std::result::Result<Vec<_>, _>>()
        .context("Failed to list executions")
}

/// Status of the task's most recent dispatched terminal execution other
/// than `exclude_id`. Drives failure->recovery detection; `missed` and
/// `cancelled` rows are not dispatch outcomes and don't participate.
pub fn previous_terminal_status(
    conn: &Connection,
    task_id: i64,
    exclude_id: i64,
) -> Result<Option<ExecutionStatus>> {
    let status: Option<String> = conn
        .query_row(
            r#"
            SELECT status FROM executions
            WHERE task_id = ?1 AND id != ?2
              AND status IN ('success', 'failed', 'timeout')
              AND finished_at IS NOT NULL
            ORDER BY finished_at DESC, id DESC
            LIMIT 1
            "#,
            params![task_id, exclude_id],
            |row| row.get(0),
        )
        .optional()?;

    Ok(status.and_then(|s| ExecutionStatus::from_str(&s).ok()))
}

/// Delete terminal executions for a tenant past its retention cutoff.
pub fn purge_terminal(conn: &Connection, tenant_id: i64, cutoff_ms: i64) -> Result<usize> {
    let purged = conn.execute(
        r#"
        DELETE FROM executions
        WHERE tenant_id = ?1
          AND status NOT IN ('pending', 'running')
          AND COALESCE(finished_at, created_at) < ?2
        "#,
        params![tenant_id, cutoff_ms],
    )?;
    if purged > 0 {
        debug!("Purged {} executions for tenant {}", purged, tenant_id);
    }
    Ok(purged)
}

/// Per-status counts for the status surface.
pub fn get_stats(conn: &Connection) -> Result<ExecutionStats> {
    let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM executions GROUP BY status")?;
    let mut stats = ExecutionStats::default();

    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;

    for row in rows {
        let (status, count) = row?;
        match status.as_str() {
            "pending" => stats.pending = count,
            "running" => stats.running = count,
            "success" => stats.success = count,
            "failed" => stats.failed = count,
            "timeout" => stats.timeout = count,
            "missed" => stats.missed = count,
            "cancelled" => stats.cancelled = count,
            _ => {}
        }
    }

    Ok(stats)
}

fn row_to_execution(row: &rusqlite::Row<'_>) -> rusqlite::Result<Execution> {
    let status_str: String = row.get(3)?;
    Ok(Execution {
        id: row.get(0)?,
        task_id: row.get(1)?,
        tenant_id: row.get(2)?,
        status: ExecutionStatus::from_str(&status_str).unwrap_or(ExecutionStatus::Pending),
        scheduled_for: row.get(4)?,
        started_at: row.get(5)?,
        finished_at: row.get(6)?,
        status_code: row.get(7)?,
        duration_ms: row.get(8)?,
        response_body: row.get(9)?,
        error_message: row.get(10)?,
        attempt: row.get(11)?,
        callback_url: row.get(12)?,
        created_at: row.get(13)?,
    })
}
