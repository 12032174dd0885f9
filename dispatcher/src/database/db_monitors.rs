//! Heartbeat monitor storage
//!
//! Monitors are passive: external systems ping them by token, and the
//! checker flips overdue ones to `down`. The token is globally unique since
//! pings arrive on an unauthenticated path with nothing but the token.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use shared::model::{Monitor, MonitorScheduleType, MonitorStatus};
use tracing::{debug, info};

/// Insert payload for a new monitor.
#[derive(Debug, Clone)]
pub struct NewMonitor {
    pub tenant_id: i64,
    pub name: String,
    pub ping_token: String,
    pub schedule_type: MonitorScheduleType,
    pub interval_seconds: Option<i64>,
    pub cron_expression: Option<String>,
    pub grace_period_seconds: i64,
    pub enabled: bool,
    pub muted: bool,
}

/// Create the monitors table
pub fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS monitors (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            ping_token TEXT NOT NULL UNIQUE,
            schedule_type TEXT NOT NULL,
            interval_seconds INTEGER,
            cron_expression TEXT,
            grace_period_seconds INTEGER NOT NULL DEFAULT 60,
            status TEXT NOT NULL DEFAULT 'new',
            last_ping_at INTEGER,
            next_expected_at INTEGER,
            enabled INTEGER NOT NULL DEFAULT 1,
            muted INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
        [],
    )
    .context("Failed to create monitors table")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_monitors_tenant ON monitors(tenant_id)",
        [],
    )?;

    // Overdue scan: enabled monitors with a known expectation.
    conn.execute(
        r#"
        CREATE INDEX IF NOT EXISTS idx_monitors_overdue
        ON monitors(next_expected_at)
        WHERE enabled = 1 AND next_expected_at IS NOT NULL
        "#,
        [],
    )?;

    Ok(())
}

const MONITOR_COLUMNS: &str = r#"
    id, tenant_id, name, ping_token, schedule_type, interval_seconds,
    cron_expression, grace_period_seconds, status, last_ping_at,
    next_expected_at, enabled, muted, created_at, updated_at
"#;

/// Insert a monitor and return the stored row.
pub fn insert_monitor(conn: &Connection, new: &NewMonitor, now_ms: i64) -> Result<Monitor> {
    conn.execute(
        r#"
        INSERT INTO monitors (
            tenant_id, name, ping_token, schedule_type, interval_seconds,
            cron_expression, grace_period_seconds, status, enabled, muted,
            created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'new', ?8, ?9, ?10, ?10)
        "#,
        params![
            new.tenant_id,
            new.name,
            new.ping_token,
            new.schedule_type.as_str(),
            new.interval_seconds,
            new.cron_expression,
            new.grace_period_seconds,
            new.enabled as i64,
            new.muted as i64,
            now_ms,
        ],
    )?;

    let id = conn.last_insert_rowid();
    info!("Created monitor '{}' (id={})", new.name, id);

    get_monitor_any(conn, id)?
        .ok_or_else(|| anyhow::anyhow!("Monitor {} vanished after insert", id))
}

/// Fetch a monitor scoped to a tenant.
pub fn get_monitor(conn: &Connection, tenant_id: i64, id: i64) -> Result<Option<Monitor>> {
    let sql = format!(
        "SELECT {} FROM monitors WHERE id = ?1 AND tenant_id = ?2",
        MONITOR_COLUMNS
    );
    conn.query_row(&sql, params![id, tenant_id], row_to_monitor)
        .optional()
        .context("Failed to fetch monitor")
}

fn get_monitor_any(conn: &Connection, id: i64) -> Result<Option<Monitor>> {
    let sql = format!("SELECT {} FROM monitors WHERE id = ?1", MONITOR_COLUMNS);
    conn.query_row(&sql, params![id], row_to_monitor)
        .optional()
        .context("Failed to fetch monitor")
}

/// Resolve a ping token.
pub fn get_by_token(conn: &Connection, token: &str) -> Result<Option<Monitor>> {
    let sql = format!(
        "SELECT {} FROM monitors WHERE ping_token = ?1",
        MONITOR_COLUMNS
    );
    conn.query_row(&sql, params![token], row_to_monitor)
        .optional()
        .context("Failed to resolve ping token")
}

/// List a tenant's monitors.
pub fn list_monitors(conn: &Connection, tenant_id: i64) -> Result<Vec<Monitor>> {
    let sql = format!(
        "SELECT {} FROM monitors WHERE tenant_id = ?1 ORDER BY id",
        MONITOR_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![tenant_id], row_to_monitor)?;
    rows.collect::<std::result::Result<Vec<_>, _>>()
        .context("Failed to list monitors")
}

/// Find a monitor by display name within a tenant (used by Sync).
pub fn find_monitor_by_name(
    conn: &Connection,
    tenant_id: i64,
    name: &str,
) -> Result<Option<Monitor>> {
    let sql = format!(
        "SELECT {} FROM monitors WHERE tenant_id = ?1 AND name = ?2 LIMIT 1",
        MONITOR_COLUMNS
    );
    conn.query_row(&sql, params![tenant_id, name], row_to_monitor)
        .optional()
        .context("Failed to find monitor by name")
}

/// Rewrite the mutable columns of a monitor.
pub fn update_monitor(conn: &Connection, monitor: &Monitor, now_ms: i64) -> Result<()> {
    conn.execute(
        r#"
        UPDATE monitors SET
            name = ?1, schedule_type = ?2, interval_seconds = ?3,
            cron_expression = ?4, grace_period_seconds = ?5, status = ?6,
            last_ping_at = ?7, next_expected_at = ?8, enabled = ?9,
            muted = ?10, updated_at = ?11
        WHERE id = ?12
        "#,
        params![
            monitor.name,
            monitor.schedule_type.as_str(),
            monitor.interval_seconds,
            monitor.cron_expression,
            monitor.grace_period_seconds,
            monitor.status.as_str(),
            monitor.last_ping_at,
            monitor.next_expected_at,
            monitor.enabled as i64,
            monitor.muted as i64,
            now_ms,
            monitor.id,
        ],
    )?;
    Ok(())
}

/// Delete a monitor. Returns false when it does not exist for this tenant.
pub fn delete_monitor(conn: &Connection, tenant_id: i64, id: i64) -> Result<bool> {
    let deleted = conn.execute(
        "DELETE FROM monitors WHERE id = ?1 AND tenant_id = ?2",
        params![id, tenant_id],
    )?;
    Ok(deleted == 1)
}

/// Monitors whose expected ping has passed the grace window: enabled, in a
/// state that can degrade, and `next_expected_at + grace < now`.
pub fn overdue_monitors(conn: &Connection, now_ms: i64) -> Result<Vec<Monitor>> {
    let sql = format!(
        r#"
        SELECT {} FROM monitors
        WHERE enabled = 1
          AND status IN ('up', 'new')
          AND next_expected_at IS NOT NULL
          AND next_expected_at + grace_period_seconds * 1000 < ?1
        "#,
        MONITOR_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![now_ms], row_to_monitor)?;
    rows.collect::<std::result::Result<Vec<_>, _>>()
        .context("Failed to scan overdue monitors")
}

/// Record a ping: stamp `last_ping_at`, advance `next_expected_at`, and
/// transition to `up`.
pub fn record_ping(
    conn: &Connection,
    monitor_id: i64,
    next_expected_at: Option<i64>,
    now_ms: i64,
) -> Result<()> {
    conn.execute(
        r#"
        UPDATE monitors
        SET last_ping_at = ?1, next_expected_at = ?2, status = 'up', updated_at = ?1
        WHERE id = ?3
        "#,
        params![now_ms, next_expected_at, monitor_id],
    )?;
    debug!("Recorded ping for monitor {}", monitor_id);
    Ok(())
}

/// Set a monitor's status.
pub fn set_status(
    conn: &Connection,
    monitor_id: i64,
    status: MonitorStatus,
    now_ms: i64,
) -> Result<()> {
    conn.execute(
        "UPDATE monitors SET status = ?1, updated_at = ?2 WHERE id = ?3",
        params![status.as_str(), now_ms, monitor_id],
    )?;
    Ok(())
}

fn row_to_monitor(row: &rusqlite::Row<'_>) -> rusqlite::Result<Monitor> {
    let schedule_str: String = row.get(4)?;
    let status_str: String = row.get(8)?;
    Ok(Monitor {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        name: row.get(2)?,
        ping_token: row.get(3)?,
        schedule_type: MonitorScheduleType::from_str(&schedule_str).unwrap_or(MonitorScheduleType::Interval),
        interval_seconds: row.get(5)?,
        cron_expression: row.get(6)?,
        grace_period_seconds: row.get(7)?,
        status: MonitorStatus::from_str(&status_str).unwrap_or(MonitorStatus::New),
        last_ping_at: row.get(9)?,
        next_expected_at: row.get(10)?,
        enabled: row.get::<_, i64>(11)? != 0,
        muted: row.get::<_, i64>(12)? != 0,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}
