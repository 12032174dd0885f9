//! Email notification log
//!
//! Alert emails are enqueued here as rows; rendering and SMTP delivery are
//! owned by an external collaborator that drains this table. The table
//! doubles as the persistence behind the per-tenant failure-email throttle.

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use tracing::debug;

/// Kinds of notification emails the dispatcher enqueues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmailKind {
    TaskFailure,
    TaskRecovery,
    MonitorDown,
    MonitorRecovery,
}

impl EmailKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmailKind::TaskFailure => "task_failure",
            EmailKind::TaskRecovery => "task_recovery",
            EmailKind::MonitorDown => "monitor_down",
            EmailKind::MonitorRecovery => "monitor_recovery",
        }
    }
}

/// Create the email_log table
pub fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS email_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id INTEGER NOT NULL,
            kind TEXT NOT NULL,
            subject TEXT NOT NULL,
            body TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
        [],
    )
    .context("Failed to create email_log table")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_email_log_tenant
         ON email_log(tenant_id, kind, created_at)",
        [],
    )?;

    Ok(())
}

/// Enqueue a notification email.
pub fn enqueue_email(
    conn: &Connection,
    tenant_id: i64,
    kind: EmailKind,
    subject: &str,
    body: Option<&str>,
    now_ms: i64,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO email_log (tenant_id, kind, subject, body, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![tenant_id, kind.as_str(), subject, body, now_ms],
    )?;
    debug!(
        "Enqueued {} email for tenant {}: {}",
        kind.as_str(),
        tenant_id,
        subject
    );
    Ok(conn.last_insert_rowid())
}

/// Number of emails of one kind enqueued for a tenant since `since_ms`.
/// Backs the failure-email throttle.
pub fn count_recent(
    conn: &Connection,
    tenant_id: i64,
    kind: EmailKind,
    since_ms: i64,
) -> Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM email_log
         WHERE tenant_id = ?1 AND kind = ?2 AND created_at >= ?3",
        params![tenant_id, kind.as_str(), since_ms],
        |row| row.get(0),
    )
    .context("Failed to count recent emails")
}

/// Delete email log rows older than the cutoff.
pub fn purge_email_log(conn: &Connection, cutoff_ms: i64) -> Result<usize> {
    let purged = conn.execute(
        "DELETE FROM email_log WHERE created_at < ?1",
        params![cutoff_ms],
    )?;
    if purged > 0 {
        debug!("Purged {} email log rows", purged);
    }
    Ok(purged)
}
