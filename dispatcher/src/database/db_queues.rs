//! Queue pause state
//!
//! A queue is just a name; the only state it carries is the paused flag.
//! Rows exist lazily: a queue that has never been paused has no row, and
//! the claim query treats "no row" as "not paused".

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use shared::model::QueueState;
use tracing::info;

/// Create the queue_states table
pub fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS queue_states (
            tenant_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            paused INTEGER NOT NULL DEFAULT 0,

            UNIQUE(tenant_id, name)
        )
        "#,
        [],
    )
    .context("Failed to create queue_states table")?;

    Ok(())
}

/// Pause or resume a queue. Upserts the row.
pub fn set_paused(conn: &Connection, tenant_id: i64, name: &str, paused: bool) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO queue_states (tenant_id, name, paused) VALUES (?1, ?2, ?3)
        ON CONFLICT(tenant_id, name) DO UPDATE SET paused = ?3
        "#,
        params![tenant_id, name, paused as i64],
    )?;
    info!(
        "Queue '{}' for tenant {} {}",
        name,
        tenant_id,
        if paused { "paused" } else { "resumed" }
    );
    Ok(())
}

/// Whether a queue is currently paused.
pub fn is_paused(conn: &Connection, tenant_id: i64, name: &str) -> Result<bool> {
    let paused: Option<i64> = conn
        .query_row(
            "SELECT paused FROM queue_states WHERE tenant_id = ?1 AND name = ?2",
            params![tenant_id, name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(paused.unwrap_or(0) != 0)
}

/// List a tenant's queue states (only queues that were ever paused have
/// rows).
pub fn list_states(conn: &Connection, tenant_id: i64) -> Result<Vec<QueueState>> {
    let mut stmt = conn
        .prepare("SELECT tenant_id, name, paused FROM queue_states WHERE tenant_id = ?1 ORDER BY name")?;
    let rows = stmt.query_map(params![tenant_id], |row| {
        Ok(QueueState {
            tenant_id: row.get(0)?,
            name: row.get(1)?,
            paused: row.get::<_, i64>(2)? != 0,
        })
    })?;
    rows.collect::<std::result::Result<Vec<_>, _>>()
        .context("Failed to list queue states")
}
