//! Tenant storage and the monthly usage counter
//!
//! Tenants own every other entity. The monthly execution counter lives here
//! as a single additive column so the in-process counter shards can fold
//! their deltas in with one UPDATE per tenant.

use anyhow::{Context, Result};
use chrono::{Datelike, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use shared::model::{PlanTier, Tenant};
use shared::utils::generate_token;
use tracing::{debug, info};

/// Create the tenants table
pub fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS tenants (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            plan TEXT NOT NULL DEFAULT 'free',
            webhook_secret TEXT NOT NULL,
            monthly_execution_count INTEGER NOT NULL DEFAULT 0,
            monthly_execution_reset_at INTEGER NOT NULL,
            notify_on_failure INTEGER NOT NULL DEFAULT 1,
            notify_on_recovery INTEGER NOT NULL DEFAULT 1,
            email TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
        [],
    )
    .context("Failed to create tenants table")?;

    Ok(())
}

/// Create a tenant with a fresh webhook secret.
pub fn create_tenant(
    conn: &Connection,
    name: &str,
    plan: PlanTier,
    email: Option<&str>,
    now_ms: i64,
) -> Result<Tenant> {
    let secret = generate_token(40);
    conn.execute(
        r#"
        INSERT INTO tenants (
            name, plan, webhook_secret, monthly_execution_count,
            monthly_execution_reset_at, notify_on_failure, notify_on_recovery,
            email, created_at
        ) VALUES (?1, ?2, ?3, 0, ?4, 1, 1, ?5, ?4)
        "#,
        params![name, plan.as_str(), secret, now_ms, email],
    )?;

    let id = conn.last_insert_rowid();
    info!("Created tenant '{}' (id={}, plan={})", name, id, plan.as_str());

    get_tenant(conn, id)?.ok_or_else(|| anyhow::anyhow!("Tenant {} vanished after insert", id))
}

/// Fetch a tenant by id.
pub fn get_tenant(conn: &Connection, id: i64) -> Result<Option<Tenant>> {
    conn.query_row(
        r#"
        SELECT id, name, plan, webhook_secret, monthly_execution_count,
               monthly_execution_reset_at, notify_on_failure, notify_on_recovery,
               email, created_at
        FROM tenants WHERE id = ?1
        "#,
        params![id],
        row_to_tenant,
    )
    .optional()
    .context("Failed to fetch tenant")
}

/// Fold an in-process counter delta into the persisted monthly count.
pub fn add_execution_count(conn: &Connection, tenant_id: i64, delta: i64) -> Result<()> {
    conn.execute(
        "UPDATE tenants SET monthly_execution_count = monthly_execution_count + ?1 WHERE id = ?2",
        params![delta, tenant_id],
    )?;
    debug!("Folded counter delta {} into tenant {}", delta, tenant_id);
    Ok(())
}

/// Zero the monthly counter for every tenant whose last reset predates the
/// current calendar month. Returns the number of tenants reset.
pub fn reset_stale_monthly_counters(conn: &Connection, now_ms: i64) -> Result<usize> {
    let month_start = current_month_start_ms(now_ms);
    let count = conn.execute(
        r#"
        UPDATE tenants
        SET monthly_execution_count = 0, monthly_execution_reset_at = ?1
        WHERE monthly_execution_reset_at < ?2
        "#,
        params![now_ms, month_start],
    )?;
    if count > 0 {
        info!("Reset monthly execution counters for {} tenants", count);
    }
    Ok(count)
}

/// Unix ms of the first instant of the month containing `now_ms`.
fn current_month_start_ms(now_ms: i64) -> i64 {
    let now = Utc
        .timestamp_millis_opt(now_ms)
        .single()
        .unwrap_or_else(Utc::now);
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .map(|dt| dt.timestamp_millis())
        .unwrap_or(now_ms)
}

fn row_to_tenant(row: &rusqlite::Row<'_>) -> rusqlite::Result<Tenant> {
    let plan_str: String = row.get(2)?;
    Ok(Tenant {
        id: row.get(0)?,
        name: row.get(1)?,
        plan: PlanTier::from_str(&plan_str).unwrap_or(PlanTier::Free),
        webhook_secret: row.get(3)?,
        monthly_execution_count: row.get(4)?,
        monthly_execution_reset_at: row.get(5)?,
        notify_on_failure: row.get::<_, i64>(6)? != 0,
        notify_on_recovery: row.get::<_, i64>(7)? != 0,
        email: row.get(8)?,
        created_at: row.get(9)?,
    })
}
