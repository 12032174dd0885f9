//! Inbound endpoint and event storage
//!
//! Endpoints are the receivers behind `/in/{slug}`. Each received request is
//! persisted as an inbound event together with the task ids the fan-out
//! generated, which is what makes replay possible. Slugs are globally unique
//! because the inbound path carries no tenant.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use shared::model::{Endpoint, InboundEvent};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Insert payload for a new endpoint.
#[derive(Debug, Clone)]
pub struct NewEndpoint {
    pub tenant_id: i64,
    pub name: String,
    pub slug: String,
    pub forward_urls: Vec<String>,
    pub use_queue: bool,
    pub retry_attempts: i64,
    pub alert_on_failure: bool,
    pub callback_url: Option<String>,
    pub on_failure_url: Option<String>,
    pub on_recovery_url: Option<String>,
    pub secret: Option<String>,
    pub enabled: bool,
}

/// Create the endpoints and inbound_events tables
pub fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS endpoints (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            slug TEXT NOT NULL UNIQUE,
            forward_urls TEXT NOT NULL DEFAULT '[]',
            use_queue INTEGER NOT NULL DEFAULT 0,
            retry_attempts INTEGER NOT NULL DEFAULT 0,
            alert_on_failure INTEGER NOT NULL DEFAULT 1,
            callback_url TEXT,
            on_failure_url TEXT,
            on_recovery_url TEXT,
            secret TEXT,
            enabled INTEGER NOT NULL DEFAULT 1,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
        [],
    )
    .context("Failed to create endpoints table")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_endpoints_tenant ON endpoints(tenant_id)",
        [],
    )?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS inbound_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            endpoint_id INTEGER NOT NULL,
            tenant_id INTEGER NOT NULL,
            method TEXT NOT NULL,
            headers TEXT NOT NULL DEFAULT '{}',
            body TEXT NOT NULL DEFAULT '',
            body_base64 INTEGER NOT NULL DEFAULT 0,
            source_ip TEXT,
            received_at INTEGER NOT NULL,
            task_ids TEXT NOT NULL DEFAULT '[]'
        )
        "#,
        [],
    )
    .context("Failed to create inbound_events table")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_endpoint
         ON inbound_events(endpoint_id, received_at)",
        [],
    )?;

    Ok(())
}

const ENDPOINT_COLUMNS: &str = r#"
    id, tenant_id, name, slug, forward_urls, use_queue, retry_attempts,
    alert_on_failure, callback_url, on_failure_url, on_recovery_url, secret,
    enabled, created_at, updated_at
"#;

/// Insert an endpoint and return the stored row.
pub fn insert_endpoint(conn: &Connection, new: &NewEndpoint, now_ms: i64) -> Result<Endpoint> {
    let urls_json = serde_json::to_string(&new.forward_urls)?;
    conn.execute(
        r#"
        INSERT INTO endpoints (
            tenant_id, name, slug, forward_urls, use_queue, retry_attempts,
            alert_on_failure, callback_url, on_failure_url, on_recovery_url,
            secret, enabled, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)
        "#,
        params![
            new.tenant_id,
            new.name,
            new.slug,
            urls_json,
            new.use_queue as i64,
            new.retry_attempts,
            new.alert_on_failure as i64,
            new.callback_url,
            new.on_failure_url,
            new.on_recovery_url,
            new.secret,
            new.enabled as i64,
            now_ms,
        ],
    )?;

    let id = conn.last_insert_rowid();
    info!("Created endpoint '{}' (id={}, slug={})", new.name, id, new.slug);

    get_endpoint_any(conn, id)?
        .ok_or_else(|| anyhow::anyhow!("Endpoint {} vanished after insert", id))
}

/// Fetch an endpoint scoped to a tenant.
pub fn get_endpoint(conn: &Connection, tenant_id: i64, id: i64) -> Result<Option<Endpoint>> {
    let sql = format!(
        "SELECT {} FROM endpoints WHERE id = ?1 AND tenant_id = ?2",
        ENDPOINT_COLUMNS
    );
    conn.query_row(&sql, params![id, tenant_id], row_to_endpoint)
        .optional()
        .context("Failed to fetch endpoint")
}

fn get_endpoint_any(conn: &Connection, id: i64) -> Result<Option<Endpoint>> {
    let sql = format!("SELECT {} FROM endpoints WHERE id = ?1", ENDPOINT_COLUMNS);
    conn.query_row(&sql, params![id], row_to_endpoint)
        .optional()
        .context("Failed to fetch endpoint")
}

/// Resolve an inbound slug.
pub fn get_by_slug(conn: &Connection, slug: &str) -> Result<Option<Endpoint>> {
    let sql = format!("SELECT {} FROM endpoints WHERE slug = ?1", ENDPOINT_COLUMNS);
    conn.query_row(&sql, params![slug], row_to_endpoint)
        .optional()
        .context("Failed to resolve endpoint slug")
}

/// List a tenant's endpoints.
pub fn list_endpoints(conn: &Connection, tenant_id: i64) -> Result<Vec<Endpoint>> {
    let sql = format!(
        "SELECT {} FROM endpoints WHERE tenant_id = ?1 ORDER BY id",
        ENDPOINT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![tenant_id], row_to_endpoint)?;
    rows.collect::<std::result::Result<Vec<_>, _>>()
        .context("Failed to list endpoints")
}

/// Find an endpoint by display name within a tenant (used by Sync).
pub fn find_endpoint_by_name(
    conn: &Connection,
    tenant_id: i64,
    name: &str,
) -> Result<Option<Endpoint>> {
    let sql = format!(
        "SELECT {} FROM endpoints WHERE tenant_id = ?1 AND name = ?2 LIMIT 1",
        ENDPOINT_COLUMNS
    );
    conn.query_row(&sql, params![tenant_id, name], row_to_endpoint)
        .optional()
        .context("Failed to find endpoint by name")
}

/// Rewrite the mutable columns of an endpoint.
pub fn update_endpoint(conn: &Connection, endpoint: &Endpoint, now_ms: i64) -> Result<()> {
    let urls_json = serde_json::to_string(&endpoint.forward_urls)?;
    conn.execute(
        r#"
        UPDATE endpoints SET
            name = ?1, slug = ?2, forward_urls = ?3, use_queue = ?4,
            retry_attempts = ?5, alert_on_failure = ?6, callback_url = ?7,
            on_failure_url = ?8, on_recovery_url = ?9, secret = ?10,
            enabled = ?11, updated_at = ?12
        WHERE id = ?13
        "#,
        params![
            endpoint.name,
            endpoint.slug,
            urls_json,
            endpoint.use_queue as i64,
            endpoint.retry_attempts,
            endpoint.alert_on_failure as i64,
            endpoint.callback_url,
            endpoint.on_failure_url,
            endpoint.on_recovery_url,
            endpoint.secret,
            endpoint.enabled as i64,
            now_ms,
            endpoint.id,
        ],
    )?;
    Ok(())
}

/// Delete an endpoint. Its recorded events stay until the retention purge.
pub fn delete_endpoint(conn: &Connection, tenant_id: i64, id: i64) -> Result<bool> {
    let deleted = conn.execute(
        "DELETE FROM endpoints WHERE id = ?1 AND tenant_id = ?2",
        params![id, tenant_id],
    )?;
    Ok(deleted == 1)
}

/// Persist an inbound event, before fan-out. Task ids are attached once the
/// fan-out has created them.
#[allow(clippy::too_many_arguments)]
pub fn insert_event(
    conn: &Connection,
    endpoint_id: i64,
    tenant_id: i64,
    method: &str,
    headers: &BTreeMap<String, String>,
    body: &str,
    body_base64: bool,
    source_ip: Option<&str>,
    now_ms: i64,
) -> Result<i64> {
    let headers_json = serde_json::to_string(headers)?;
    conn.execute(
        r#"
        INSERT INTO inbound_events (
            endpoint_id, tenant_id, method, headers, body, body_base64,
            source_ip, received_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
        params![
            endpoint_id,
            tenant_id,
            method,
            headers_json,
            body,
            body_base64 as i64,
            source_ip,
            now_ms
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Record the task ids an event's fan-out generated, for replay.
pub fn set_event_task_ids(conn: &Connection, event_id: i64, task_ids: &[i64]) -> Result<()> {
    let ids_json = serde_json::to_string(task_ids)?;
    conn.execute(
        "UPDATE inbound_events SET task_ids = ?1 WHERE id = ?2",
        params![ids_json, event_id],
    )?;
    Ok(())
}

/// Fetch one event belonging to an endpoint.
pub fn get_event(conn: &Connection, endpoint_id: i64, event_id: i64) -> Result<Option<InboundEvent>> {
    conn.query_row(
        r#"
        SELECT id, endpoint_id, tenant_id, method, headers, body, body_base64,
               source_ip, received_at, task_ids
        FROM inbound_events
        WHERE id = ?1 AND endpoint_id = ?2
        "#,
        params![event_id, endpoint_id],
        row_to_event,
    )
    .optional()
    .context("Failed to fetch inbound event")
}

/// Delete events older than the cutoff.
pub fn purge_events(conn: &Connection, cutoff_ms: i64) -> Result<usize> {
    let purged = conn.execute(
        "DELETE FROM inbound_events WHERE received_at < ?1",
        params![cutoff_ms],
    )?;
    if purged > 0 {
        debug!("Purged {} inbound events", purged);
    }
    Ok(purged)
}

fn row_to_endpoint(row: &rusqlite::Row<'_>) -> rusqlite::Result<Endpoint> {
    let urls_json: String = row.get(4)?;
    Ok(Endpoint {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        name: row.get(2)?,
        slug: row.get(3)?,
        forward_urls: serde_json::from_str(&urls_json).unwrap_or_default(),
        use_queue: row.get::<_, i64>(5)? != 0,
        retry_attempts: row.get(6)?,
        alert_on_failure: row.get::<_, i64>(7)? != 0,
        callback_url: row.get(8)?,
        on_failure_url: row.get(9)?,
        on_recovery_url: row.get(10)?,
        secret: row.get(11)?,
        enabled: row.get::<_, i64>(12)? != 0,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<InboundEvent> {
    let headers_json: String = row.get(4)?;
    let ids_json: String = row.get(9)?;
    Ok(InboundEvent {
        id: row.get(0)?,
        endpoint_id: row.get(1)?,
        tenant_id: row.get(2)?,
        method: row.get(3)?,
        headers: serde_json::from_str(&headers_json).unwrap_or_default(),
        body: row.get(5)?,
        body_base64: row.get::<_, i64>(6)? != 0,
        source_ip: row.get(7)?,
        received_at: row.get(8)?,
        task_ids: serde_json::from_str(&ids_json).unwrap_or_default(),
    })
}
