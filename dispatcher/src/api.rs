//! HTTP surface for the parts of the core that speak HTTP
//!
//! The full CRUD/JSON API lives in an external collaborator; this router
//! carries only what the engine itself must expose: inbound webhook receipt
//! (`/in/{slug}`), monitor pings (`/ping/{token}`), a health check, and a
//! status endpoint reporting per-component liveness and queue counts.

use crate::database::DispatcherDatabase;
use crate::inbound::InboundDispatcher;
use crate::monitor_checker::MonitorChecker;
use axum::{
    extract::{DefaultBodyLimit, Path, State},
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use shared::config::ServiceConfig;
use shared::utils::{current_timestamp, current_timestamp_millis};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// Service version from Cargo.toml
const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Lifecycle state of the long-running components, reported by `/status`.
/// The runtime marks components as they start and when their loops return.
pub struct Liveness {
    components: Arc<RwLock<HashMap<&'static str, ComponentState>>>,
}

#[derive(Debug, Clone)]
struct ComponentState {
    running: bool,
    since: u64,
}

impl Liveness {
    pub fn new() -> Self {
        Self {
            components: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn mark_running(&self, name: &'static str) {
        let mut components = self.components.write().await;
        components.insert(
            name,
            ComponentState {
                running: true,
                since: current_timestamp(),
            },
        );
    }

    pub async fn mark_stopped(&self, name: &'static str) {
        let mut components = self.components.write().await;
        components.insert(
            name,
            ComponentState {
                running: false,
                since: current_timestamp(),
            },
        );
    }

    async fn snapshot(&self) -> BTreeMap<String, serde_json::Value> {
        let components = self.components.read().await;
        components
            .iter()
            .map(|(name, state)| {
                (
                    name.to_string(),
                    serde_json::json!({
                        "running": state.running,
                        "since": state.since,
                    }),
                )
            })
            .collect()
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Liveness {
    fn clone(&self) -> Self {
        Self {
            components: Arc::clone(&self.components),
        }
    }
}

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub database: Arc<Mutex<DispatcherDatabase>>,
    pub inbound: Arc<InboundDispatcher>,
    pub monitor_checker: Arc<MonitorChecker>,
    pub liveness: Liveness,
    pub config: Arc<ServiceConfig>,
}

/// Creates the router for the engine's HTTP surface.
pub fn create_router(state: AppState) -> Router {
    let body_limit = state.config.inbound_body_limit;

    Router::new()
        // Unauthenticated health check for load balancers and supervisors.
        .route("/health", get(health_check))
        .route("/status", get(handle_status))
        // Inbound webhook receivers; any method, the endpoint records it.
        .route("/in/{slug}", any(handle_inbound))
        // Monitor heartbeats. GET and POST both count as a ping.
        .route("/ping/{token}", get(handle_ping).post(handle_ping))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// Simple health check endpoint.
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": SERVICE_VERSION,
    }))
}

/// Component liveness plus queue counts.
async fn handle_status(State(state): State<AppState>) -> Result<Response, ApiError> {
    let components = state.liveness.snapshot().await;

    let (stats, depth) = {
        let mut db = state.database.lock().await;
        let stats = db.execution_stats().await.map_err(map_error)?;
        let depth = db
            .pending_depth(current_timestamp_millis())
            .await
            .map_err(map_error)?;
        (stats, depth)
    };

    Ok(Json(serde_json::json!({
        "version": SERVICE_VERSION,
        "components": components,
        "executions": {
            "pending": stats.pending,
            "running": stats.running,
            "success": stats.success,
            "failed": stats.failed,
            "timeout": stats.timeout,
            "missed": stats.missed,
            "cancelled": stats.cancelled,
        },
        "due_pending": depth,
    }))
    .into_response())
}

/// Receive an inbound webhook delivery for an endpoint slug.
async fn handle_inbound(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    method: Method,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<Response, ApiError> {
    let header_map = headers_to_map(&headers);
    let source_ip = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').next().unwrap_or(v).trim().to_string());
    let signature = headers.get("x-signature").and_then(|v| v.to_str().ok());

    let received = state
        .inbound
        .receive_event(
            &slug,
            method.as_str(),
            &header_map,
            &body,
            source_ip.as_deref(),
            signature,
            current_timestamp_millis(),
        )
        .await
        .map_err(map_error)?;

    debug!(slug = %slug, event_id = received.event_id, "Inbound event accepted");
    Ok((StatusCode::ACCEPTED, Json(received)).into_response())
}

/// Record a monitor ping by token.
async fn handle_ping(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Response, ApiError> {
    let monitor = state
        .monitor_checker
        .record_ping(&token, current_timestamp_millis())
        .await
        .map_err(map_error)?;

    Ok(Json(serde_json::json!({
        "monitor": monitor.name,
        "status": monitor.status.as_str(),
        "next_expected_at": monitor.next_expected_at,
    }))
    .into_response())
}

fn headers_to_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

/// API error kinds with their HTTP mapping.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("Gone: {0}")]
    Gone(String),
    #[error("Limit exceeded: {0}")]
    LimitExceeded(String),
    #[error("Service temporarily unavailable")]
    Unavailable,
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "Bad Request"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "Not Found"),
            ApiError::Gone(_) => (StatusCode::GONE, "Gone"),
            ApiError::LimitExceeded(_) => (StatusCode::TOO_MANY_REQUESTS, "Limit Exceeded"),
            ApiError::Unavailable => (StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error"),
        };

        let body = Json(serde_json::json!({
            "error": error_message,
            "details": self.to_string(),
        }));

        let mut response = (status, body).into_response();
        if matches!(self, ApiError::Unavailable) {
            // Shed load instead of queueing on an exhausted store.
            response
                .headers_mut()
                .insert("Retry-After", axum::http::HeaderValue::from_static("5"));
        }
        response
    }
}

/// Translate core errors into their HTTP shape.
pub fn map_error(e: anyhow::Error) -> ApiError {
    if let Some(dispatch) = e.downcast_ref::<shared::DispatchError>() {
        return match dispatch {
            shared::DispatchError::Validation { .. } => ApiError::BadRequest(dispatch.to_string()),
            shared::DispatchError::NotFound(kind) => ApiError::NotFound(kind.to_string()),
            shared::DispatchError::LimitExceeded(msg) => ApiError::LimitExceeded(msg.clone()),
            shared::DispatchError::QueuePaused(_) | shared::DispatchError::BatchTooLarge { .. } => {
                ApiError::BadRequest(dispatch.to_string())
            }
            shared::DispatchError::TaskDeleted => ApiError::Gone(dispatch.to_string()),
            shared::DispatchError::Database(msg) => classify_database_error(msg),
            shared::DispatchError::Network(msg) => ApiError::Internal(msg.clone()),
        };
    }

    let message = e.to_string();
    if message.contains("database is locked") || message.contains("database is busy") {
        warn!("Store contention surfaced to the API: {}", message);
        return ApiError::Unavailable;
    }

    ApiError::Internal(message)
}

fn classify_database_error(message: &str) -> ApiError {
    if message.contains("locked") || message.contains("busy") {
        ApiError::Unavailable
    } else {
        ApiError::Internal(message.to_string())
    }
}
