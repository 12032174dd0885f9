//! Shared fixtures for dispatcher tests: scratch databases, tenants,
//! tasks, worker contexts and a scriptable local HTTP server.

use crate::callbacks::Notifier;
use crate::counter::ExecutionCounter;
use crate::database::{DispatcherDatabase, NewTask};
use crate::host_blocker::HostBlocker;
use crate::workers::{build_http_client, WorkerContext};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Router;
use shared::config::ServiceConfig;
use shared::model::{PlanTier, ScheduleType, Task, Tenant};
use shared::utils::current_timestamp_millis;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use tempfile::TempDir;
use tokio::sync::{broadcast, Mutex};

/// Open a fresh database in a temp directory. The TempDir must be kept
/// alive by the caller for the duration of the test.
pub async fn test_db() -> (TempDir, Arc<Mutex<DispatcherDatabase>>) {
    let dir = TempDir::new().unwrap();
    let mut db = DispatcherDatabase::new(dir.path(), 5).unwrap();
    db.initialize().await.unwrap();
    (dir, Arc::new(Mutex::new(db)))
}

pub fn test_config() -> Arc<ServiceConfig> {
    Arc::new(ServiceConfig::default())
}

pub async fn create_tenant(
    db: &Arc<Mutex<DispatcherDatabase>>,
    plan: PlanTier,
    now_ms: i64,
) -> Tenant {
    let mut db = db.lock().await;
    db.create_tenant("acme", plan, Some("ops@acme.test"), now_ms)
        .await
        .unwrap()
}

/// A once-task payload with sane defaults; tweak fields on the result.
pub fn once_task(tenant_id: i64, url: &str, scheduled_at: i64) -> NewTask {
    NewTask {
        tenant_id,
        name: "test task".to_string(),
        url: url.to_string(),
        method: "POST".to_string(),
        headers: BTreeMap::new(),
        body: None,
        schedule_type: ScheduleType::Once,
        cron_expression: None,
        scheduled_at: Some(scheduled_at),
        enabled: true,
        queue: String::new(),
        timeout_ms: 5000,
        retry_attempts: 0,
        expected_status_codes: None,
        expected_body_pattern: None,
        callback_url: None,
        alert_on_failure: true,
        muted: false,
        interval_minutes: None,
        next_run_at: Some(scheduled_at),
        source_endpoint_id: None,
    }
}

/// Insert a task and an already-due pending execution for it. Returns the
/// task and the execution id.
pub async fn task_with_pending(
    db: &Arc<Mutex<DispatcherDatabase>>,
    tenant_id: i64,
    url: &str,
    queue: &str,
    retry_attempts: i64,
    now_ms: i64,
) -> (Task, i64) {
    let mut new = once_task(tenant_id, url, now_ms);
    new.queue = queue.to_string();
    new.retry_attempts = retry_attempts;
    new.next_run_at = None;

    let mut db = db.lock().await;
    let task = db.insert_task(&new, now_ms).await.unwrap();
    let execution_id = db
        .create_pending_execution(task.id, tenant_id, now_ms, 1, None, now_ms)
        .await
        .unwrap()
        .unwrap();
    (task, execution_id)
}

pub fn worker_context(
    db: &Arc<Mutex<DispatcherDatabase>>,
    config: &Arc<ServiceConfig>,
) -> WorkerContext {
    let (shutdown_tx, _) = broadcast::channel(1);
    WorkerContext {
        database: Arc::clone(db),
        blocker: HostBlocker::new(
            config.host_blocker_fail_threshold,
            config.host_blocker_base_s,
            config.host_blocker_cap_s,
        ),
        counter: ExecutionCounter::new(),
        notifier: Notifier::new(Arc::clone(db), Arc::clone(config)).unwrap(),
        config: Arc::clone(config),
        http_client: build_http_client(config).unwrap(),
        shutdown_tx,
    }
}

/// One scripted response from the mock downstream server.
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: u16,
    pub body: String,
    pub headers: Vec<(String, String)>,
}

impl MockResponse {
    pub fn with_status(status: u16) -> Self {
        Self {
            status,
            body: "ok".to_string(),
            headers: Vec::new(),
        }
    }
}

/// What the mock server saw for one request.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

#[derive(Clone)]
struct MockState {
    script: Arc<StdMutex<VecDeque<MockResponse>>>,
    hits: Arc<StdMutex<Vec<CapturedRequest>>>,
}

pub struct MockServer {
    pub addr: std::net::SocketAddr,
    pub hits: Arc<StdMutex<Vec<CapturedRequest>>>,
}

impl MockServer {
    pub fn url(&self) -> String {
        format!("http://{}/hook", self.addr)
    }

    pub fn hit_count(&self) -> usize {
        self.hits.lock().unwrap().len()
    }

    /// Poll until at least `count` requests arrived or the timeout runs
    /// out.
    pub async fn wait_for_hits(&self, count: usize, timeout_ms: u64) -> bool {
        let deadline = current_timestamp_millis() + timeout_ms as i64;
        while current_timestamp_millis() < deadline {
            if self.hit_count() >= count {
                return true;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        self.hit_count() >= count
    }
}

async fn mock_handler(
    State(state): State<MockState>,
    method: axum::http::Method,
    headers: HeaderMap,
    body: Bytes,
) -> axum::response::Response {
    {
        let mut hits = state.hits.lock().unwrap();
        hits.push(CapturedRequest {
            method: method.to_string(),
            headers: headers
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_string(), v.to_string()))
                })
                .collect(),
            body: String::from_utf8_lossy(&body).into_owned(),
        });
    }

    let next = state
        .script
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or_else(|| MockResponse::with_status(200));

    let mut builder = axum::http::Response::builder().status(next.status);
    for (name, value) in next.headers {
        builder = builder.header(name, value);
    }
    builder
        .body(axum::body::Body::from(next.body))
        .unwrap()
}

/// Start a local HTTP server answering from a script of responses (then
/// 200s once the script is exhausted). Records every request it sees.
pub async fn start_mock_server(script: Vec<MockResponse>) -> MockServer {
    let state = MockState {
        script: Arc::new(StdMutex::new(script.into_iter().collect())),
        hits: Arc::new(StdMutex::new(Vec::new())),
    };
    let hits = Arc::clone(&state.hits);

    let app = Router::new().fallback(mock_handler).with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    MockServer { addr, hits }
}
