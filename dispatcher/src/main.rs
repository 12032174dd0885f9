//! Webhook Scheduling and Dispatch Service
//!
//! The dispatcher turns declared HTTP calls into attempted, retried,
//! ordered and reported executions. This entry point owns the lifecycle:
//! it initializes logging and configuration, opens the store, starts each
//! long-running component (scheduler, worker pool, counter flusher,
//! monitor checker, cleaner) with a shutdown channel, and serves the
//! engine's small HTTP surface until a termination signal arrives.

// Use jemalloc as the global allocator for better performance
#[cfg(not(target_os = "windows"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

/// Service version from Cargo.toml
const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

use anyhow::{Context, Result};
use clap::Parser;
use shared::config::ServiceConfig;
use shared::utils::current_timestamp_millis;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

mod api;
mod callbacks;
mod cleanup;
mod commands;
mod counter;
mod database;
mod host_blocker;
mod inbound;
mod monitor_checker;
mod scheduler;
mod workers;

#[cfg(test)]
mod tests;

use api::Liveness;
use callbacks::Notifier;
use cleanup::Cleaner;
use counter::ExecutionCounter;
use database::DispatcherDatabase;
use host_blocker::HostBlocker;
use inbound::InboundDispatcher;
use monitor_checker::MonitorChecker;
use scheduler::Scheduler;
use workers::{WorkerContext, WorkerPool};

/// Command-line arguments for the dispatcher
#[derive(Parser, Debug)]
#[command(name = "dispatcher")]
#[command(about = "Multi-tenant webhook scheduling and dispatch service", long_about = None)]
struct CliArgs {
    /// Path to the service configuration file (dispatcher.toml)
    #[arg(value_name = "CONFIG_FILE")]
    config_file: Option<PathBuf>,

    /// Override the listen address from config file
    #[arg(long = "listen-address", value_name = "ADDRESS")]
    listen_address: Option<String>,

    /// Override the data directory from config file
    #[arg(long = "data-dir", value_name = "DIR")]
    data_dir: Option<String>,

    /// Override the maximum worker count from config file
    #[arg(long = "max-workers", value_name = "COUNT")]
    max_workers: Option<usize>,

    /// Override the scheduler tick interval from config file
    #[arg(long = "scheduler-tick-ms", value_name = "MS")]
    scheduler_tick_ms: Option<u64>,
}

/// The running service: configuration, shared state, and the handles of
/// every background component.
pub struct Service {
    config: Arc<ServiceConfig>,
    listen_address: SocketAddr,
    database: Arc<Mutex<DispatcherDatabase>>,
    liveness: Liveness,
    shutdown_tx: broadcast::Sender<()>,
    component_handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl Service {
    /// Create the service scaffolding: validated config, store handle, and
    /// the shutdown channel. Nothing runs yet.
    pub fn new(config: ServiceConfig) -> Result<Self> {
        let listen_address: SocketAddr = config
            .listen_address
            .parse()
            .with_context(|| format!("Invalid listen address '{}'", config.listen_address))?;

        let database = DispatcherDatabase::new(config.data_dir(), config.database_busy_timeout_seconds)
            .context("Failed to create database manager")?;

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config: Arc::new(config),
            listen_address,
            database: Arc::new(Mutex::new(database)),
            liveness: Liveness::new(),
            shutdown_tx,
            component_handles: Vec::new(),
        })
    }

    /// Start every component and serve HTTP until shutdown.
    pub async fn run(&mut self) -> Result<()> {
        info!("Starting webhook dispatch service v{}", SERVICE_VERSION);
        info!(
            listen_address = %self.listen_address,
            data_dir = %self.config.data_dir(),
            min_workers = self.config.min_workers,
            max_workers = self.config.max_workers,
            "Service configuration loaded"
        );

        {
            let mut db = self.database.lock().await;
            db.initialize().await.context("Failed to initialize database")?;
            // Catch up the monthly counter reset in case the service was
            // down over a month boundary.
            db.reset_stale_monthly_counters(current_timestamp_millis())
                .await?;
        }

        let counter = ExecutionCounter::new();
        let blocker = HostBlocker::new(
            self.config.host_blocker_fail_threshold,
            self.config.host_blocker_base_s,
            self.config.host_blocker_cap_s,
        );
        let worker_notify = Arc::new(Notify::new());
        let notifier = Notifier::new(Arc::clone(&self.database), Arc::clone(&self.config))?;

        // Scheduler
        let scheduler = Scheduler::new(
            Arc::clone(&self.database),
            counter.clone(),
            Arc::clone(&self.config),
            Arc::clone(&worker_notify),
        );
        self.spawn_component("scheduler", {
            let shutdown_rx = self.shutdown_tx.subscribe();
            async move { scheduler.run(shutdown_rx).await }
        })
        .await;

        // Worker pool controller
        let worker_context = WorkerContext {
            database: Arc::clone(&self.database),
            blocker: blocker.clone(),
            counter: counter.clone(),
            notifier: notifier.clone(),
            config: Arc::clone(&self.config),
            http_client: workers::build_http_client(&self.config)?,
            shutdown_tx: self.shutdown_tx.clone(),
        };
        let mut pool = WorkerPool::new(worker_context, Arc::clone(&worker_notify));
        self.spawn_component("worker_pool", {
            let shutdown_rx = self.shutdown_tx.subscribe();
            async move { pool.run(shutdown_rx).await }
        })
        .await;

        // Counter flusher
        self.spawn_component("counter_flusher", {
            let database = Arc::clone(&self.database);
            let counter = counter.clone();
            let flush_ms = self.config.counter_flush_ms;
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            async move {
                let mut interval =
                    tokio::time::interval(std::time::Duration::from_millis(flush_ms));
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            flush_counter(&database, &counter).await;
                        }
                        _ = shutdown_rx.recv() => {
                            info!("Counter flusher received shutdown signal");
                            // Final flush so terminal counts survive restarts.
                            flush_counter(&database, &counter).await;
                            break;
                        }
                    }
                }
            }
        })
        .await;

        // Monitor checker
        let monitor_checker = Arc::new(MonitorChecker::new(
            Arc::clone(&self.database),
            notifier.clone(),
            Arc::clone(&self.config),
        ));
        self.spawn_component("monitor_checker", {
            let checker = Arc::clone(&monitor_checker);
            let shutdown_rx = self.shutdown_tx.subscribe();
            async move { checker.run(shutdown_rx).await }
        })
        .await;

        // Cleaner
        let cleaner = Cleaner::new(Arc::clone(&self.database), Arc::clone(&self.config));
        self.spawn_component("cleaner", {
            let shutdown_rx = self.shutdown_tx.subscribe();
            async move { cleaner.run(shutdown_rx).await }
        })
        .await;

        // WAL checkpoint loop
        self.spawn_component("wal_checkpoint", {
            let database = Arc::clone(&self.database);
            let interval_secs = self.config.wal_checkpoint_interval_seconds;
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            async move {
                let mut interval =
                    tokio::time::interval(std::time::Duration::from_secs(interval_secs));
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            let mut db = database.lock().await;
                            if let Err(e) = db.checkpoint_wal().await {
                                warn!("WAL checkpoint failed: {}", e);
                            }
                        }
                        _ = shutdown_rx.recv() => {
                            info!("WAL checkpoint task received shutdown signal");
                            break;
                        }
                    }
                }
            }
        })
        .await;

        // Host blocker stale-entry cleanup, hourly.
        self.spawn_component("blocker_cleanup", {
            let blocker = blocker.clone();
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            async move {
                let mut interval =
                    tokio::time::interval(std::time::Duration::from_secs(3600));
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            blocker.cleanup_stale_entries(current_timestamp_millis()).await;
                        }
                        _ = shutdown_rx.recv() => break,
                    }
                }
            }
        })
        .await;

        // HTTP surface: inbound events, pings, health, status.
        let inbound = Arc::new(InboundDispatcher::new(
            Arc::clone(&self.database),
            Arc::clone(&worker_notify),
        ));
        let app_state = api::AppState {
            database: Arc::clone(&self.database),
            inbound,
            monitor_checker,
            liveness: self.liveness.clone(),
            config: Arc::clone(&self.config),
        };
        let app = api::create_router(app_state);

        info!("Starting HTTP surface on {}", self.listen_address);
        let listener = tokio::net::TcpListener::bind(self.listen_address)
            .await
            .with_context(|| format!("Failed to bind TCP listener to {}", self.listen_address))?;

        let shutdown_signal = {
            let mut rx = self.shutdown_tx.subscribe();
            async move {
                let _ = rx.recv().await;
                info!("HTTP surface received shutdown signal");
            }
        };

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

        Ok(())
    }

    /// Spawn a named component, tracking liveness for the status endpoint
    /// and the join handle for shutdown.
    async fn spawn_component<F>(&mut self, name: &'static str, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.liveness.mark_running(name).await;
        let liveness = self.liveness.clone();
        let handle = tokio::spawn(async move {
            fut.await;
            liveness.mark_stopped(name).await;
        });
        self.component_handles.push((name, handle));
        info!("Component '{}' started", name);
    }

    /// Graceful shutdown: signal every component, wait for each within the
    /// configured timeout, then close the store.
    pub async fn shutdown(&mut self) {
        info!("Shutting down dispatch service gracefully");
        let timeout = std::time::Duration::from_secs(self.config.graceful_shutdown_timeout_seconds);

        if let Err(e) = self.shutdown_tx.send(()) {
            warn!("Failed to send shutdown signal: {}", e);
        }

        for (name, handle) in self.component_handles.drain(..) {
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => info!("Component '{}' stopped", name),
                Ok(Err(e)) => warn!("Component '{}' panicked: {}", name, e),
                Err(_) => warn!("Component '{}' shutdown timeout reached", name),
            }
        }

        let mut db = self.database.lock().await;
        db.close().await;
        info!("Service shutdown complete");
    }
}

/// Fold the in-process counter deltas into the store. On failure the
/// deltas are restored so usage is never silently lost.
async fn flush_counter(
    database: &Arc<Mutex<DispatcherDatabase>>,
    counter: &ExecutionCounter,
) {
    let deltas = counter.drain();
    if deltas.is_empty() {
        return;
    }

    let mut db = database.lock().await;
    let mut failed = std::collections::HashMap::new();
    for (tenant_id, delta) in deltas {
        if let Err(e) = db.add_execution_count(tenant_id, delta).await {
            error!(tenant_id, "Counter flush failed: {}", e);
            failed.insert(tenant_id, delta);
        }
    }

    // Opportunistic monthly rollover check alongside the flush.
    if let Err(e) = db
        .reset_stale_monthly_counters(current_timestamp_millis())
        .await
    {
        warn!("Monthly counter reset check failed: {}", e);
    }
    drop(db);

    if !failed.is_empty() {
        counter.restore(failed);
    }
}

/// Merge command-line overrides into the loaded configuration.
fn apply_cli_overrides(config: &mut ServiceConfig, args: &CliArgs) {
    if let Some(addr) = &args.listen_address {
        config.listen_address = addr.clone();
    }
    if let Some(dir) = &args.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(max_workers) = args.max_workers {
        config.max_workers = max_workers;
    }
    if let Some(tick_ms) = args.scheduler_tick_ms {
        config.scheduler_tick_ms = tick_ms;
    }
}

fn init_logging(config: &ServiceConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("dispatcher=info,shared=info"));

    match &config.log_file {
        Some(path) => {
            let directory = std::path::Path::new(path)
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from("."));
            let file_name = std::path::Path::new(path)
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_else(|| "dispatcher.log".to_string());
            let file_appender = tracing_appender::rolling::daily(directory, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            if config.log_json {
                tracing_subscriber::fmt()
                    .with_env_filter(env_filter)
                    .json()
                    .with_current_span(false)
                    .with_span_list(false)
                    .with_writer(non_blocking)
                    .init();
            } else {
                tracing_subscriber::fmt()
                    .with_env_filter(env_filter)
                    .with_writer(non_blocking)
                    .init();
            }
            Some(guard)
        }
        None => {
            if config.log_json {
                tracing_subscriber::fmt()
                    .with_env_filter(env_filter)
                    .json()
                    .with_current_span(false)
                    .with_span_list(false)
                    .init();
            } else {
                tracing_subscriber::fmt().with_env_filter(env_filter).init();
            }
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    let mut config = match &cli_args.config_file {
        Some(path) => ServiceConfig::load_from_file(path)?,
        None => ServiceConfig::default(),
    };
    apply_cli_overrides(&mut config, &cli_args);
    config.validate()?;

    // The guard must outlive the runtime for file logging to flush.
    let _log_guard = init_logging(&config);

    info!("Webhook dispatch service starting up");
    if let Some(path) = &cli_args.config_file {
        info!("Configuration file: {}", path.display());
    } else {
        info!("No configuration file given, using defaults");
    }

    let mut service = Service::new(config)?;

    // Run until the HTTP surface exits or a termination signal arrives.
    let shutdown_signal = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
    };

    tokio::select! {
        result = service.run() => {
            if let Err(e) = result {
                error!("Service error: {}", e);
            }
        }
        _ = shutdown_signal => {
            info!("Shutdown signal received");
        }
    }

    service.shutdown().await;
    info!("Dispatcher shutdown complete");
    Ok(())
}
