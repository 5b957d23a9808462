/// Server setup and initialization
///
/// Wires together all components: both stores on one SQLite pool, the work
/// queue, the state machine and its dispatcher, lease recovery, and the HTTP
/// routes. Provides the application factory used by the binary and by tests.

use crate::{
    api::{create_operation_routes, create_workflow_routes, AppState},
    config::{Config, LifecycleConfig},
    lifecycle::LifecycleManager,
    operation::OperationTracker,
    runtime::{
        reaper::Sweep, DeploymentBackend, DeploymentStateMachine, Dispatcher, HttpDeploymentBackend,
        LeaseReaper, LocalBackend, WorkQueue,
    },
    workflow::WorkflowStorage,
};
use anyhow::{Context, Result};
use axum::{routing::get, Router};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Build the lifecycle manager and start its background tasks
///
/// Initializes both schemas, starts the dispatcher, runs the startup recovery
/// sweep so transitions orphaned by a previous process are resumed or reverted,
/// then starts the periodic reaper.
pub async fn create_manager(
    pool: SqlitePool,
    backend: Arc<dyn DeploymentBackend>,
    config: &LifecycleConfig,
) -> Result<Arc<LifecycleManager>> {
    let workflows = WorkflowStorage::new(pool.clone());
    let operations = OperationTracker::new(pool);

    tracing::info!("Initializing workflow and operation stores");
    workflows.init_schema().await.context("failed to create workflows table")?;
    operations.init_schema().await.context("failed to create operations table")?;

    let owner = format!("manager-{}", uuid::Uuid::new_v4());
    let (queue, receiver) = WorkQueue::bounded(config.queue_capacity);

    let machine = Arc::new(DeploymentStateMachine::new(
        workflows.clone(),
        operations.clone(),
        backend,
        config.lease_duration(),
    ));
    Dispatcher::new(machine, config.workers).spawn(receiver);

    let reaper = LeaseReaper::new(
        workflows.clone(),
        operations.clone(),
        queue.clone(),
        owner.clone(),
        config.lease_duration(),
    );
    let report = reaper
        .sweep(Sweep::Startup)
        .await
        .context("startup recovery sweep failed")?;
    tracing::info!(
        "Startup recovery: {} resumed, {} reverted, {} operations abandoned",
        report.resumed,
        report.reverted,
        report.abandoned_operations
    );
    reaper.spawn(config.reaper_interval());

    tracing::info!("Lifecycle manager ready (owner {})", owner);
    Ok(Arc::new(LifecycleManager::new(
        workflows,
        operations,
        queue,
        config.clone(),
        owner,
    )))
}

/// Create the main Axum application with all routes
pub fn create_app(manager: Arc<LifecycleManager>) -> Router {
    let state = AppState { manager };
    Router::new()
        // Health check endpoint
        .route("/healthz", get(health_check))
        .merge(create_workflow_routes())
        .merge(create_operation_routes())
        .with_state(state)
}

/// Open (creating if needed) the SQLite database behind both stores
pub async fn connect_database(url: &str) -> Result<SqlitePool> {
    if let Some(path) = url.strip_prefix("sqlite://").filter(|p| !p.starts_with(":memory:")) {
        if let Some(dir) = Path::new(path).parent().filter(|d| !d.as_os_str().is_empty()) {
            tracing::info!("Ensuring data directory exists: {}", dir.display());
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create data directory {}", dir.display()))?;
        }
    }

    let options = SqliteConnectOptions::from_str(url)
        .with_context(|| format!("invalid database url {}", url))?
        .create_if_missing(true);
    let pool = SqlitePool::connect_with(options)
        .await
        .with_context(|| format!("failed to open database {}", url))?;
    Ok(pool)
}

/// Start the HTTP server with the given configuration
pub async fn start_server(config: Config) -> Result<()> {
    // Initialize tracing subscriber for logging; RUST_LOG overrides the default level
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting workflowctl server...");

    let pool = connect_database(&config.database.url).await?;

    let backend: Arc<dyn DeploymentBackend> = match &config.backend.url {
        Some(url) => {
            tracing::info!("Using HTTP deployment backend at {}", url);
            Arc::new(HttpDeploymentBackend::new(url.clone()))
        }
        None => {
            tracing::warn!("No deployment backend configured; deployments are accepted locally");
            Arc::new(LocalBackend)
        }
    };

    let manager = create_manager(pool, backend, &config.lifecycle).await?;
    let app = create_app(manager);

    // Bind to the configured address
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;

    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}

/// Health check endpoint handler
async fn health_check() -> &'static str {
    "ok"
}
