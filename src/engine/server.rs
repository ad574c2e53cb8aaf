use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;

use super::api::{self, AppState};
use super::broadcaster::LogBroadcaster;
use super::db::{DbHandle, EngineDb};
use super::knowledge::InMemoryKnowledgeStore;
use super::orchestrator::Orchestrator;
use super::providers::http_stages;
use super::stages::Stages;
use super::worker::{WorkerPool, job_queue};
use crate::config::EngineConfig;

/// Configuration for the engine server.
pub struct ServerConfig {
    pub port: u16,
    pub db_path: PathBuf,
    pub dev_mode: bool,
    pub engine: EngineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            port: 3142,
            db_path: engine.db_path.clone(),
            dev_mode: false,
            engine,
        }
    }
}

/// Build the full application router.
pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router().with_state(state)
}

/// Wire the store, stages and orchestrator. Returns the orchestrator plus
/// an unstarted worker pool.
pub fn assemble(db: EngineDb, stages: Stages, engine: EngineConfig) -> (Arc<Orchestrator>, WorkerPool) {
    let (queue, receiver) = job_queue();
    let knowledge = Arc::new(InMemoryKnowledgeStore::new(
        engine.knowledge.repo_capacity,
        engine.knowledge.max_context_chars,
    ));
    let logs = Arc::new(LogBroadcaster::new(engine.log_backlog));
    let orchestrator = Arc::new(Orchestrator::new(DbHandle::new(db), stages, knowledge, logs, engine, queue));
    let pool = WorkerPool::new(orchestrator.clone(), receiver);
    (orchestrator, pool)
}

/// Start the engine: HTTP server, worker pool and watchdog.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    for warning in config.engine.validate() {
        tracing::warn!("{}", warning);
    }

    // Ensure parent directory exists for DB
    if let Some(parent) = config.db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }

    let db = EngineDb::new(&config.db_path).context("Failed to initialize engine database")?;
    let stages = http_stages(&config.engine.providers, config.engine.stage_timeout)?;
    let (orchestrator, pool) = assemble(db, stages, config.engine);

    let resumed = pool.resume().await?;
    let workers = pool.start();

    let mut app = build_router(Arc::new(AppState::new(orchestrator)));
    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if config.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    println!("G3 engine running at http://{}", local_addr);
    if resumed > 0 {
        println!("Resumed {} unfinished job(s)", resumed);
    }

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error");

    workers.shutdown().await;
    served?;
    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    println!("\nShutting down...");
}
