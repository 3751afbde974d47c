//! Wiring of the stores, services and HTTP server.

use crate::config::ServerConfig;
use crate::lifecycle::ProcessLifecycle;
use anyhow::Context;
use ciwi_api::{AppState, ServerInfo, create_router};
use ciwi_core::ports::SourceFetcher;
use ciwi_core::version::current_version;
use ciwi_db::{
    Database, SqliteAppStateRepository, SqliteArtifactRepository, SqliteJobRepository,
    SqliteProjectRepository, SqliteVaultRepository,
};
use ciwi_scheduler::{AgentRegistry, GitSourceFetcher, ProjectService, Scheduler};
use ciwi_update::{ServiceMode, UpdateConfig, UpdateController};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Bind attempts while a previous process may still hold the port.
const BIND_ATTEMPTS: u32 = 20;
const BIND_RETRY_DELAY: Duration = Duration::from_millis(250);

pub async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    let version = current_version();
    let db = Database::open(&config.database_path())
        .await
        .context("failed to open database")?;
    db.migrate().await.context("failed to run migrations")?;
    let pool = db.pool().clone();

    let updates = Arc::new(UpdateController::new(
        UpdateConfig::from_env(),
        Arc::new(SqliteAppStateRepository::new(pool.clone())),
        version.clone(),
    ));
    let registry = Arc::new(AgentRegistry::new(version.clone(), updates.agent_auto_update()));
    let source: Arc<dyn SourceFetcher> = Arc::new(GitSourceFetcher::new());
    let project_repo = Arc::new(SqliteProjectRepository::new(pool.clone()));

    let scheduler = Arc::new(Scheduler::new(
        project_repo.clone(),
        Arc::new(SqliteJobRepository::new(pool.clone())),
        Arc::new(SqliteArtifactRepository::new(pool.clone(), config.artifacts_dir())),
        source.clone(),
        registry.clone(),
    ));
    let projects = Arc::new(ProjectService::new(
        project_repo,
        source.clone(),
        registry,
        config.config_dir.clone(),
    ));

    let capability = updates.capability();
    info!(mode = ?capability.mode, supported = capability.supported, reason = %capability.reason, "self-update capability");
    let lifecycle = Arc::new(ProcessLifecycle::new(capability.mode == ServiceMode::Service));

    let info = ServerInfo {
        name: config.name.clone(),
        api_version: 1,
        version: version.clone(),
        hostname: hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_default(),
    };
    let state = Arc::new(AppState::new(
        scheduler,
        projects.clone(),
        updates.clone(),
        Arc::new(SqliteVaultRepository::new(pool)),
        source,
        lifecycle,
        info,
    ));

    spawn_startup_tasks(projects, updates);

    let listener = bind(&config.bind_addr).await?;
    info!(addr = %config.bind_addr, version = %version, "ciwi server listening");
    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    info!("server stopped");
    Ok(())
}

/// Icon warmup and the post-update reload run in the background.
fn spawn_startup_tasks(projects: Arc<ProjectService>, updates: Arc<UpdateController>) {
    let warm = projects.clone();
    tokio::spawn(async move {
        match warm.warm_icons().await {
            Ok(warmed) => info!(warmed, "project icons warmed"),
            Err(e) => warn!(error = %e, "icon warmup failed"),
        }
    });
    tokio::spawn(async move {
        if let Err(e) = projects.reload_after_update(&updates).await {
            warn!(error = %e, "post-update project reload failed");
        }
    });
}

async fn bind(addr: &str) -> anyhow::Result<TcpListener> {
    let mut attempt = 1;
    loop {
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(listener),
            Err(e) if attempt < BIND_ATTEMPTS && e.kind() == std::io::ErrorKind::AddrInUse => {
                warn!(addr, attempt, "address in use, retrying");
                attempt += 1;
                tokio::time::sleep(BIND_RETRY_DELAY).await;
            }
            Err(e) => return Err(e).with_context(|| format!("failed to bind {addr}")),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
