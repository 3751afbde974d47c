//! Test context wiring a live server over an in-memory store.

use crate::helpers::{ApiTestClient, RecordingLifecycle, start_test_server};
use crate::source::FakeSource;
use ciwi_api::{AppState, ServerInfo};
use ciwi_core::ports::SourceFetcher;
use ciwi_db::{
    Database, SqliteAppStateRepository, SqliteArtifactRepository, SqliteJobRepository,
    SqliteProjectRepository, SqliteVaultRepository,
};
use ciwi_scheduler::{AgentRegistry, ProjectService, Scheduler};
use ciwi_update::{UpdateConfig, UpdateController};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// Version the test server reports.
pub const SERVER_VERSION: &str = "v1.0.0";

/// A running server plus handles on its internals.
///
/// Drop this to stop the server and remove its directories.
pub struct TestContext {
    pub db: Database,
    pub state: Arc<AppState>,
    pub lifecycle: Arc<RecordingLifecycle>,
    pub client: ApiTestClient,
    pub addr: SocketAddr,
    config_dir: TempDir,
    _artifacts_dir: TempDir,
    handle: tokio::task::JoinHandle<()>,
}

impl TestContext {
    pub async fn new() -> anyhow::Result<Self> {
        Self::with_source(FakeSource::default()).await
    }

    pub async fn with_source(source: FakeSource) -> anyhow::Result<Self> {
        Self::start(source, UpdateConfig::default()).await
    }

    pub async fn start(source: FakeSource, update_config: UpdateConfig) -> anyhow::Result<Self> {
        crate::init_test_logging();

        let db = Database::in_memory().await?;
        db.migrate().await?;
        let pool = db.pool().clone();
        let config_dir = tempfile::tempdir()?;
        let artifacts_dir = tempfile::tempdir()?;

        let source: Arc<dyn SourceFetcher> = Arc::new(source);
        let registry = Arc::new(AgentRegistry::new(SERVER_VERSION, true));
        let project_repo = Arc::new(SqliteProjectRepository::new(pool.clone()));
        let scheduler = Arc::new(Scheduler::new(
            project_repo.clone(),
            Arc::new(SqliteJobRepository::new(pool.clone())),
            Arc::new(SqliteArtifactRepository::new(pool.clone(), artifacts_dir.path())),
            source.clone(),
            registry.clone(),
        ));
        let projects = Arc::new(ProjectService::new(
            project_repo,
            source.clone(),
            registry,
            config_dir.path(),
        ));
        let updates = Arc::new(UpdateController::new(
            update_config,
            Arc::new(SqliteAppStateRepository::new(pool.clone())),
            SERVER_VERSION,
        ));
        let lifecycle = Arc::new(RecordingLifecycle::default());
        let state = Arc::new(AppState::new(
            scheduler,
            projects,
            updates,
            Arc::new(SqliteVaultRepository::new(pool)),
            source,
            lifecycle.clone(),
            ServerInfo {
                name: "ciwi-test".to_string(),
                api_version: 1,
                version: SERVER_VERSION.to_string(),
                hostname: "test-host".to_string(),
            },
        ));

        let (addr, handle) = start_test_server(state.clone()).await?;
        Ok(Self {
            db,
            state,
            lifecycle,
            client: ApiTestClient::new(addr),
            addr,
            config_dir,
            _artifacts_dir: artifacts_dir,
            handle,
        })
    }

    /// Root that `/config/load` resolves against.
    pub fn config_dir(&self) -> &Path {
        self.config_dir.path()
    }

    /// Write a project config below the config directory.
    pub fn write_config(&self, name: &str, yaml: &str) -> anyhow::Result<()> {
        std::fs::write(self.config_dir.path().join(name), yaml)?;
        Ok(())
    }
}

impl Drop for TestContext {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
