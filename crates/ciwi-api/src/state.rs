//! Application state shared across handlers.

use ciwi_core::ports::{SourceFetcher, VaultRepository};
use ciwi_scheduler::{AgentRegistry, ProjectService, Scheduler};
use ciwi_update::UpdateController;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Process exit hooks used by the update and restart endpoints. Both are
/// scheduled so the response reaches the client first.
pub trait ServerLifecycle: Send + Sync {
    /// Exit after `delay` so an update helper can take over.
    fn exit_after(&self, delay: Duration);

    /// Restart the server after `delay`.
    fn restart_after(&self, delay: Duration);
}

/// Identity reported by `/server-info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub api_version: u32,
    pub version: String,
    pub hostname: String,
}

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    pub projects: Arc<ProjectService>,
    pub updates: Arc<UpdateController>,
    pub vault: Arc<dyn VaultRepository>,
    pub source: Arc<dyn SourceFetcher>,
    pub lifecycle: Arc<dyn ServerLifecycle>,
    pub info: ServerInfo,
}

impl AppState {
    pub fn new(
        scheduler: Arc<Scheduler>,
        projects: Arc<ProjectService>,
        updates: Arc<UpdateController>,
        vault: Arc<dyn VaultRepository>,
        source: Arc<dyn SourceFetcher>,
        lifecycle: Arc<dyn ServerLifecycle>,
        info: ServerInfo,
    ) -> Self {
        Self {
            scheduler,
            projects,
            updates,
            vault,
            source,
            lifecycle,
            info,
        }
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        self.scheduler.registry()
    }
}
