//! Runtime mode reported by `/runtime-state`.

use crate::registry::{AgentRegistry, FreshnessCounts};
use chrono::{DateTime, Utc};
use ciwi_core::ports::SourceFetcher;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeMode {
    Normal,
    DegradedOffline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeState {
    pub mode: RuntimeMode,
    pub online_agents: usize,
    pub stale_agents: usize,
    pub offline_agents: usize,
    pub git_available: bool,
    pub self_update_disabled_agents: Vec<String>,
}

/// Degraded when git is missing, or when agents are known but none of them
/// has been seen recently.
pub fn mode_for(counts: FreshnessCounts, git_available: bool) -> RuntimeMode {
    let known = counts.online + counts.stale + counts.offline;
    if !git_available || (known > 0 && counts.online + counts.stale == 0) {
        RuntimeMode::DegradedOffline
    } else {
        RuntimeMode::Normal
    }
}

pub async fn runtime_state(
    registry: &AgentRegistry,
    source: &dyn SourceFetcher,
    now: DateTime<Utc>,
) -> RuntimeState {
    let git_available = source.is_available().await;
    let counts = registry.freshness_counts(now).await;
    RuntimeState {
        mode: mode_for(counts, git_available),
        online_agents: counts.online,
        stale_agents: counts.stale,
        offline_agents: counts.offline,
        git_available,
        self_update_disabled_agents: registry.self_update_disabled_agents().await,
    }
}
