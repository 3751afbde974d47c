//! In-memory agent registry.
//!
//! One mutex guards agents, pending update targets, and project icons. Every
//! critical section is short and does no I/O; callers copy out what they need.

use chrono::{DateTime, Utc};
use ciwi_core::agent::{
    AgentState, AgentView, Freshness, HeartbeatRequest, HeartbeatResponse,
    SELF_UPDATE_DISABLED_MARKER,
};
use ciwi_core::ids::ProjectId;
use ciwi_core::ports::ProjectIcon;
use ciwi_core::version::{is_release_version, is_version_different, is_version_newer};
use ciwi_core::{Error, Result};
use ciwi_update::policy::{retry_backoff, should_request_agent_update};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Default)]
struct RegistryState {
    agents: HashMap<String, AgentState>,
    /// Targets set by operators, taking precedence over an agent's resident target.
    pending_updates: HashMap<String, String>,
    icons: HashMap<ProjectId, ProjectIcon>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRequestResult {
    pub requested: bool,
    pub agent_id: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreshnessCounts {
    pub online: usize,
    pub stale: usize,
    pub offline: usize,
}

pub struct AgentRegistry {
    state: Mutex<RegistryState>,
    server_version: String,
    auto_update: bool,
}

impl AgentRegistry {
    pub fn new(server_version: impl Into<String>, auto_update: bool) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            server_version: server_version.into(),
            auto_update,
        }
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    /// Record a heartbeat and decide whether the agent should update.
    ///
    /// `last_seen_utc` follows the server clock `now` and never moves
    /// backwards. The request's `timestamp_utc` is accepted but not used, so a
    /// skewed agent clock cannot shift its freshness.
    pub async fn heartbeat(
        &self,
        req: HeartbeatRequest,
        now: DateTime<Utc>,
    ) -> Result<HeartbeatResponse> {
        let agent_id = req.agent_id.trim().to_string();
        if agent_id.is_empty() {
            return Err(Error::validation("agent_id is required"));
        }

        let mut state = self.state.lock().await;
        let RegistryState {
            agents,
            pending_updates,
            ..
        } = &mut *state;

        let first_contact = !agents.contains_key(&agent_id);
        let agent = agents
            .entry(agent_id.clone())
            .or_insert_with(|| AgentState::new(agent_id.clone()));

        if first_contact {
            agent.log(now, format!("heartbeat received (first contact, version {})", display_version(&req.version)));
            info!(agent_id = %agent_id, hostname = %req.hostname, version = %req.version, "agent registered");
        } else if agent.version != req.version {
            agent.log(
                now,
                format!(
                    "heartbeat received (version {} -> {})",
                    display_version(&agent.version),
                    display_version(&req.version)
                ),
            );
        } else if agent.capabilities != req.capabilities {
            agent.log(now, "heartbeat received (capabilities changed)");
        }

        agent.hostname = req.hostname;
        agent.os = req.os;
        agent.arch = req.arch;
        agent.version = req.version;
        agent.capabilities = req.capabilities;
        agent.last_seen_utc = Some(agent.last_seen_utc.map_or(now, |prev| prev.max(now)));

        if let Some(reason) = req
            .update_failure_reason
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
        {
            record_update_failure(agent, reason, now);
        }

        let pending = pending_updates
            .get(&agent_id)
            .cloned()
            .or_else(|| Some(agent.update_target.clone()))
            .filter(|t| !t.trim().is_empty());

        let mut update_target = String::new();
        if let Some(target) = pending {
            if !is_version_newer(&target, &agent.version) {
                // Reached (or passed) the target.
                pending_updates.remove(&agent_id);
                agent.update_target.clear();
                agent.update_attempts = 0;
                agent.update_next_retry_utc = None;
                agent.update_last_error = None;
                agent.log(now, format!("update target {target} reached"));
            } else {
                let backing_off = agent.update_next_retry_utc.is_some_and(|at| now < at);
                if !backing_off
                    && should_request_agent_update(&agent.version, &target, self.auto_update)
                {
                    agent.update_target = target.clone();
                    agent.update_last_request_utc = Some(now);
                    update_target = target;
                }
            }
        }

        let refresh_tools_requested = std::mem::take(&mut agent.tool_refresh_requested);
        debug!(agent_id = %agent_id, update_requested = !update_target.is_empty(), refresh_tools_requested, "heartbeat");

        Ok(HeartbeatResponse {
            accepted: true,
            update_requested: !update_target.is_empty(),
            update_target,
            refresh_tools_requested,
        })
    }

    /// Ask an agent to move to `target` (the server version when `None`).
    pub async fn request_update(
        &self,
        agent_id: &str,
        target: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<UpdateRequestResult> {
        if !is_release_version(&self.server_version) {
            return Err(Error::validation("server version is not a release version"));
        }
        let target = target
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(&self.server_version)
            .to_string();

        let mut state = self.state.lock().await;
        let RegistryState {
            agents,
            pending_updates,
            ..
        } = &mut *state;
        let agent = agents
            .get_mut(agent_id)
            .ok_or_else(|| Error::AgentNotFound(agent_id.to_string()))?;

        if !is_version_different(&target, &agent.version) {
            return Ok(UpdateRequestResult {
                requested: false,
                agent_id: agent_id.to_string(),
                target,
                message: "already at target version".into(),
            });
        }

        pending_updates.insert(agent_id.to_string(), target.clone());
        agent.update_target = target.clone();
        agent.update_attempts = 0;
        agent.update_last_request_utc = None;
        agent.update_next_retry_utc = None;
        agent.log(now, format!("update to {target} requested by operator"));
        info!(agent_id, target = %target, "agent update requested");

        Ok(UpdateRequestResult {
            requested: true,
            agent_id: agent_id.to_string(),
            target,
            message: String::new(),
        })
    }

    /// Flag a tool refresh; the next heartbeat response consumes it.
    pub async fn refresh_tools(&self, agent_id: &str, now: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;
        let agent = state
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| Error::AgentNotFound(agent_id.to_string()))?;
        agent.tool_refresh_requested = true;
        agent.log(now, "tool refresh requested");
        Ok(())
    }

    pub async fn note(&self, agent_id: &str, now: DateTime<Utc>, message: impl Into<String>) {
        let mut state = self.state.lock().await;
        if let Some(agent) = state.agents.get_mut(agent_id) {
            agent.log(now, message);
        }
    }

    pub async fn get(&self, agent_id: &str) -> Option<AgentState> {
        self.state.lock().await.agents.get(agent_id).cloned()
    }

    pub async fn view(&self, agent_id: &str, now: DateTime<Utc>) -> Option<AgentView> {
        self.state
            .lock()
            .await
            .agents
            .get(agent_id)
            .map(|a| a.view(now, &self.server_version))
    }

    /// Views sorted by agent id.
    pub async fn views(&self, now: DateTime<Utc>) -> Vec<AgentView> {
        let state = self.state.lock().await;
        let mut views: Vec<AgentView> = state
            .agents
            .values()
            .map(|a| a.view(now, &self.server_version))
            .collect();
        views.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        views
    }

    /// Registered capabilities of `agent_id` overlaid with `overrides`.
    pub async fn effective_capabilities(
        &self,
        agent_id: &str,
        overrides: &BTreeMap<String, String>,
    ) -> BTreeMap<String, String> {
        let mut caps = self
            .state
            .lock()
            .await
            .agents
            .get(agent_id)
            .map(AgentState::effective_capabilities)
            .unwrap_or_default();
        caps.extend(overrides.clone());
        caps.insert(
            ciwi_core::agent::caps::AGENT_ID.to_string(),
            agent_id.to_string(),
        );
        caps
    }

    /// Effective capabilities of every known agent.
    pub async fn capability_sets(&self) -> Vec<BTreeMap<String, String>> {
        self.state
            .lock()
            .await
            .agents
            .values()
            .map(AgentState::effective_capabilities)
            .collect()
    }

    pub async fn freshness_counts(&self, now: DateTime<Utc>) -> FreshnessCounts {
        let state = self.state.lock().await;
        let mut counts = FreshnessCounts::default();
        for agent in state.agents.values() {
            match agent.freshness(now) {
                Freshness::Online => counts.online += 1,
                Freshness::Stale => counts.stale += 1,
                Freshness::Offline => counts.offline += 1,
            }
        }
        counts
    }

    pub async fn self_update_disabled_agents(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut ids: Vec<String> = state
            .agents
            .values()
            .filter(|a| a.self_update_disabled)
            .map(|a| a.agent_id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub async fn set_icon(&self, project_id: ProjectId, icon: Option<ProjectIcon>) {
        let mut state = self.state.lock().await;
        match icon {
            Some(icon) => {
                state.icons.insert(project_id, icon);
            }
            None => {
                state.icons.remove(&project_id);
            }
        }
    }

    pub async fn icon(&self, project_id: ProjectId) -> Option<ProjectIcon> {
        self.state.lock().await.icons.get(&project_id).cloned()
    }
}

fn display_version(version: &str) -> &str {
    if version.trim().is_empty() {
        "unknown"
    } else {
        version
    }
}

/// Start (or keep) the retry backoff after an agent reports a failed update.
/// Reports arriving inside an open backoff window do not extend it.
fn record_update_failure(agent: &mut AgentState, reason: &str, now: DateTime<Utc>) {
    if reason.contains(SELF_UPDATE_DISABLED_MARKER) {
        agent.self_update_disabled = true;
    }
    agent.update_last_error = Some(reason.to_string());
    if agent.update_next_retry_utc.is_some_and(|at| now < at) {
        return;
    }
    agent.update_attempts += 1;
    let retry_at = now + retry_backoff(agent.update_attempts);
    agent.update_next_retry_utc = Some(retry_at);
    agent.log(
        now,
        format!(
            "update failed (attempt {}): {reason}; next retry at {}",
            agent.update_attempts,
            retry_at.to_rfc3339()
        ),
    );
    warn!(agent_id = %agent.agent_id, attempts = agent.update_attempts, reason, "agent update failed");
}
