//! Agent types.

use crate::version::{is_release_version, is_version_newer};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// Maximum number of entries kept in an agent's recent-log ring.
pub const AGENT_LOG_CAPACITY: usize = 30;

/// Reason reported by agents that cannot replace their own binary.
pub const SELF_UPDATE_DISABLED_MARKER: &str =
    "agent is not running as a service; self-update disabled";

pub const ONLINE_WINDOW_SECS: i64 = 20;
pub const STALE_WINDOW_SECS: i64 = 60;

/// Conventional capability keys.
pub mod caps {
    pub const EXECUTOR: &str = "executor";
    pub const SHELLS: &str = "shells";
    pub const SHELL: &str = "shell";
    pub const OS: &str = "os";
    pub const ARCH: &str = "arch";
    pub const AGENT_ID: &str = "agent_id";
    pub const TOOL_PREFIX: &str = "requires.tool.";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    Online,
    Stale,
    Offline,
}

impl Freshness {
    pub fn classify(last_seen: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Self {
        let Some(last_seen) = last_seen else {
            return Freshness::Offline;
        };
        let age = now - last_seen;
        if age <= Duration::seconds(ONLINE_WINDOW_SECS) {
            Freshness::Online
        } else if age <= Duration::seconds(STALE_WINDOW_SECS) {
            Freshness::Stale
        } else {
            Freshness::Offline
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentLogEntry {
    pub timestamp_utc: DateTime<Utc>,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub agent_id: String,
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub version: String,
    pub capabilities: BTreeMap<String, String>,
    pub last_seen_utc: Option<DateTime<Utc>>,
    pub update_target: String,
    pub update_attempts: u32,
    pub update_last_request_utc: Option<DateTime<Utc>>,
    pub update_next_retry_utc: Option<DateTime<Utc>>,
    pub update_last_error: Option<String>,
    pub tool_refresh_requested: bool,
    pub self_update_disabled: bool,
    pub recent_log: VecDeque<AgentLogEntry>,
}

impl AgentState {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            ..Default::default()
        }
    }

    pub fn log(&mut self, at: DateTime<Utc>, message: impl Into<String>) {
        if self.recent_log.len() == AGENT_LOG_CAPACITY {
            self.recent_log.pop_front();
        }
        self.recent_log.push_back(AgentLogEntry {
            timestamp_utc: at,
            message: message.into(),
        });
    }

    /// Advertised capabilities with the identity fields folded in.
    pub fn effective_capabilities(&self) -> BTreeMap<String, String> {
        let mut caps = BTreeMap::new();
        if !self.os.is_empty() {
            caps.insert(caps::OS.to_string(), self.os.clone());
        }
        if !self.arch.is_empty() {
            caps.insert(caps::ARCH.to_string(), self.arch.clone());
        }
        caps.extend(self.capabilities.clone());
        caps.insert(caps::AGENT_ID.to_string(), self.agent_id.clone());
        caps
    }

    pub fn freshness(&self, now: DateTime<Utc>) -> Freshness {
        Freshness::classify(self.last_seen_utc, now)
    }

    /// True when the server runs a release build newer than this agent.
    pub fn needs_update(&self, server_version: &str) -> bool {
        !self.version.trim().is_empty()
            && is_release_version(server_version)
            && is_version_newer(server_version, &self.version)
    }

    pub fn view(&self, now: DateTime<Utc>, server_version: &str) -> AgentView {
        AgentView {
            agent_id: self.agent_id.clone(),
            hostname: self.hostname.clone(),
            os: self.os.clone(),
            arch: self.arch.clone(),
            version: self.version.clone(),
            capabilities: self.capabilities.clone(),
            last_seen_utc: self.last_seen_utc,
            status: self.freshness(now),
            needs_update: self.needs_update(server_version),
            update_target: self.update_target.clone(),
            update_attempts: self.update_attempts,
            update_last_request_utc: self.update_last_request_utc,
            update_next_retry_utc: self.update_next_retry_utc,
            update_last_error: self.update_last_error.clone(),
            self_update_disabled: self.self_update_disabled,
            recent_log: self.recent_log.iter().cloned().collect(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub agent_id: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub capabilities: BTreeMap<String, String>,
    #[serde(default)]
    pub timestamp_utc: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_failure_reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub accepted: bool,
    pub update_requested: bool,
    pub update_target: String,
    pub refresh_tools_requested: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentView {
    pub agent_id: String,
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub version: String,
    pub capabilities: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen_utc: Option<DateTime<Utc>>,
    pub status: Freshness,
    pub needs_update: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub update_target: String,
    pub update_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_last_request_utc: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_next_retry_utc: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_last_error: Option<String>,
    pub self_update_disabled: bool,
    pub recent_log: Vec<AgentLogEntry>,
}
