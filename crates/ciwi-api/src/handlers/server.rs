//! Server identity, health, runtime mode and restart.

use axum::{Json, extract::State};
use chrono::Utc;
use ciwi_scheduler::{RuntimeState, runtime_state};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use super::EXIT_DELAY;
use crate::state::{AppState, ServerInfo};

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RestartResponse {
    pub restarting: bool,
    pub message: String,
}

pub async fn server_info(State(state): State<Arc<AppState>>) -> Json<ServerInfo> {
    Json(state.info.clone())
}

/// Liveness check.
pub async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

pub async fn runtime(State(state): State<Arc<AppState>>) -> Json<RuntimeState> {
    Json(runtime_state(state.registry(), state.source.as_ref(), Utc::now()).await)
}

pub async fn restart(State(state): State<Arc<AppState>>) -> Json<RestartResponse> {
    info!("server restart requested");
    state.lifecycle.restart_after(EXIT_DELAY);
    Json(RestartResponse {
        restarting: true,
        message: "server is restarting".to_string(),
    })
}
