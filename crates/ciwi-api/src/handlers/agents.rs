//! Agent heartbeats and operator actions on agents.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use chrono::Utc;
use ciwi_core::Error;
use ciwi_core::agent::{AgentView, HeartbeatRequest, HeartbeatResponse};
use ciwi_scheduler::{RunScriptRequest, RunScriptResponse, UpdateRequestResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{ApiResult, api_error};
use crate::extract::{JsonBody, OptionalJson};
use crate::state::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct AgentsResponse {
    pub agents: Vec<AgentView>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AgentResponse {
    pub agent: AgentView,
}

#[derive(Debug, Default, Deserialize)]
pub struct AgentUpdateRequest {
    #[serde(default)]
    pub target_version: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RefreshToolsResponse {
    pub requested: bool,
    pub agent_id: String,
    pub message: String,
}

pub async fn heartbeat(
    State(state): State<Arc<AppState>>,
    JsonBody(req): JsonBody<HeartbeatRequest>,
) -> ApiResult<Json<HeartbeatResponse>> {
    let response = state
        .registry()
        .heartbeat(req, Utc::now())
        .await
        .map_err(api_error)?;
    Ok(Json(response))
}

pub async fn list_agents(State(state): State<Arc<AppState>>) -> Json<AgentsResponse> {
    Json(AgentsResponse {
        agents: state.registry().views(Utc::now()).await,
    })
}

pub async fn get_agent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<AgentResponse>> {
    let agent = state
        .registry()
        .view(&id, Utc::now())
        .await
        .ok_or_else(|| api_error(Error::AgentNotFound(id)))?;
    Ok(Json(AgentResponse { agent }))
}

pub async fn request_update(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    OptionalJson(req): OptionalJson<AgentUpdateRequest>,
) -> ApiResult<Json<UpdateRequestResult>> {
    let result = state
        .registry()
        .request_update(&id, Some(req.target_version.as_str()), Utc::now())
        .await
        .map_err(api_error)?;
    Ok(Json(result))
}

pub async fn refresh_tools(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<RefreshToolsResponse>> {
    state
        .registry()
        .refresh_tools(&id, Utc::now())
        .await
        .map_err(api_error)?;
    Ok(Json(RefreshToolsResponse {
        requested: true,
        agent_id: id,
        message: "tool refresh requested".to_string(),
    }))
}

pub async fn run_script(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    JsonBody(req): JsonBody<RunScriptRequest>,
) -> ApiResult<(StatusCode, Json<RunScriptResponse>)> {
    let response = state
        .scheduler
        .run_script(&id, req, Utc::now())
        .await
        .map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(response)))
}
