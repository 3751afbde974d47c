//! Server self-update endpoints.

use axum::{Json, extract::State};
use ciwi_update::{ApplyOutcome, ApplyResponse, CheckResponse, TagsResponse};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use super::EXIT_DELAY;
use crate::error::{ApiResult, api_error};
use crate::extract::OptionalJson;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct ApplyRequest {
    #[serde(default)]
    pub target_version: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateStatusResponse {
    pub status: BTreeMap<String, String>,
}

pub async fn check(State(state): State<Arc<AppState>>) -> ApiResult<Json<CheckResponse>> {
    let response = state.updates.check().await.map_err(api_error)?;
    Ok(Json(response))
}

fn finish(state: &AppState, outcome: ApplyOutcome) -> Json<ApplyResponse> {
    if outcome.restart {
        info!(target = %outcome.response.target_version, "exiting for update helper");
        state.lifecycle.exit_after(EXIT_DELAY);
    }
    Json(outcome.response)
}

pub async fn apply(
    State(state): State<Arc<AppState>>,
    OptionalJson(req): OptionalJson<ApplyRequest>,
) -> ApiResult<Json<ApplyResponse>> {
    let outcome = state
        .updates
        .apply(Some(req.target_version.as_str()))
        .await
        .map_err(api_error)?;
    Ok(finish(&state, outcome))
}

pub async fn rollback(
    State(state): State<Arc<AppState>>,
    OptionalJson(req): OptionalJson<ApplyRequest>,
) -> ApiResult<Json<ApplyResponse>> {
    let outcome = state
        .updates
        .rollback(Some(req.target_version.as_str()))
        .await
        .map_err(api_error)?;
    Ok(finish(&state, outcome))
}

pub async fn tags(State(state): State<Arc<AppState>>) -> ApiResult<Json<TagsResponse>> {
    let response = state.updates.tags().await.map_err(api_error)?;
    Ok(Json(response))
}

pub async fn status(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<UpdateStatusResponse>> {
    let status = state.updates.status().await.map_err(api_error)?;
    Ok(Json(UpdateStatusResponse { status }))
}
