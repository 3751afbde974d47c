//! Vault connection records.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use ciwi_core::Error;
use ciwi_core::ids::VaultConnectionId;
use ciwi_core::vault::{VaultConnection, VaultConnectionInput};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{ApiResult, api_error};
use crate::extract::{JsonBody, parse_id};
use crate::state::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct ConnectionsResponse {
    pub connections: Vec<VaultConnection>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConnectionResponse {
    pub connection: VaultConnection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteConnectionResponse {
    pub deleted: bool,
    pub id: VaultConnectionId,
}

fn missing(id: VaultConnectionId) -> Error {
    Error::NotFound(format!("vault connection {id}"))
}

pub async fn list_connections(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<ConnectionsResponse>> {
    let connections = state.vault.list().await.map_err(api_error)?;
    Ok(Json(ConnectionsResponse { connections }))
}

pub async fn create_connection(
    State(state): State<Arc<AppState>>,
    JsonBody(input): JsonBody<VaultConnectionInput>,
) -> ApiResult<(StatusCode, Json<ConnectionResponse>)> {
    input.validate().map_err(api_error)?;
    let connection = state.vault.create(&input).await.map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(ConnectionResponse { connection })))
}

pub async fn get_connection(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<ConnectionResponse>> {
    let id = parse_id(&id)?;
    let connection = state
        .vault
        .get(id)
        .await
        .map_err(api_error)?
        .ok_or_else(|| api_error(missing(id)))?;
    Ok(Json(ConnectionResponse { connection }))
}

pub async fn update_connection(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    JsonBody(input): JsonBody<VaultConnectionInput>,
) -> ApiResult<Json<ConnectionResponse>> {
    let id = parse_id(&id)?;
    input.validate().map_err(api_error)?;
    let connection = state
        .vault
        .update(id, &input)
        .await
        .map_err(api_error)?
        .ok_or_else(|| api_error(missing(id)))?;
    Ok(Json(ConnectionResponse { connection }))
}

pub async fn delete_connection(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<DeleteConnectionResponse>> {
    let id = parse_id(&id)?;
    if !state.vault.delete(id).await.map_err(api_error)? {
        return Err(api_error(missing(id)));
    }
    Ok(Json(DeleteConnectionResponse { deleted: true, id }))
}
