//! Project config loading, import, reload and icons.

use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use ciwi_core::pipeline::{Project, ProjectDetail};
use ciwi_scheduler::{ImportProjectRequest, LoadConfigRequest};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::error::{ApiResult, api_error, not_found};
use crate::extract::{JsonBody, parse_id};
use crate::state::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct ProjectsResponse {
    pub projects: Vec<Project>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProjectResponse {
    pub project: ProjectDetail,
}

pub async fn load_config(
    State(state): State<Arc<AppState>>,
    JsonBody(req): JsonBody<LoadConfigRequest>,
) -> ApiResult<Json<ProjectResponse>> {
    let project = state.projects.load_from_file(&req).await.map_err(api_error)?;
    Ok(Json(ProjectResponse { project }))
}

pub async fn list_projects(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<ProjectsResponse>> {
    let projects = state.projects.list().await.map_err(api_error)?;
    Ok(Json(ProjectsResponse { projects }))
}

pub async fn get_project(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<ProjectResponse>> {
    let project = state.projects.get(parse_id(&id)?).await.map_err(api_error)?;
    Ok(Json(ProjectResponse { project }))
}

pub async fn import_project(
    State(state): State<Arc<AppState>>,
    JsonBody(req): JsonBody<ImportProjectRequest>,
) -> ApiResult<Json<ProjectResponse>> {
    let project = state.projects.import(&req).await.map_err(api_error)?;
    Ok(Json(ProjectResponse { project }))
}

pub async fn reload_project(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<ProjectResponse>> {
    let project = state.projects.reload(parse_id(&id)?).await.map_err(api_error)?;
    Ok(Json(ProjectResponse { project }))
}

fn etag_for(bytes: &[u8]) -> String {
    format!("\"{}\"", hex::encode(Sha256::digest(bytes)))
}

fn etag_matches(headers: &HeaderMap, etag: &str) -> bool {
    headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.split(',').any(|tag| {
            let tag = tag.trim();
            tag == "*" || tag.trim_start_matches("W/") == etag
        }))
}

/// Icon bytes with a content hash `ETag`; a matching `If-None-Match`
/// answers 304.
pub async fn project_icon(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let id = parse_id(&id)?;
    let icon = state
        .registry()
        .icon(id)
        .await
        .ok_or_else(|| not_found(format!("no icon for project {id}")))?;
    let etag = etag_for(&icon.bytes);
    let etag_header = HeaderValue::from_str(&etag).map_err(|e| {
        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?;

    if etag_matches(&headers, &etag) {
        return Ok((StatusCode::NOT_MODIFIED, [(header::ETAG, etag_header)]).into_response());
    }
    let content_type = HeaderValue::from_str(&icon.content_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    Ok((
        [
            (header::CONTENT_TYPE, content_type),
            (header::ETAG, etag_header),
            (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
        ],
        icon.bytes,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_etag_matching() {
        let etag = etag_for(b"png");
        assert!(etag.starts_with('"') && etag.ends_with('"'));
        assert_eq!(etag.len(), 66);

        let mut headers = HeaderMap::new();
        assert!(!etag_matches(&headers, &etag));
        headers.insert(header::IF_NONE_MATCH, HeaderValue::from_str(&etag).unwrap());
        assert!(etag_matches(&headers, &etag));
        headers.insert(
            header::IF_NONE_MATCH,
            HeaderValue::from_static("\"other\", W/\"x\""),
        );
        assert!(!etag_matches(&headers, &etag));
    }
}
