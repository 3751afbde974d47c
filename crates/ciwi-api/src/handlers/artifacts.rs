//! Artifact uploads, downloads, bundles and test reports.

use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderValue, header},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use ciwi_core::artifact::{
    Artifact, StoredTestReport, UploadArtifactsRequest, UploadTestReportRequest, content_type_for,
};
use ciwi_core::ids::JobExecutionId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{ApiResult, api_error};
use crate::extract::JsonBody;
use crate::state::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct ArtifactsResponse {
    pub artifacts: Vec<Artifact>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TestReportResponse {
    pub report: StoredTestReport,
}

pub async fn list_artifacts(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<ArtifactsResponse>> {
    let artifacts = state
        .scheduler
        .list_artifacts(&JobExecutionId::from(id))
        .await
        .map_err(api_error)?;
    Ok(Json(ArtifactsResponse { artifacts }))
}

pub async fn upload_artifacts(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    JsonBody(req): JsonBody<UploadArtifactsRequest>,
) -> ApiResult<Json<ArtifactsResponse>> {
    let artifacts = state
        .scheduler
        .upload_artifacts(&JobExecutionId::from(id), req)
        .await
        .map_err(api_error)?;
    Ok(Json(ArtifactsResponse { artifacts }))
}

/// Zip of every artifact, paths sorted.
pub async fn download_all(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let id = JobExecutionId::from(id);
    let bundle = state.scheduler.artifact_bundle(&id).await.map_err(api_error)?;
    let disposition = HeaderValue::from_str(&format!("attachment; filename=\"{id}-artifacts.zip\""))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment; filename=\"artifacts.zip\""));
    Ok((
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("application/zip")),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bundle,
    )
        .into_response())
}

/// Raw artifact file behind an artifact `url`.
pub async fn serve_artifact(
    State(state): State<Arc<AppState>>,
    Path((job_id, path)): Path<(String, String)>,
) -> ApiResult<Response> {
    let (artifact, body) = state
        .scheduler
        .read_artifact(&JobExecutionId::from(job_id), &path)
        .await
        .map_err(api_error)?;
    Ok((
        [(header::CONTENT_TYPE, content_type_for(&artifact.path))],
        body,
    )
        .into_response())
}

pub async fn get_test_report(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<TestReportResponse>> {
    let report = state
        .scheduler
        .test_report(&JobExecutionId::from(id))
        .await
        .map_err(api_error)?;
    Ok(Json(TestReportResponse { report }))
}

pub async fn upload_test_report(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    JsonBody(req): JsonBody<UploadTestReportRequest>,
) -> ApiResult<Json<TestReportResponse>> {
    let report = state
        .scheduler
        .upload_test_report(&JobExecutionId::from(id), req, Utc::now())
        .await
        .map_err(api_error)?;
    Ok(Json(TestReportResponse { report }))
}
