//! Job executions: listing views, creation, status ingestion, events,
//! leasing and retention.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use ciwi_core::events::{JobEvent, JobEventInput};
use ciwi_core::ids::JobExecutionId;
use ciwi_core::job::{JobExecution, LeaseRequest, LeaseResponse, NewJobExecution};
use ciwi_scheduler::StatusUpdateRequest;
use ciwi_scheduler::views::{self, JobView, Page};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{ApiResult, api_error, bad_request};
use crate::extract::JsonBody;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct JobsQuery {
    pub view: Option<String>,
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobsResponse {
    pub job_executions: Vec<JobExecution>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobExecutionResponse {
    pub job_execution: JobExecution,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteJobResponse {
    pub deleted: bool,
    pub job_execution_id: JobExecutionId,
}

#[derive(Debug, Default, Deserialize)]
pub struct AppendEventsRequest {
    #[serde(default)]
    pub events: Vec<JobEventInput>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EventsResponse {
    pub events: Vec<JobEvent>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClearQueueResponse {
    pub cleared: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FlushHistoryResponse {
    pub flushed: usize,
}

/// Every job, or one of the `summary`, `queued` and `history` views. Views
/// are never cached.
pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<JobsQuery>,
) -> ApiResult<Response> {
    let view = match query.view.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(
            JobView::parse(raw).ok_or_else(|| bad_request(format!("unknown view: {raw}")))?,
        ),
    };
    let jobs = state.scheduler.list_jobs().await.map_err(api_error)?;
    let Some(view) = view else {
        return Ok(Json(JobsResponse {
            job_executions: jobs,
        })
        .into_response());
    };

    let page = Page::new(query.offset, query.limit);
    let body = match view {
        JobView::Summary => Json(views::summary(&jobs)).into_response(),
        JobView::Queued => Json(views::queued_page(jobs, page)).into_response(),
        JobView::History => Json(views::history_page(jobs, page)).into_response(),
    };
    Ok(([(header::CACHE_CONTROL, "no-store")], body).into_response())
}

pub async fn create_job(
    State(state): State<Arc<AppState>>,
    JsonBody(req): JsonBody<NewJobExecution>,
) -> ApiResult<(StatusCode, Json<JobExecutionResponse>)> {
    let job_execution = state
        .scheduler
        .create_job(req, Utc::now())
        .await
        .map_err(api_error)?;
    Ok((
        StatusCode::CREATED,
        Json(JobExecutionResponse { job_execution }),
    ))
}

pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<JobExecutionResponse>> {
    let job_execution = state
        .scheduler
        .get_job(&JobExecutionId::from(id))
        .await
        .map_err(api_error)?;
    Ok(Json(JobExecutionResponse { job_execution }))
}

/// Cancel a job that has not been leased yet.
pub async fn delete_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<DeleteJobResponse>> {
    let id = JobExecutionId::from(id);
    state.scheduler.delete_job(&id).await.map_err(api_error)?;
    Ok(Json(DeleteJobResponse {
        deleted: true,
        job_execution_id: id,
    }))
}

pub async fn update_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    JsonBody(req): JsonBody<StatusUpdateRequest>,
) -> ApiResult<Json<JobExecutionResponse>> {
    let job_execution = state
        .scheduler
        .report_status(&JobExecutionId::from(id), req, Utc::now())
        .await
        .map_err(api_error)?;
    Ok(Json(JobExecutionResponse { job_execution }))
}

pub async fn force_fail(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<JobExecutionResponse>> {
    let job_execution = state
        .scheduler
        .force_fail(&JobExecutionId::from(id), Utc::now())
        .await
        .map_err(api_error)?;
    Ok(Json(JobExecutionResponse { job_execution }))
}

pub async fn list_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<EventsResponse>> {
    let events = state
        .scheduler
        .list_events(&JobExecutionId::from(id))
        .await
        .map_err(api_error)?;
    Ok(Json(EventsResponse { events }))
}

pub async fn append_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    JsonBody(req): JsonBody<AppendEventsRequest>,
) -> ApiResult<Json<EventsResponse>> {
    let events = state
        .scheduler
        .append_events(&JobExecutionId::from(id), &req.events, Utc::now())
        .await
        .map_err(api_error)?;
    Ok(Json(EventsResponse { events }))
}

pub async fn clear_queue(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<ClearQueueResponse>> {
    let cleared = state.scheduler.clear_queue().await.map_err(api_error)?;
    Ok(Json(ClearQueueResponse { cleared }))
}

pub async fn flush_history(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<FlushHistoryResponse>> {
    let flushed = state.scheduler.flush_history().await.map_err(api_error)?;
    Ok(Json(FlushHistoryResponse { flushed }))
}

pub async fn lease(
    State(state): State<Arc<AppState>>,
    JsonBody(req): JsonBody<LeaseRequest>,
) -> ApiResult<Json<LeaseResponse>> {
    let response = state
        .scheduler
        .lease(&req, Utc::now())
        .await
        .map_err(api_error)?;
    Ok(Json(response))
}
