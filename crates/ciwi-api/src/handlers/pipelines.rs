//! Pipeline and chain runs, version resolution and source refs.

use axum::{
    Json,
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
};
use chrono::Utc;
use ciwi_core::ids::{JobExecutionId, PipelineRunId};
use ciwi_core::ports::SourceRefs;
use ciwi_core::{ErrorKind, Result};
use ciwi_scheduler::{ResolvedSource, RunOutcome, RunSelection};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::{ApiResult, api_error};
use crate::extract::{JsonBody, OptionalJson, parse_id};
use crate::state::AppState;

/// Body of `POST /pipelines/{id}/run`.
#[derive(Debug, Default, Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RunResponse {
    pub enqueued: usize,
    pub job_ids: Vec<JobExecutionId>,
    pub job_execution_ids: Vec<JobExecutionId>,
    pub pipeline_run_id: PipelineRunId,
}

impl From<RunOutcome> for RunResponse {
    fn from(outcome: RunOutcome) -> Self {
        Self {
            enqueued: outcome.job_execution_ids.len(),
            job_ids: outcome.job_execution_ids.clone(),
            job_execution_ids: outcome.job_execution_ids,
            pipeline_run_id: outcome.pipeline_run_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionPreviewResponse {
    pub ok: bool,
    pub pipeline_version: String,
    pub message: String,
}

impl VersionPreviewResponse {
    fn from_result(result: Result<ResolvedSource>) -> Self {
        match result {
            Ok(resolved) => {
                let message = match &resolved.version {
                    Some(_) => "version resolved".to_string(),
                    None => "pipeline has no versioning".to_string(),
                };
                Self {
                    ok: true,
                    pipeline_version: resolved.version.unwrap_or_default(),
                    message,
                }
            }
            Err(err) => Self {
                ok: false,
                pipeline_version: String::new(),
                message: err.to_string(),
            },
        }
    }
}

pub async fn run_pipeline(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    OptionalJson(req): OptionalJson<RunRequest>,
) -> ApiResult<Json<RunResponse>> {
    let selection = RunSelection {
        dry_run: req.dry_run,
        ..Default::default()
    };
    let outcome = state
        .scheduler
        .run_pipeline(parse_id(&id)?, &selection, Utc::now())
        .await
        .map_err(api_error)?;
    Ok(Json(outcome.into()))
}

pub async fn run_selection(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    JsonBody(selection): JsonBody<RunSelection>,
) -> ApiResult<Json<RunResponse>> {
    let outcome = state
        .scheduler
        .run_pipeline(parse_id(&id)?, &selection, Utc::now())
        .await
        .map_err(api_error)?;
    Ok(Json(outcome.into()))
}

pub async fn run_chain(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    OptionalJson(selection): OptionalJson<RunSelection>,
) -> ApiResult<Json<RunResponse>> {
    let outcome = state
        .scheduler
        .run_chain(parse_id(&id)?, &selection, Utc::now())
        .await
        .map_err(api_error)?;
    Ok(Json(outcome.into()))
}

/// Resolution failures are reported in the body; only an unknown pipeline
/// is an HTTP error.
pub async fn version_preview(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<VersionPreviewResponse>> {
    match state.scheduler.resolve_version(parse_id(&id)?, None).await {
        Err(err) if err.kind() == ErrorKind::NotFound => Err(api_error(err)),
        result => Ok(Json(VersionPreviewResponse::from_result(result))),
    }
}

/// Stream resolution progress as `step` events followed by one `done`
/// event carrying the preview.
pub async fn version_resolve(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let id = parse_id(&id)?;
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let scheduler = state.scheduler.clone();
    let task = tokio::spawn(async move { scheduler.resolve_version(id, Some(&tx)).await });

    let stream = async_stream::stream! {
        while let Some(message) = rx.recv().await {
            yield Ok(Event::default().event("step").data(message));
        }
        let preview = match task.await {
            Ok(result) => VersionPreviewResponse::from_result(result),
            Err(err) => VersionPreviewResponse {
                ok: false,
                pipeline_version: String::new(),
                message: format!("version resolution aborted: {err}"),
            },
        };
        let data = serde_json::to_string(&preview).unwrap_or_default();
        yield Ok(Event::default().event("done").data(data));
    };
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

pub async fn source_refs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<SourceRefs>> {
    let refs = state
        .scheduler
        .source_refs(parse_id(&id)?)
        .await
        .map_err(api_error)?;
    Ok(Json(refs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ciwi_core::Error;

    #[test]
    fn test_run_response_mirrors_ids() {
        let ids = vec![JobExecutionId::from("job-a"), JobExecutionId::from("job-b")];
        let response: RunResponse = RunOutcome {
            pipeline_run_id: PipelineRunId::from("run-1"),
            job_execution_ids: ids.clone(),
        }
        .into();
        assert_eq!(response.enqueued, 2);
        assert_eq!(response.job_ids, ids);
        assert_eq!(response.job_execution_ids, ids);
    }

    #[test]
    fn test_preview_from_result() {
        let ok = VersionPreviewResponse::from_result(Ok(ResolvedSource {
            source: None,
            version: Some("v1.2.3".into()),
        }));
        assert!(ok.ok);
        assert_eq!(ok.pipeline_version, "v1.2.3");

        let failed = VersionPreviewResponse::from_result(Err(Error::validation(
            "dependency pipeline \"build\" has not succeeded",
        )));
        assert!(!failed.ok);
        assert!(failed.message.contains("has not succeeded"));
    }
}
