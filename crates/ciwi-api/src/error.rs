//! Mapping of domain errors onto HTTP responses.

use axum::http::StatusCode;
use ciwi_core::{Error, ErrorKind};
use tracing::{error, warn};

/// Error half of every handler result: a status and a plain-text diagnostic.
pub type ApiError = (StatusCode, String);

pub type ApiResult<T> = Result<T, ApiError>;

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation | ErrorKind::Upstream => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Convert a domain error, logging the ones that are not the caller's fault.
pub fn api_error(err: Error) -> ApiError {
    let status = status_for(err.kind());
    match err.kind() {
        ErrorKind::Internal => error!(error = %err, "request failed"),
        ErrorKind::Upstream => warn!(error = %err, "upstream failure"),
        _ => {}
    }
    (status, err.to_string())
}

pub fn bad_request(message: impl Into<String>) -> ApiError {
    (StatusCode::BAD_REQUEST, message.into())
}

pub fn not_found(message: impl Into<String>) -> ApiError {
    (StatusCode::NOT_FOUND, message.into())
}
