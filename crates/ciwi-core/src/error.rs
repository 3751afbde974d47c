//! Error types for ciwi.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Input errors
    #[error("{0}")]
    Validation(String),

    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("invalid project config: {0}")]
    InvalidConfig(String),

    // Lookup errors
    #[error("job execution not found: {0}")]
    JobNotFound(String),

    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("project not found: {0}")]
    ProjectNotFound(String),

    #[error("pipeline not found: {0}")]
    PipelineNotFound(String),

    #[error("pipeline chain not found: {0}")]
    PipelineChainNotFound(String),

    #[error("{0} not found")]
    NotFound(String),

    // Conflicts
    #[error("{0}")]
    Conflict(String),

    // External collaborators
    #[error("source fetch failed: {0}")]
    SourceFetch(String),

    #[error("{0}")]
    Upstream(String),

    #[error("checksum mismatch for {asset}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        asset: String,
        expected: String,
        actual: String,
    },

    // Infrastructure errors
    #[error("database error: {0}")]
    Database(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse classification used by the HTTP surface to pick a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Upstream,
    Internal,
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) | Error::InvalidTransition { .. } | Error::InvalidConfig(_) => {
                ErrorKind::Validation
            }
            Error::JobNotFound(_)
            | Error::AgentNotFound(_)
            | Error::ProjectNotFound(_)
            | Error::PipelineNotFound(_)
            | Error::PipelineChainNotFound(_)
            | Error::NotFound(_) => ErrorKind::NotFound,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::SourceFetch(_)
            | Error::Upstream(_)
            | Error::ChecksumMismatch { .. }
            | Error::Network(_) => ErrorKind::Upstream,
            Error::Database(_) | Error::Io(_) | Error::Serialization(_) | Error::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::InvalidConfig(err.to_string())
    }
}
