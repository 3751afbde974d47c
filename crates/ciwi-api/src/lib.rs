//! HTTP API for the ciwi control plane.
//!
//! Every route lives under `/api/v1` except artifact downloads, which are
//! served from `/artifacts/{job_id}/{*path}` so artifact URLs stay short.

pub mod error;
pub mod extract;
pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod state;

pub use routes::create_router;
pub use state::{AppState, ServerInfo, ServerLifecycle};
