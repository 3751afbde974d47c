//! Agent registry and job scheduling for ciwi.
//!
//! The registry tracks agents from their heartbeats. The scheduler turns
//! pipeline configs into queued job executions, leases them to matching
//! agents, and ingests their status reports.

pub mod artifacts;
pub mod capabilities;
pub mod dag;
pub mod matrix;
pub mod plan;
pub mod projects;
pub mod registry;
pub mod runs;
pub mod runtime;
pub mod scheduler;
pub mod script;
pub mod source;
pub mod views;

#[cfg(test)]
pub(crate) mod test_support;

pub use plan::{ResolvedSource, RunSelection};
pub use projects::{ImportProjectRequest, LoadConfigRequest, ProjectService};
pub use registry::{AgentRegistry, FreshnessCounts, UpdateRequestResult};
pub use runs::{ResolveProgress, RunOutcome};
pub use runtime::{RuntimeMode, RuntimeState, runtime_state};
pub use scheduler::{RunScriptRequest, RunScriptResponse, Scheduler, StatusUpdateRequest};
pub use source::GitSourceFetcher;
