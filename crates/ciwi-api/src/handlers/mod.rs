//! Route handlers, one module per resource.

use std::time::Duration;

pub mod agents;
pub mod artifacts;
pub mod jobs;
pub mod pipelines;
pub mod projects;
pub mod server;
pub mod update;
pub mod vault;

/// Delay between answering a request and exiting the process.
pub(crate) const EXIT_DELAY: Duration = Duration::from_millis(250);
