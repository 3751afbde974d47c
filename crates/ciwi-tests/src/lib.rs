//! Integration test infrastructure for ciwi.
//!
//! Runs the real router on an ephemeral port over an in-memory SQLite
//! store, with an in-memory git remote standing in for `SourceFetcher`.
//!
//! # Usage
//!
//! ```ignore
//! use ciwi_tests::TestContext;
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let ctx = TestContext::new().await.unwrap();
//!     let resp = ctx.client.get("/api/v1/healthz").await.unwrap();
//! }
//! ```

pub mod context;
pub mod fixtures;
pub mod helpers;
pub mod source;

pub use context::TestContext;
pub use fixtures::*;
pub use helpers::*;
pub use source::FakeSource;

/// Initialize test logging (call once per test binary).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,ciwi_tests=debug")),
        )
        .with_test_writer()
        .try_init();
}
