//! Repository implementations for SQLite.

mod app_state;
mod artifact;
mod job;
mod project;
mod vault;

pub use app_state::SqliteAppStateRepository;
pub use artifact::SqliteArtifactRepository;
pub use job::SqliteJobRepository;
pub use project::SqliteProjectRepository;
pub use vault::SqliteVaultRepository;
