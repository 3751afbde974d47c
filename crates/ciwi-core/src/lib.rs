//! ciwi core
//!
//! Domain types, port traits, and error handling for the ciwi control plane.
//! This crate has minimal dependencies and defines the shared vocabulary
//! used by the persistence, scheduling, update, and HTTP crates.

pub mod agent;
pub mod app_state;
pub mod artifact;
pub mod error;
pub mod events;
pub mod ids;
pub mod job;
pub mod pipeline;
pub mod ports;
pub mod redact;
pub mod vault;
pub mod version;

pub use error::{Error, ErrorKind, Result};
pub use ids::*;
