//! Self-update controller for ciwi.
//!
//! Checks the release feed, downloads and verifies the platform asset, then
//! either stages it for a system updater unit or hands off to the
//! `update-helper` subcommand. Also owns the policy that decides when agents
//! are asked to update themselves.

pub mod checksum;
pub mod config;
pub mod controller;
pub mod helper;
pub mod mode;
pub mod policy;
pub mod release;

pub use config::UpdateConfig;
pub use controller::{ApplyOutcome, ApplyResponse, CheckResponse, TagsResponse, UpdateController};
pub use mode::{ServiceMode, UpdateCapability};
pub use policy::{retry_backoff, should_request_agent_update};
pub use release::{Release, ReleaseAsset, ReleaseClient};
