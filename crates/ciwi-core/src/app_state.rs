//! Well-known app-state keys.
//!
//! App state is a flat string map. Update progress is recorded under the
//! `update_` prefix so operators can inspect it through `/update/status`.

pub const UPDATE_PREFIX: &str = "update_";

pub const UPDATE_LAST_CHECK_UTC: &str = "update_last_check_utc";
pub const UPDATE_LATEST_VERSION: &str = "update_latest_version";
pub const UPDATE_AVAILABLE: &str = "update_available";
pub const UPDATE_MESSAGE: &str = "update_message";
pub const UPDATE_LAST_APPLY_UTC: &str = "update_last_apply_utc";
pub const UPDATE_LAST_APPLY_STATUS: &str = "update_last_apply_status";
pub const UPDATE_RELOAD_PROJECTS_PENDING: &str = "update_reload_projects_pending";
/// Synthesized in `/update/status`, never persisted.
pub const UPDATE_CURRENT_VERSION: &str = "update_current_version";

pub fn is_update_key(key: &str) -> bool {
    key.starts_with(UPDATE_PREFIX)
}
