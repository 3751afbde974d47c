//! Update settings read from the environment.

use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_API_BASE: &str = "https://api.github.com";
pub const DEFAULT_REPO: &str = "izzyreal/ciwi";
pub const DEFAULT_CHECKSUM_ASSET: &str = "ciwi-checksums.txt";
pub const DEFAULT_UPDATER_UNIT: &str = "ciwi-updater.service";

#[derive(Debug, Clone)]
pub struct UpdateConfig {
    pub api_base: String,
    pub repo: String,
    pub checksum_asset: String,
    pub require_checksum: bool,
    pub github_token: Option<String>,
    pub staging_dir: PathBuf,
    pub staged_manifest: PathBuf,
    pub linux_system_updater: bool,
    pub systemctl_path: String,
    pub updater_unit: String,
    pub agent_auto_update: bool,
    /// Binary being replaced. Defaults to the running executable.
    pub executable_path: Option<PathBuf>,
    pub metadata_timeout: Duration,
    pub asset_timeout: Duration,
    pub checksum_timeout: Duration,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        let staging_dir = std::env::temp_dir().join("ciwi-update");
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            repo: DEFAULT_REPO.to_string(),
            checksum_asset: DEFAULT_CHECKSUM_ASSET.to_string(),
            require_checksum: true,
            github_token: None,
            staged_manifest: staging_dir.join("staged.json"),
            staging_dir,
            linux_system_updater: false,
            systemctl_path: "systemctl".to_string(),
            updater_unit: DEFAULT_UPDATER_UNIT.to_string(),
            agent_auto_update: true,
            executable_path: None,
            metadata_timeout: Duration::from_secs(20),
            asset_timeout: Duration::from_secs(120),
            checksum_timeout: Duration::from_secs(30),
        }
    }
}

impl UpdateConfig {
    /// Build from `CIWI_*` environment variables on top of the defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let mut config = Self::default();
        if let Some(v) = get("CIWI_UPDATE_API_BASE") {
            config.api_base = v.trim_end_matches('/').to_string();
        }
        if let Some(v) = get("CIWI_UPDATE_REPO") {
            config.repo = v;
        }
        if let Some(v) = get("CIWI_UPDATE_CHECKSUM_ASSET") {
            config.checksum_asset = v;
        }
        if let Some(v) = get("CIWI_UPDATE_REQUIRE_CHECKSUM") {
            config.require_checksum = !is_false(&v);
        }
        config.github_token = get("CIWI_GITHUB_TOKEN");
        if let Some(v) = get("CIWI_UPDATE_STAGING_DIR") {
            config.staging_dir = PathBuf::from(v);
            config.staged_manifest = config.staging_dir.join("staged.json");
        }
        if let Some(v) = get("CIWI_UPDATE_STAGED_MANIFEST") {
            config.staged_manifest = PathBuf::from(v);
        }
        if let Some(v) = get("CIWI_LINUX_SYSTEM_UPDATER") {
            config.linux_system_updater = is_true(&v);
        }
        if let Some(v) = get("CIWI_SYSTEMCTL_PATH") {
            config.systemctl_path = v;
        }
        if let Some(v) = get("CIWI_UPDATER_UNIT") {
            config.updater_unit = v;
        }
        if let Some(v) = get("CIWI_AGENT_AUTO_UPDATE") {
            config.agent_auto_update = !is_false(&v);
        }
        config
    }
}

fn is_false(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "false" | "0" | "no" | "off")
}

fn is_true(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "on")
}
