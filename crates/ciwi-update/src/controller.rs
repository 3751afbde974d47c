//! Server self-update: release check, apply and rollback.
//!
//! Every outcome, including failures, is written to app state under the
//! `update_` keys. Apply and rollback are serialized by `in_progress`; the
//! guard is dropped on every exit path so a failed attempt never wedges it.

use crate::checksum;
use crate::config::UpdateConfig;
use crate::helper;
use crate::mode::{self, UpdateCapability};
use crate::release::{Release, ReleaseClient};
use chrono::Utc;
use ciwi_core::app_state::{
    UPDATE_AVAILABLE, UPDATE_CURRENT_VERSION, UPDATE_LAST_APPLY_STATUS, UPDATE_LAST_APPLY_UTC,
    UPDATE_LAST_CHECK_UTC, UPDATE_LATEST_VERSION, UPDATE_MESSAGE, UPDATE_RELOAD_PROJECTS_PENDING,
    is_update_key,
};
use ciwi_core::ports::AppStateRepository;
use ciwi_core::version::{
    current_platform, expected_asset_name, is_version_different, is_version_newer,
};
use ciwi_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResponse {
    pub current_version: String,
    pub latest_version: String,
    pub update_available: bool,
    pub release_url: String,
    pub asset_name: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyResponse {
    pub updated: bool,
    pub message: String,
    pub target_version: String,
    pub current_version: String,
    pub staged: bool,
}

/// Result of an apply/rollback. When `restart` is set the caller must exit
/// the process shortly after writing the response so the helper can swap
/// the binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub response: ApplyResponse,
    pub restart: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagsResponse {
    pub tags: Vec<String>,
    pub current_version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ApplyKind {
    Upgrade,
    Rollback,
}

impl ApplyKind {
    fn is_noop(self, target: &str, current: &str) -> bool {
        match self {
            ApplyKind::Upgrade => !is_version_newer(target, current),
            ApplyKind::Rollback => !is_version_different(target, current),
        }
    }
}

pub struct UpdateController {
    config: UpdateConfig,
    client: ReleaseClient,
    app_state: Arc<dyn AppStateRepository>,
    in_progress: Mutex<()>,
    current_version: String,
    os: String,
    arch: String,
}

impl UpdateController {
    pub fn new(
        config: UpdateConfig,
        app_state: Arc<dyn AppStateRepository>,
        current_version: impl Into<String>,
    ) -> Self {
        let (os, arch) = current_platform();
        Self {
            client: ReleaseClient::new(&config),
            config,
            app_state,
            in_progress: Mutex::new(()),
            current_version: current_version.into(),
            os,
            arch,
        }
    }

    pub fn config(&self) -> &UpdateConfig {
        &self.config
    }

    pub fn current_version(&self) -> &str {
        &self.current_version
    }

    pub fn agent_auto_update(&self) -> bool {
        self.config.agent_auto_update
    }

    pub fn capability(&self) -> UpdateCapability {
        let exe = self.executable().ok();
        mode::detect(&self.current_version, &self.os, exe.as_deref(), |key| {
            std::env::var(key).ok()
        })
    }

    fn executable(&self) -> Result<PathBuf> {
        match &self.config.executable_path {
            Some(path) => Ok(path.clone()),
            None => Ok(std::env::current_exe()?),
        }
    }

    fn asset_name(&self) -> Result<String> {
        expected_asset_name(&self.os, &self.arch).ok_or_else(|| {
            Error::Upstream(format!("no release asset for {}/{}", self.os, self.arch))
        })
    }

    async fn persist(&self, values: &[(&str, String)]) {
        if let Err(e) = self.app_state.set_many(values).await {
            warn!(error = %e, "failed to persist update state");
        }
    }

    pub async fn check(&self) -> Result<CheckResponse> {
        let result = self.check_release().await;
        let now = Utc::now().to_rfc3339();
        match &result {
            Ok(check) => {
                self.persist(&[
                    (UPDATE_LAST_CHECK_UTC, now),
                    (UPDATE_LATEST_VERSION, check.latest_version.clone()),
                    (UPDATE_AVAILABLE, check.update_available.to_string()),
                    (UPDATE_MESSAGE, check.message.clone()),
                ])
                .await;
            }
            Err(e) => {
                warn!(error = %e, "update check failed");
                self.persist(&[
                    (UPDATE_LAST_CHECK_UTC, now),
                    (UPDATE_AVAILABLE, "false".to_string()),
                    (UPDATE_MESSAGE, format!("update check failed: {e}")),
                ])
                .await;
            }
        }
        result
    }

    async fn check_release(&self) -> Result<CheckResponse> {
        let release = self.client.latest().await?;
        let asset_name = self.asset_name()?;
        if release.asset(&asset_name).is_none() {
            return Err(Error::Upstream(format!(
                "release {} has no asset {asset_name}",
                release.tag_name
            )));
        }
        if self.config.require_checksum && release.asset(&self.config.checksum_asset).is_none() {
            return Err(Error::Upstream(format!(
                "release {} has no checksum asset {}",
                release.tag_name, self.config.checksum_asset
            )));
        }
        let update_available = is_version_newer(&release.tag_name, &self.current_version);
        let message = if update_available {
            format!("update available: {}", release.tag_name)
        } else {
            "server is up to date".to_string()
        };
        info!(latest = %release.tag_name, current = %self.current_version, update_available, "checked for server update");
        Ok(CheckResponse {
            current_version: self.current_version.clone(),
            latest_version: release.tag_name,
            update_available,
            release_url: release.html_url,
            asset_name,
            message,
        })
    }

    /// Update to `target` or to the latest release.
    pub async fn apply(&self, target: Option<&str>) -> Result<ApplyOutcome> {
        let target = target.map(str::trim).filter(|t| !t.is_empty());
        self.guarded(target, ApplyKind::Upgrade).await
    }

    /// Install an explicit `target`, older or newer.
    pub async fn rollback(&self, target: Option<&str>) -> Result<ApplyOutcome> {
        let target = target
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::validation("target_version is required"))?;
        self.guarded(Some(target), ApplyKind::Rollback).await
    }

    async fn guarded(&self, target: Option<&str>, kind: ApplyKind) -> Result<ApplyOutcome> {
        let _guard = self
            .in_progress
            .try_lock()
            .map_err(|_| Error::Conflict("update already in progress".into()))?;

        let result = self.run_apply(target, kind).await;
        let now = Utc::now().to_rfc3339();
        match &result {
            Ok(outcome) => {
                let status = if !outcome.response.updated {
                    "noop"
                } else if outcome.response.staged {
                    "staged"
                } else {
                    "applied"
                };
                self.persist(&[
                    (UPDATE_LAST_APPLY_UTC, now),
                    (UPDATE_LAST_APPLY_STATUS, status.to_string()),
                    (UPDATE_MESSAGE, outcome.response.message.clone()),
                    (UPDATE_LATEST_VERSION, outcome.response.target_version.clone()),
                ])
                .await;
            }
            Err(e) => {
                warn!(error = %e, "update apply failed");
                self.persist(&[
                    (UPDATE_LAST_APPLY_UTC, now),
                    (UPDATE_LAST_APPLY_STATUS, "failed".to_string()),
                    (UPDATE_MESSAGE, format!("update failed: {e}")),
                ])
                .await;
            }
        }
        result
    }

    async fn run_apply(&self, target: Option<&str>, kind: ApplyKind) -> Result<ApplyOutcome> {
        let exe = self.executable()?;
        if mode::looks_like_dev_binary(&exe) {
            return Err(Error::validation(
                "self-update is not supported for development builds",
            ));
        }

        let release = match target {
            Some(tag) => self.client.by_tag(tag).await?,
            None => self.client.latest().await?,
        };
        let target_version = release.tag_name.clone();
        if kind.is_noop(&target_version, &self.current_version) {
            return Ok(ApplyOutcome {
                response: ApplyResponse {
                    updated: false,
                    message: format!("already at {}", self.current_version),
                    target_version,
                    current_version: self.current_version.clone(),
                    staged: false,
                },
                restart: false,
            });
        }

        let (downloaded, sha256) = self.download_verified(&release).await?;

        let staged = self.os == "linux" && self.config.linux_system_updater;
        if staged {
            helper::stage_for_system_updater(
                &self.config,
                &target_version,
                &downloaded,
                &exe,
                &sha256,
            )
            .await?;
        } else {
            let args: Vec<String> = std::env::args().skip(1).collect();
            helper::launch_helper(&exe, &downloaded, args).await?;
        }
        self.persist(&[(UPDATE_RELOAD_PROJECTS_PENDING, "1".to_string())])
            .await;

        let message = if staged {
            format!("staged {target_version} for {}", self.config.updater_unit)
        } else {
            format!("updating to {target_version}; restarting")
        };
        info!(target = %target_version, staged, "server update applied");
        Ok(ApplyOutcome {
            response: ApplyResponse {
                updated: true,
                message,
                target_version,
                current_version: self.current_version.clone(),
                staged,
            },
            restart: !staged,
        })
    }

    async fn download_verified(&self, release: &Release) -> Result<(PathBuf, String)> {
        let asset_name = self.asset_name()?;
        let asset = release.asset(&asset_name).ok_or_else(|| {
            Error::Upstream(format!(
                "release {} has no asset {asset_name}",
                release.tag_name
            ))
        })?;
        let data = self.client.download_asset(asset).await?;

        let sha256 = match release.asset(&self.config.checksum_asset) {
            Some(checksums) => {
                let text = self.client.download_checksums(checksums).await?;
                checksum::verify(&asset_name, &data, &text)?
            }
            None if self.config.require_checksum => {
                return Err(Error::Upstream(format!(
                    "release {} has no checksum asset {}",
                    release.tag_name, self.config.checksum_asset
                )));
            }
            None => checksum::sha256_hex(&data),
        };

        let path = std::env::temp_dir().join(format!(
            "ciwi-{}-{}",
            release.tag_name,
            std::process::id()
        ));
        tokio::fs::write(&path, &data).await?;
        Ok((path, sha256))
    }

    /// Release tags with the running version first.
    pub async fn tags(&self) -> Result<TagsResponse> {
        let mut tags = vec![self.current_version.clone()];
        tags.extend(
            self.client
                .tags()
                .await?
                .into_iter()
                .filter(|t| *t != self.current_version),
        );
        Ok(TagsResponse {
            tags,
            current_version: self.current_version.clone(),
        })
    }

    /// Persisted `update_` keys plus the live running version.
    pub async fn status(&self) -> Result<BTreeMap<String, String>> {
        let mut status: BTreeMap<String, String> = self
            .app_state
            .list()
            .await?
            .into_iter()
            .filter(|(k, _)| is_update_key(k))
            .collect();
        status.insert(
            UPDATE_CURRENT_VERSION.to_string(),
            self.current_version.clone(),
        );
        Ok(status)
    }

    /// Whether a post-update project reload is pending.
    pub async fn reload_pending(&self) -> Result<bool> {
        Ok(self
            .app_state
            .get(UPDATE_RELOAD_PROJECTS_PENDING)
            .await?
            .is_some_and(|v| v == "1"))
    }

    pub async fn clear_reload_pending(&self) -> Result<()> {
        self.app_state
            .set(UPDATE_RELOAD_PROJECTS_PENDING, "0")
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Default)]
    struct MemoryAppState {
        values: std::sync::Mutex<BTreeMap<String, String>>,
    }

    #[async_trait]
    impl AppStateRepository for MemoryAppState {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            Ok(self.values.lock().unwrap().get(key).cloned())
        }

        async fn set(&self, key: &str, value: &str) -> Result<()> {
            self.values
                .lock()
                .unwrap()
                .insert(key.to_string(), value.to_string());
            Ok(())
        }

        async fn set_many(&self, values: &[(&str, String)]) -> Result<()> {
            let mut map = self.values.lock().unwrap();
            for (k, v) in values {
                map.insert(k.to_string(), v.clone());
            }
            Ok(())
        }

        async fn list(&self) -> Result<BTreeMap<String, String>> {
            Ok(self.values.lock().unwrap().clone())
        }
    }

    fn asset_name() -> String {
        let (os, arch) = current_platform();
        expected_asset_name(&os, &arch).unwrap()
    }

    fn release_body(server: &MockServer, tag: &str, with_checksums: bool) -> serde_json::Value {
        let mut assets = vec![serde_json::json!({
            "name": asset_name(),
            "browser_download_url": format!("{}/download/bin", server.uri()),
        })];
        if with_checksums {
            assets.push(serde_json::json!({
                "name": "ciwi-checksums.txt",
                "browser_download_url": format!("{}/download/sums", server.uri()),
            }));
        }
        serde_json::json!({
            "tag_name": tag,
            "html_url": format!("https://example.com/releases/{tag}"),
            "assets": assets,
        })
    }

    fn controller(server: &MockServer, state: Arc<MemoryAppState>, version: &str) -> UpdateController {
        let config = UpdateConfig {
            api_base: server.uri(),
            repo: "acme/ciwi".into(),
            executable_path: Some(PathBuf::from("/opt/ciwi/bin/ciwi")),
            ..Default::default()
        };
        UpdateController::new(config, state, version)
    }

    #[tokio::test]
    async fn test_check_reports_and_persists() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/ciwi/releases/latest"))
            .respond_with(ResponseTemplate::new(200).set_body_json(release_body(&server, "v1.3.0", true)))
            .mount(&server)
            .await;

        let state = Arc::new(MemoryAppState::default());
        let uc = controller(&server, state.clone(), "v1.2.0");
        let check = uc.check().await.unwrap();
        assert!(check.update_available);
        assert_eq!(check.latest_version, "v1.3.0");
        assert_eq!(check.asset_name, asset_name());

        let status = uc.status().await.unwrap();
        assert_eq!(status[UPDATE_AVAILABLE], "true");
        assert_eq!(status[UPDATE_LATEST_VERSION], "v1.3.0");
        assert_eq!(status[UPDATE_CURRENT_VERSION], "v1.2.0");
        assert!(status.contains_key(UPDATE_LAST_CHECK_UTC));
    }

    #[tokio::test]
    async fn test_check_requires_checksum_asset() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/ciwi/releases/latest"))
            .respond_with(ResponseTemplate::new(200).set_body_json(release_body(&server, "v1.3.0", false)))
            .mount(&server)
            .await;

        let state = Arc::new(MemoryAppState::default());
        let uc = controller(&server, state.clone(), "v1.2.0");
        let err = uc.check().await.unwrap_err();
        assert_eq!(err.kind(), ciwi_core::ErrorKind::Upstream);
        let message = state.get(UPDATE_MESSAGE).await.unwrap().unwrap();
        assert!(message.contains("checksum"));
    }

    #[tokio::test]
    async fn test_apply_noop_when_current() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/ciwi/releases/latest"))
            .respond_with(ResponseTemplate::new(200).set_body_json(release_body(&server, "v1.2.0", true)))
            .mount(&server)
            .await;

        let state = Arc::new(MemoryAppState::default());
        let uc = controller(&server, state.clone(), "v1.2.0");
        let outcome = uc.apply(None).await.unwrap();
        assert!(!outcome.response.updated);
        assert!(!outcome.restart);
        assert_eq!(
            state.get(UPDATE_LAST_APPLY_STATUS).await.unwrap().as_deref(),
            Some("noop")
        );
    }

    #[tokio::test]
    async fn test_apply_checksum_mismatch_fails_and_releases_guard() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/ciwi/releases/tags/v2.0.0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(release_body(&server, "v2.0.0", true)))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/download/bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"binary".to_vec()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/download/sums"))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!(
                "{}  {}\n",
                "0".repeat(64),
                asset_name()
            )))
            .mount(&server)
            .await;

        let state = Arc::new(MemoryAppState::default());
        let uc = controller(&server, state.clone(), "v1.0.0");
        let err = uc.apply(Some("v2.0.0")).await.unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }));
        assert_eq!(
            state.get(UPDATE_LAST_APPLY_STATUS).await.unwrap().as_deref(),
            Some("failed")
        );
        assert!(uc.in_progress.try_lock().is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_apply_conflicts() {
        let server = MockServer::start().await;
        let state = Arc::new(MemoryAppState::default());
        let uc = controller(&server, state, "v1.0.0");
        let _held = uc.in_progress.lock().await;
        let err = uc.apply(None).await.unwrap_err();
        assert_eq!(err.kind(), ciwi_core::ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_rollback_requires_target_and_rejects_dev_binary() {
        let server = MockServer::start().await;
        let state = Arc::new(MemoryAppState::default());
        let uc = controller(&server, state.clone(), "v1.0.0");
        let err = uc.rollback(Some("  ")).await.unwrap_err();
        assert_eq!(err.kind(), ciwi_core::ErrorKind::Validation);

        let config = UpdateConfig {
            api_base: server.uri(),
            executable_path: Some(PathBuf::from("/home/me/ciwi/target/debug/ciwi")),
            ..Default::default()
        };
        let uc = UpdateController::new(config, state, "v1.0.0");
        let err = uc.rollback(Some("v0.9.0")).await.unwrap_err();
        assert_eq!(err.kind(), ciwi_core::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_tags_prepend_current() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/ciwi/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!([{"name": "v1.1.0"}, {"name": "v1.0.0"}]),
            ))
            .mount(&server)
            .await;
        let uc = controller(&server, Arc::new(MemoryAppState::default()), "v1.0.0");
        let tags = uc.tags().await.unwrap();
        assert_eq!(tags.tags, vec!["v1.0.0", "v1.1.0"]);
        assert_eq!(tags.current_version, "v1.0.0");
    }

    #[tokio::test]
    async fn test_reload_pending_flag() {
        let server = MockServer::start().await;
        let state = Arc::new(MemoryAppState::default());
        let uc = controller(&server, state.clone(), "v1.0.0");
        assert!(!uc.reload_pending().await.unwrap());
        state.set(UPDATE_RELOAD_PROJECTS_PENDING, "1").await.unwrap();
        assert!(uc.reload_pending().await.unwrap());
        uc.clear_reload_pending().await.unwrap();
        assert!(!uc.reload_pending().await.unwrap());
    }
}
