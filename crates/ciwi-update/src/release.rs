//! Release feed client (GitHub releases API shape).

use crate::config::UpdateConfig;
use ciwi_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    pub browser_download_url: String,
    #[serde(default)]
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub tag_name: String,
    #[serde(default)]
    pub html_url: String,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

impl Release {
    pub fn asset(&self, name: &str) -> Option<&ReleaseAsset> {
        self.assets.iter().find(|a| a.name == name)
    }
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}

/// Release API client.
pub struct ReleaseClient {
    api_base: String,
    repo: String,
    token: Option<String>,
    metadata_timeout: Duration,
    asset_timeout: Duration,
    checksum_timeout: Duration,
    client: reqwest::Client,
}

impl ReleaseClient {
    pub fn new(config: &UpdateConfig) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("ciwi/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            api_base: config.api_base.trim_end_matches('/').to_string(),
            repo: config.repo.clone(),
            token: config.github_token.clone(),
            metadata_timeout: config.metadata_timeout,
            asset_timeout: config.asset_timeout,
            checksum_timeout: config.checksum_timeout,
            client,
        }
    }

    fn request(&self, url: &str, timeout: Duration) -> reqwest::RequestBuilder {
        let mut request = self.client.get(url).timeout(timeout);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        request
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        debug!(url, "fetching release metadata");
        let response = self
            .request(url, self.metadata_timeout)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("release metadata request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            warn!(url, status = %status, "release metadata request rejected");
            return Err(Error::Upstream(format!(
                "release metadata request failed: {status}"
            )));
        }
        response
            .json()
            .await
            .map_err(|e| Error::Upstream(format!("invalid release metadata: {e}")))
    }

    pub async fn latest(&self) -> Result<Release> {
        self.get_json(&format!("{}/repos/{}/releases/latest", self.api_base, self.repo))
            .await
    }

    pub async fn by_tag(&self, tag: &str) -> Result<Release> {
        self.get_json(&format!(
            "{}/repos/{}/releases/tags/{}",
            self.api_base, self.repo, tag
        ))
        .await
    }

    pub async fn tags(&self) -> Result<Vec<String>> {
        let tags: Vec<TagEntry> = self
            .get_json(&format!("{}/repos/{}/tags", self.api_base, self.repo))
            .await?;
        Ok(tags.into_iter().map(|t| t.name).collect())
    }

    async fn download(&self, url: &str, timeout: Duration) -> Result<Vec<u8>> {
        let response = self
            .request(url, timeout)
            .header("Accept", "application/octet-stream")
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("download failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Upstream(format!("download failed: {status}")));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::Upstream(format!("download failed: {e}")))?;
        Ok(bytes.to_vec())
    }

    pub async fn download_asset(&self, asset: &ReleaseAsset) -> Result<Vec<u8>> {
        self.download(&asset.browser_download_url, self.asset_timeout)
            .await
    }

    pub async fn download_checksums(&self, asset: &ReleaseAsset) -> Result<String> {
        let bytes = self
            .download(&asset.browser_download_url, self.checksum_timeout)
            .await?;
        String::from_utf8(bytes)
            .map_err(|_| Error::Upstream("checksum file is not valid UTF-8".into()))
    }
}
