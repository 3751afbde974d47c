//! Loading project configs from disk or from their repositories.

use crate::dag::DagBuilder;
use crate::registry::AgentRegistry;
use ciwi_core::ids::ProjectId;
use ciwi_core::pipeline::{
    ConfigOrigin, DEFAULT_CONFIG_FILE, Project, ProjectConfigFile, ProjectDetail,
};
use ciwi_core::ports::{ProjectRepository, SourceFetcher};
use ciwi_core::{Error, Result};
use ciwi_update::UpdateController;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Per-project deadline when warming icons at startup.
pub const ICON_WARM_TIMEOUT: Duration = Duration::from_secs(120);

/// Body of `POST /config/load`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadConfigRequest {
    #[serde(default, alias = "config_path")]
    pub path: String,
}

/// Body of `POST /projects/import`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportProjectRequest {
    #[serde(default)]
    pub repo_url: String,
    #[serde(default)]
    pub repo_ref: String,
    #[serde(default)]
    pub config_file: String,
}

pub struct ProjectService {
    projects: Arc<dyn ProjectRepository>,
    source: Arc<dyn SourceFetcher>,
    registry: Arc<AgentRegistry>,
    config_dir: PathBuf,
}

impl ProjectService {
    pub fn new(
        projects: Arc<dyn ProjectRepository>,
        source: Arc<dyn SourceFetcher>,
        registry: Arc<AgentRegistry>,
        config_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            projects,
            source,
            registry,
            config_dir: config_dir.into(),
        }
    }

    pub async fn list(&self) -> Result<Vec<Project>> {
        self.projects.list_projects().await
    }

    pub async fn get(&self, id: ProjectId) -> Result<ProjectDetail> {
        self.projects
            .get_project(id)
            .await?
            .ok_or_else(|| Error::ProjectNotFound(id.to_string()))
    }

    /// Load a config file below the configured config directory.
    pub async fn load_from_file(&self, req: &LoadConfigRequest) -> Result<ProjectDetail> {
        let rel = relative_path(&req.path)?;
        let path = self.config_dir.join(rel);
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| Error::validation(format!("cannot read {}: {e}", rel.display())))?;
        let origin = ConfigOrigin {
            origin_key: format!("file:{}", rel.display()),
            config_file: rel.display().to_string(),
            ..Default::default()
        };
        self.store(&content, &origin).await
    }

    /// Clone a repository and load its config.
    pub async fn import(&self, req: &ImportProjectRequest) -> Result<ProjectDetail> {
        let repo_url = req.repo_url.trim();
        if repo_url.is_empty() {
            return Err(Error::validation("repo_url is required"));
        }
        let config_file = match req.config_file.trim() {
            "" => DEFAULT_CONFIG_FILE,
            other => other,
        };
        self.fetch_and_store(repo_url, req.repo_ref.trim(), config_file)
            .await
    }

    /// Re-fetch a repository-backed project.
    pub async fn reload(&self, id: ProjectId) -> Result<ProjectDetail> {
        let project = self.get(id).await?.project;
        if !project.is_repo_backed() {
            return Err(Error::validation(format!(
                "project \"{}\" was not imported from a repository",
                project.name
            )));
        }
        self.fetch_and_store(&project.repo_url, &project.repo_ref, &project.config_file)
            .await
    }

    async fn fetch_and_store(
        &self,
        repo_url: &str,
        repo_ref: &str,
        config_file: &str,
    ) -> Result<ProjectDetail> {
        let fetched = self
            .source
            .fetch_project_config(repo_url, repo_ref, config_file)
            .await?;
        let origin = ConfigOrigin {
            origin_key: format!("{repo_url}#{config_file}"),
            repo_url: repo_url.to_string(),
            repo_ref: repo_ref.to_string(),
            config_file: config_file.to_string(),
            source_commit: fetched.source_commit.clone(),
        };
        let detail = self.store(&fetched.config_content, &origin).await?;
        self.registry.set_icon(detail.project.id, fetched.icon).await;
        Ok(detail)
    }

    async fn store(&self, content: &str, origin: &ConfigOrigin) -> Result<ProjectDetail> {
        let config = ProjectConfigFile::parse(content)?;
        let dags = DagBuilder::new();
        for pipeline in &config.project.pipelines {
            dags.build(&pipeline.jobs)?;
        }
        let detail = self.projects.load_config(&config.project, origin).await?;
        info!(
            project_id = detail.project.id,
            project = %detail.project.name,
            pipelines = detail.pipelines.len(),
            origin = %origin.origin_key,
            "project config loaded"
        );
        Ok(detail)
    }

    /// Fetch icons of every repository-backed project. Failures are logged.
    pub async fn warm_icons(&self) -> Result<usize> {
        let mut warmed = 0;
        for project in self.projects.list_projects().await? {
            if !project.is_repo_backed() {
                continue;
            }
            let fetch = self.source.fetch_project_config(
                &project.repo_url,
                &project.repo_ref,
                &project.config_file,
            );
            match tokio::time::timeout(ICON_WARM_TIMEOUT, fetch).await {
                Ok(Ok(fetched)) => {
                    if fetched.icon.is_some() {
                        warmed += 1;
                    }
                    self.registry.set_icon(project.id, fetched.icon).await;
                }
                Ok(Err(err)) => {
                    warn!(project = %project.name, error = %err, "icon warmup failed")
                }
                Err(_) => warn!(project = %project.name, "icon warmup timed out"),
            }
        }
        Ok(warmed)
    }

    /// Reload every repository-backed project when an update left the reload
    /// flag set. The flag is cleared only if every reload succeeded.
    pub async fn reload_after_update(&self, updates: &UpdateController) -> Result<usize> {
        if !updates.reload_pending().await? {
            return Ok(0);
        }
        let mut reloaded = 0;
        let mut failed = 0;
        for project in self.projects.list_projects().await? {
            if !project.is_repo_backed() {
                continue;
            }
            match self.reload(project.id).await {
                Ok(_) => reloaded += 1,
                Err(err) => {
                    failed += 1;
                    warn!(project = %project.name, error = %err, "post-update reload failed");
                }
            }
        }
        if failed == 0 {
            updates.clear_reload_pending().await?;
        }
        info!(reloaded, failed, "post-update project reload finished");
        Ok(reloaded)
    }
}

/// A path relative to the config directory with no parent components.
fn relative_path(raw: &str) -> Result<&Path> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(Error::validation("path is required"));
    }
    let path = Path::new(raw);
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(Error::validation(format!(
            "config path must be relative to the config directory: {raw}"
        )));
    }
    Ok(path)
}
