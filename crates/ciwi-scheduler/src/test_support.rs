use crate::registry::AgentRegistry;
use crate::scheduler::Scheduler;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ciwi_core::agent::HeartbeatRequest;
use ciwi_core::pipeline::{ConfigOrigin, ProjectConfigFile, ProjectDetail};
use ciwi_core::ports::{FetchedProject, SourceFetcher, SourceRefs};
use ciwi_core::{Error, Result};
use ciwi_db::{
    Database, SqliteArtifactRepository, SqliteJobRepository, SqliteProjectRepository,
};
use std::collections::HashMap;
use std::sync::Arc;
use tempfile::TempDir;

/// In-memory stand-in for a git remote.
#[derive(Default, Clone)]
pub struct FakeSource {
    commits: HashMap<(String, String), String>,
    files: HashMap<(String, String, String), String>,
    configs: HashMap<String, FetchedProject>,
    pub unavailable: bool,
}

impl FakeSource {
    pub fn with_commit(mut self, repo: &str, git_ref: &str, sha: &str) -> Self {
        self.commits
            .insert((repo.to_string(), git_ref.to_string()), sha.to_string());
        self
    }

    pub fn with_file(mut self, repo: &str, commit: &str, path: &str, content: &str) -> Self {
        self.files.insert(
            (repo.to_string(), commit.to_string(), path.to_string()),
            content.to_string(),
        );
        self
    }

    pub fn with_config(mut self, repo: &str, fetched: FetchedProject) -> Self {
        self.configs.insert(repo.to_string(), fetched);
        self
    }
}

#[async_trait]
impl SourceFetcher for FakeSource {
    async fn fetch_project_config(
        &self,
        repo_url: &str,
        _repo_ref: &str,
        _config_file: &str,
    ) -> Result<FetchedProject> {
        self.configs
            .get(repo_url)
            .cloned()
            .ok_or_else(|| Error::SourceFetch(format!("unknown repository {repo_url}")))
    }

    async fn resolve_commit(&self, repo_url: &str, git_ref: &str) -> Result<String> {
        self.commits
            .get(&(repo_url.to_string(), git_ref.to_string()))
            .cloned()
            .ok_or_else(|| Error::SourceFetch(format!("unknown ref {git_ref}")))
    }

    async fn read_file_at(&self, repo_url: &str, commit: &str, path: &str) -> Result<String> {
        self.files
            .get(&(repo_url.to_string(), commit.to_string(), path.to_string()))
            .cloned()
            .ok_or_else(|| Error::SourceFetch(format!("{path} not found at {commit}")))
    }

    async fn list_refs(&self, repo_url: &str) -> Result<SourceRefs> {
        let mut refs: Vec<String> = self
            .commits
            .keys()
            .filter(|(repo, _)| repo == repo_url)
            .map(|(_, git_ref)| git_ref.clone())
            .collect();
        refs.sort();
        Ok(SourceRefs {
            default_ref: "main".into(),
            refs,
        })
    }

    async fn is_available(&self) -> bool {
        !self.unavailable
    }
}

pub async fn scheduler_with_db() -> (Scheduler, TempDir) {
    scheduler_with_source(FakeSource::default()).await
}

pub async fn scheduler_with_source(source: FakeSource) -> (Scheduler, TempDir) {
    let db = Database::in_memory().await.unwrap();
    db.migrate().await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    let scheduler = Scheduler::new(
        Arc::new(SqliteProjectRepository::new(db.pool().clone())),
        Arc::new(SqliteJobRepository::new(db.pool().clone())),
        Arc::new(SqliteArtifactRepository::new(db.pool().clone(), dir.path())),
        Arc::new(source),
        Arc::new(AgentRegistry::new("v1.0.0", true)),
    );
    (scheduler, dir)
}

pub async fn heartbeat(
    scheduler: &Scheduler,
    agent_id: &str,
    capabilities: &[(&str, &str)],
    now: DateTime<Utc>,
) {
    scheduler
        .registry()
        .heartbeat(
            HeartbeatRequest {
                agent_id: agent_id.into(),
                hostname: format!("{agent_id}.local"),
                os: "linux".into(),
                arch: "amd64".into(),
                version: "v1.0.0".into(),
                capabilities: capabilities
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                ..Default::default()
            },
            now,
        )
        .await
        .unwrap();
}

pub async fn load_project(scheduler: &Scheduler, yaml: &str) -> ProjectDetail {
    let config = ProjectConfigFile::parse(yaml).unwrap();
    scheduler
        .projects
        .load_config(
            &config.project,
            &ConfigOrigin {
                origin_key: "test.yaml".into(),
                config_file: "test.yaml".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap()
}
