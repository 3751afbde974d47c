//! In-memory git remote.

use async_trait::async_trait;
use ciwi_core::ports::{FetchedProject, SourceFetcher, SourceRefs};
use ciwi_core::{Error, Result};
use std::collections::HashMap;

#[derive(Default, Clone)]
pub struct FakeSource {
    pub commits: HashMap<(String, String), String>,
    pub files: HashMap<(String, String, String), String>,
    pub configs: HashMap<String, FetchedProject>,
    pub unavailable: bool,
}

impl FakeSource {
    /// Resolve `git_ref` of `repo` to `sha`.
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

    /// Serve `fetched` for any import of `repo`.
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
            .ok_or_else(|| Error::SourceFetch(format!("ref {git_ref} not found in {repo_url}")))
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
        if refs.is_empty() {
            return Err(Error::SourceFetch(format!("unknown repository {repo_url}")));
        }
        refs.sort();
        Ok(SourceRefs {
            default_ref: "main".to_string(),
            refs,
        })
    }

    async fn is_available(&self) -> bool {
        !self.unavailable
    }
}
