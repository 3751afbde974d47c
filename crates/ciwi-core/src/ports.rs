//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the core domain and external adapters.

use crate::artifact::{Artifact, StoredTestReport, TestReport};
use crate::events::{JobEvent, JobEventInput};
use crate::ids::*;
use crate::job::{JobExecution, JobStatus};
use crate::pipeline::{
    ConfigOrigin, PipelineChainRecord, PipelineRecord, Project, ProjectConfig, ProjectDetail,
};
use crate::vault::{VaultConnection, VaultConnectionInput};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Repository for projects, pipelines, and pipeline chains.
#[async_trait]
pub trait ProjectRepository: Send + Sync {
    /// Create or replace a project from a parsed config. The project's
    /// pipelines and chains are replaced atomically.
    async fn load_config(&self, config: &ProjectConfig, origin: &ConfigOrigin)
    -> Result<ProjectDetail>;

    async fn list_projects(&self) -> Result<Vec<Project>>;

    async fn get_project(&self, id: ProjectId) -> Result<Option<ProjectDetail>>;

    async fn get_project_by_name(&self, name: &str) -> Result<Option<Project>>;

    async fn get_pipeline(&self, id: PipelineRecordId) -> Result<Option<PipelineRecord>>;

    async fn get_pipeline_chain(
        &self,
        id: PipelineChainRecordId,
    ) -> Result<Option<PipelineChainRecord>>;
}

/// Selection of job executions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobFilter {
    All,
    Queued,
    /// Leased or running.
    Active,
    /// Succeeded or failed.
    History,
    ByRun(String),
    ByAgent(String),
    ByPipeline {
        project_id: ProjectId,
        pipeline_id: String,
    },
}

/// Repository for job executions and their event log.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Insert all jobs in one transaction.
    async fn create_many(&self, jobs: &[JobExecution]) -> Result<()>;

    async fn get(&self, id: &JobExecutionId) -> Result<Option<JobExecution>>;

    /// List jobs ordered by creation time, oldest first.
    async fn list(&self, filter: &JobFilter) -> Result<Vec<JobExecution>>;

    /// Compare-and-set `queued` to `leased`. Fails (returns `false`) when the
    /// job is no longer queued or the agent already holds an active job.
    async fn mark_leased(
        &self,
        id: &JobExecutionId,
        agent_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Persist a mutated job if its stored status still equals `expected`,
    /// appending `events` in the same transaction.
    async fn update(
        &self,
        job: &JobExecution,
        expected: JobStatus,
        events: &[JobEventInput],
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn append_events(
        &self,
        id: &JobExecutionId,
        events: &[JobEventInput],
        now: DateTime<Utc>,
    ) -> Result<Vec<JobEvent>>;

    /// Events in insertion order.
    async fn list_events(&self, id: &JobExecutionId) -> Result<Vec<JobEvent>>;

    /// Delete a job only while it is queued.
    async fn delete_queued(&self, id: &JobExecutionId) -> Result<bool>;

    async fn delete_non_terminal(&self) -> Result<Vec<JobExecutionId>>;

    async fn delete_terminal(&self) -> Result<Vec<JobExecutionId>>;
}

/// Artifact files and test reports.
#[async_trait]
pub trait ArtifactRepository: Send + Sync {
    /// Store (or overwrite) a file. `path` must already be normalized.
    async fn upsert(&self, job_id: &JobExecutionId, path: &str, data: &[u8]) -> Result<Artifact>;

    /// Artifacts sorted by path.
    async fn list(&self, job_id: &JobExecutionId) -> Result<Vec<Artifact>>;

    async fn read(&self, job_id: &JobExecutionId, path: &str)
    -> Result<Option<(Artifact, Vec<u8>)>>;

    /// Zip archive of every artifact, entries in path order.
    async fn bundle(&self, job_id: &JobExecutionId) -> Result<Vec<u8>>;

    async fn store_test_report(
        &self,
        job_id: &JobExecutionId,
        report: &TestReport,
    ) -> Result<StoredTestReport>;

    async fn get_test_report(&self, job_id: &JobExecutionId) -> Result<Option<StoredTestReport>>;

    /// Remove artifacts, files, and reports for deleted jobs.
    async fn delete_for_jobs(&self, ids: &[JobExecutionId]) -> Result<()>;
}

/// Flat string key/value store.
#[async_trait]
pub trait AppStateRepository: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Set several keys in one transaction.
    async fn set_many(&self, values: &[(&str, String)]) -> Result<()>;

    async fn list(&self) -> Result<BTreeMap<String, String>>;
}

#[async_trait]
pub trait VaultRepository: Send + Sync {
    async fn list(&self) -> Result<Vec<VaultConnection>>;

    async fn get(&self, id: VaultConnectionId) -> Result<Option<VaultConnection>>;

    async fn create(&self, input: &VaultConnectionInput) -> Result<VaultConnection>;

    async fn update(
        &self,
        id: VaultConnectionId,
        input: &VaultConnectionInput,
    ) -> Result<Option<VaultConnection>>;

    async fn delete(&self, id: VaultConnectionId) -> Result<bool>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectIcon {
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// Result of fetching a project's config from its repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedProject {
    pub config_content: String,
    pub source_commit: String,
    pub icon: Option<ProjectIcon>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRefs {
    pub default_ref: String,
    pub refs: Vec<String>,
}

/// Access to version-controlled pipeline sources.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch_project_config(
        &self,
        repo_url: &str,
        repo_ref: &str,
        config_file: &str,
    ) -> Result<FetchedProject>;

    /// Resolve a ref to a commit sha.
    async fn resolve_commit(&self, repo_url: &str, git_ref: &str) -> Result<String>;

    async fn read_file_at(&self, repo_url: &str, commit: &str, path: &str) -> Result<String>;

    async fn list_refs(&self, repo_url: &str) -> Result<SourceRefs>;

    /// Whether the backing tool (e.g. `git`) is usable on this host.
    async fn is_available(&self) -> bool;
}
