//! Project configuration and stored pipeline records.
//!
//! `ProjectConfigFile` is the user-authored YAML. Loading a config replaces
//! the project's pipelines and chains with `PipelineRecord` and
//! `PipelineChainRecord` rows.

use crate::ids::{PipelineChainRecordId, PipelineRecordId, ProjectId};
use crate::job::CacheSpec;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Default config file name inside a project repository.
pub const DEFAULT_CONFIG_FILE: &str = "ciwi-project.yaml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfigFile {
    #[serde(default = "default_config_version")]
    pub version: u32,
    pub project: ProjectConfig,
}

fn default_config_version() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub name: String,
    #[serde(default)]
    pub pipelines: Vec<PipelineConfig>,
    #[serde(default)]
    pub pipeline_chains: Vec<PipelineChainConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub trigger: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub versioning: Option<VersioningConfig>,
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub repo: String,
    #[serde(rename = "ref", default)]
    pub git_ref: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersioningConfig {
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub tag_prefix: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    pub id: String,
    #[serde(default)]
    pub runs_on: BTreeMap<String, String>,
    #[serde(default)]
    pub requires: RequiresConfig,
    #[serde(default)]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub needs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matrix: Option<MatrixConfig>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub caches: Vec<CacheSpec>,
    #[serde(default)]
    pub steps: Vec<StepConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequiresConfig {
    #[serde(default)]
    pub tools: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixConfig {
    #[serde(default)]
    pub include: Vec<MatrixEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixEntry {
    pub name: String,
    #[serde(flatten)]
    pub vars: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<TestStepConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestStepConfig {
    #[serde(default)]
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub report: String,
}

/// A step with exactly one kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step<'a> {
    Run(&'a str),
    Test(&'a TestStepConfig),
}

impl StepConfig {
    pub fn kind(&self) -> Result<Step<'_>> {
        match (&self.run, &self.test) {
            (Some(run), None) => Ok(Step::Run(run)),
            (None, Some(test)) => Ok(Step::Test(test)),
            _ => Err(Error::InvalidConfig(
                "each step must declare exactly one of run or test".into(),
            )),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineChainConfig {
    pub id: String,
    #[serde(default)]
    pub pipelines: Vec<String>,
}

impl ProjectConfigFile {
    pub fn parse(yaml: &str) -> Result<Self> {
        let file: ProjectConfigFile = serde_yaml::from_str(yaml)?;
        file.validate()?;
        Ok(file)
    }

    /// Structural validation. `needs` cycles are checked by the scheduler's
    /// DAG builder.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::InvalidConfig(msg));
        let project = &self.project;
        if project.name.trim().is_empty() {
            return invalid("project.name is required".into());
        }
        let mut pipeline_ids = HashSet::new();
        for pipeline in &project.pipelines {
            if pipeline.id.trim().is_empty() {
                return invalid("pipeline id is required".into());
            }
            if !pipeline_ids.insert(pipeline.id.as_str()) {
                return invalid(format!("duplicate pipeline id \"{}\"", pipeline.id));
            }
        }
        for pipeline in &project.pipelines {
            for dep in &pipeline.depends_on {
                if dep == &pipeline.id {
                    return invalid(format!("pipeline \"{}\" depends on itself", pipeline.id));
                }
                if !pipeline_ids.contains(dep.as_str()) {
                    return invalid(format!(
                        "pipeline \"{}\" depends on unknown pipeline \"{dep}\"",
                        pipeline.id
                    ));
                }
            }
            let mut job_ids = HashSet::new();
            for job in &pipeline.jobs {
                if job.id.trim().is_empty() {
                    return invalid(format!("pipeline \"{}\" has a job without id", pipeline.id));
                }
                if !job_ids.insert(job.id.as_str()) {
                    return invalid(format!(
                        "pipeline \"{}\" has duplicate job id \"{}\"",
                        pipeline.id, job.id
                    ));
                }
                for step in &job.steps {
                    step.kind()?;
                }
                if let Some(matrix) = &job.matrix {
                    let mut names = HashSet::new();
                    for entry in &matrix.include {
                        if entry.name.trim().is_empty() || !names.insert(entry.name.as_str()) {
                            return invalid(format!(
                                "job \"{}\" has a missing or duplicate matrix entry name",
                                job.id
                            ));
                        }
                    }
                }
            }
            for job in &pipeline.jobs {
                for need in &job.needs {
                    if !job_ids.contains(need.as_str()) {
                        return invalid(format!(
                            "job \"{}\" needs unknown job \"{need}\"",
                            job.id
                        ));
                    }
                }
            }
        }
        let mut chain_ids = HashSet::new();
        for chain in &project.pipeline_chains {
            if chain.id.trim().is_empty() || !chain_ids.insert(chain.id.as_str()) {
                return invalid("pipeline chain ids must be non-empty and unique".into());
            }
            if chain.pipelines.is_empty() {
                return invalid(format!("pipeline chain \"{}\" is empty", chain.id));
            }
            for member in &chain.pipelines {
                if !pipeline_ids.contains(member.as_str()) {
                    return invalid(format!(
                        "pipeline chain \"{}\" references unknown pipeline \"{member}\"",
                        chain.id
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Where a loaded config came from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigOrigin {
    /// Stable key identifying the origin (config path or repo URL).
    pub origin_key: String,
    pub repo_url: String,
    pub repo_ref: String,
    pub config_file: String,
    pub source_commit: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    pub origin_key: String,
    pub repo_url: String,
    pub repo_ref: String,
    pub config_file: String,
    pub source_commit: String,
    pub loaded_utc: DateTime<Utc>,
}

impl Project {
    /// Projects imported from a repository can be re-fetched.
    pub fn is_repo_backed(&self) -> bool {
        !self.repo_url.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRecord {
    pub id: PipelineRecordId,
    pub project_id: ProjectId,
    pub pipeline_id: String,
    pub trigger: String,
    pub depends_on: Vec<String>,
    pub source: Option<SourceConfig>,
    pub versioning: Option<VersioningConfig>,
    pub jobs: Vec<JobConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineChainRecord {
    pub id: PipelineChainRecordId,
    pub project_id: ProjectId,
    pub chain_id: String,
    pub pipelines: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectDetail {
    #[serde(flatten)]
    pub project: Project,
    pub pipelines: Vec<PipelineRecord>,
    pub pipeline_chains: Vec<PipelineChainRecord>,
}

impl ProjectDetail {
    pub fn pipeline(&self, pipeline_id: &str) -> Option<&PipelineRecord> {
        self.pipelines.iter().find(|p| p.pipeline_id == pipeline_id)
    }
}
