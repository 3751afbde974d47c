//! Materialize pipeline jobs into queued job executions.

use crate::capabilities::{job_requirements, unmet_requirements};
use crate::dag::DagBuilder;
use crate::matrix::{MatrixExpander, MatrixInstance};
use crate::script::render_steps;
use chrono::{DateTime, Utc};
use ciwi_core::ids::PipelineRunId;
use ciwi_core::job::{JobExecution, JobSource, NewJobExecution, meta};
use ciwi_core::pipeline::{JobConfig, PipelineRecord, Project};
use ciwi_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub mod env {
    pub const PIPELINE_ID: &str = "CIWI_PIPELINE_ID";
    pub const PIPELINE_JOB_ID: &str = "CIWI_PIPELINE_JOB_ID";
    pub const PIPELINE_RUN_ID: &str = "CIWI_PIPELINE_RUN_ID";
    pub const PIPELINE_VERSION: &str = "CIWI_PIPELINE_VERSION";
    pub const MATRIX_NAME: &str = "CIWI_MATRIX_NAME";
    pub const DRY_RUN: &str = "CIWI_DRY_RUN";
}

/// Body of run, run-selection, and chain-run requests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSelection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matrix_name: Option<String>,
    #[serde(default)]
    pub dry_run: bool,
}

impl RunSelection {
    pub fn job(&self) -> Option<&str> {
        self.pipeline_job_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn matrix(&self) -> Option<&str> {
        self.matrix_name
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// Source revision and version a run is pinned to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedSource {
    pub source: Option<JobSource>,
    pub version: Option<String>,
}

impl ResolvedSource {
    /// Recover what a finished run was pinned to.
    pub fn from_run(jobs: &[JobExecution]) -> Self {
        Self {
            source: jobs.iter().find_map(|j| j.source.clone()),
            version: jobs
                .iter()
                .find_map(|j| j.meta(meta::PIPELINE_VERSION).map(str::to_string)),
        }
    }

    /// Fill missing fields from `other`.
    pub fn or_inherit(self, other: &ResolvedSource) -> Self {
        Self {
            source: self.source.or_else(|| other.source.clone()),
            version: self.version.or_else(|| other.version.clone()),
        }
    }
}

/// Jobs of the most recent non-dry run among `jobs` (ordered oldest first).
pub fn latest_run(jobs: &[JobExecution]) -> Option<Vec<JobExecution>> {
    let run_id = jobs
        .iter()
        .rev()
        .filter(|j| !j.is_dry_run())
        .find_map(|j| j.pipeline_run_id())?
        .to_string();
    Some(
        jobs.iter()
            .filter(|j| j.pipeline_run_id() == Some(run_id.as_str()))
            .cloned()
            .collect(),
    )
}

/// Everything needed to turn one pipeline into job executions.
pub struct PipelinePlan<'a> {
    pub project: &'a Project,
    pub pipeline: &'a PipelineRecord,
    pub run_id: &'a PipelineRunId,
    pub resolved: &'a ResolvedSource,
    /// Chain id and position when run as part of a chain.
    pub chain: Option<(&'a str, u32)>,
    pub dry_run: bool,
}

/// Job ids of `pipeline` picked by `selection`. Empty when the selection names
/// a job the pipeline does not have. Fails when a picked job needs one that is
/// not picked.
pub fn select_jobs(pipeline: &PipelineRecord, selection: &RunSelection) -> Result<BTreeSet<String>> {
    let dag = DagBuilder::new().build(&pipeline.jobs)?;
    let selected: BTreeSet<&str> = match selection.job() {
        None => pipeline.jobs.iter().map(|j| j.id.as_str()).collect(),
        Some(id) => pipeline
            .jobs
            .iter()
            .filter(|j| j.id == id)
            .map(|j| j.id.as_str())
            .collect(),
    };
    dag.check_selection(&selected)?;
    Ok(selected.into_iter().map(str::to_string).collect())
}

impl PipelinePlan<'_> {
    /// Build queued executions for `selected` jobs, in config order.
    pub fn materialize(
        &self,
        selected: &BTreeSet<String>,
        matrix_name: Option<&str>,
        agents: &[BTreeMap<String, String>],
        now: DateTime<Utc>,
    ) -> Result<Vec<JobExecution>> {
        let expander = MatrixExpander::new();
        let mut jobs = Vec::new();
        for job in self.pipeline.jobs.iter().filter(|j| selected.contains(&j.id)) {
            for instance in expander.expand(job, matrix_name)? {
                jobs.push(self.job_execution(job, &instance, agents, now)?);
            }
        }
        Ok(jobs)
    }

    fn job_execution(
        &self,
        job: &JobConfig,
        instance: &MatrixInstance,
        agents: &[BTreeMap<String, String>],
        now: DateTime<Utc>,
    ) -> Result<JobExecution> {
        if job.steps.is_empty() {
            return Err(Error::validation(format!(
                "job \"{}\" in pipeline \"{}\" has no steps",
                job.id, self.pipeline.pipeline_id
            )));
        }
        let script = instance.substitute(&render_steps(&job.steps)?);

        let mut env = instance.substitute_map(&job.env);
        env.insert(env::PIPELINE_ID.into(), self.pipeline.pipeline_id.clone());
        env.insert(env::PIPELINE_JOB_ID.into(), job.id.clone());
        env.insert(env::PIPELINE_RUN_ID.into(), self.run_id.to_string());

        let mut metadata = BTreeMap::from([
            (meta::PROJECT.to_string(), self.project.name.clone()),
            (meta::PROJECT_ID.to_string(), self.project.id.to_string()),
            (meta::PIPELINE_ID.to_string(), self.pipeline.pipeline_id.clone()),
            (meta::PIPELINE_JOB_ID.to_string(), job.id.clone()),
            (meta::PIPELINE_RUN_ID.to_string(), self.run_id.to_string()),
        ]);
        if let Some(name) = &instance.name {
            env.insert(env::MATRIX_NAME.into(), name.clone());
            metadata.insert(meta::MATRIX_NAME.into(), name.clone());
        }
        if let Some(version) = &self.resolved.version {
            env.insert(env::PIPELINE_VERSION.into(), version.clone());
            metadata.insert(meta::PIPELINE_VERSION.into(), version.clone());
        }
        if let Some((chain_id, position)) = self.chain {
            metadata.insert(meta::PIPELINE_CHAIN_ID.into(), chain_id.to_string());
            metadata.insert(meta::CHAIN_POSITION.into(), position.to_string());
        }
        if self.dry_run {
            env.insert(env::DRY_RUN.into(), "1".into());
            metadata.insert(meta::DRY_RUN.into(), "1".into());
        }

        let required_capabilities = instance.substitute_map(&job_requirements(job));
        let unmet = unmet_requirements(&required_capabilities, agents);

        let mut execution = JobExecution::queued(
            NewJobExecution {
                script,
                env,
                required_capabilities,
                timeout_seconds: job.timeout_seconds,
                artifact_globs: job.artifacts.iter().map(|g| instance.substitute(g)).collect(),
                caches: job.caches.clone(),
                source: self.resolved.source.clone(),
                metadata,
                needs: job.needs.clone(),
                sensitive_values: Vec::new(),
            },
            now,
        );
        execution.unmet_requirements = unmet;
        Ok(execution)
    }
}
