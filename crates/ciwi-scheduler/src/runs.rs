//! Pipeline and chain runs.

use crate::plan::{PipelinePlan, ResolvedSource, RunSelection, latest_run, select_jobs};
use crate::scheduler::Scheduler;
use chrono::{DateTime, Utc};
use ciwi_core::ids::{
    JobExecutionId, PipelineChainRecordId, PipelineRecordId, PipelineRunId,
};
use ciwi_core::job::{JobExecution, JobSource, JobStatus};
use ciwi_core::pipeline::{PipelineRecord, ProjectDetail};
use ciwi_core::ports::{JobFilter, SourceRefs};
use ciwi_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::info;

/// Receives human-readable resolution steps while a version is resolved.
pub type ResolveProgress = mpsc::UnboundedSender<String>;

fn report(progress: Option<&ResolveProgress>, message: impl Into<String>) {
    if let Some(tx) = progress {
        // The receiver may have gone away; resolution continues regardless.
        let _ = tx.send(message.into());
    }
}

/// Ids produced by one run invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub pipeline_run_id: PipelineRunId,
    pub job_execution_ids: Vec<JobExecutionId>,
}

impl Scheduler {
    async fn project_of(&self, pipeline: &PipelineRecord) -> Result<ProjectDetail> {
        self.projects
            .get_project(pipeline.project_id)
            .await?
            .ok_or_else(|| Error::ProjectNotFound(pipeline.project_id.to_string()))
    }

    async fn pipeline(&self, id: PipelineRecordId) -> Result<PipelineRecord> {
        self.projects
            .get_pipeline(id)
            .await?
            .ok_or_else(|| Error::PipelineNotFound(id.to_string()))
    }

    /// Enqueue one pipeline, or the selected job of it.
    pub async fn run_pipeline(
        &self,
        id: PipelineRecordId,
        selection: &RunSelection,
        now: DateTime<Utc>,
    ) -> Result<RunOutcome> {
        check_matrix_selection(selection)?;
        let pipeline = self.pipeline(id).await?;
        let detail = self.project_of(&pipeline).await?;

        let selected = select_jobs(&pipeline, selection)?;
        if selected.is_empty() {
            return Err(match selection.job() {
                Some(job) => Error::validation(format!(
                    "unknown job \"{job}\" in pipeline \"{}\"",
                    pipeline.pipeline_id
                )),
                None => Error::validation(format!(
                    "pipeline \"{}\" has no jobs",
                    pipeline.pipeline_id
                )),
            });
        }

        let resolved = self
            .resolve_pipeline(&detail, &pipeline, &HashMap::new(), None)
            .await?;
        let run_id = PipelineRunId::new();
        let agents = self.registry.capability_sets().await;
        let jobs = PipelinePlan {
            project: &detail.project,
            pipeline: &pipeline,
            run_id: &run_id,
            resolved: &resolved,
            chain: None,
            dry_run: selection.dry_run,
        }
        .materialize(&selected, selection.matrix(), &agents, now)?;

        self.enqueue(run_id, jobs).await
    }

    /// Enqueue every member of a chain under one run id. Nothing is persisted
    /// unless every member plans cleanly.
    pub async fn run_chain(
        &self,
        id: PipelineChainRecordId,
        selection: &RunSelection,
        now: DateTime<Utc>,
    ) -> Result<RunOutcome> {
        check_matrix_selection(selection)?;
        let chain = self
            .projects
            .get_pipeline_chain(id)
            .await?
            .ok_or_else(|| Error::PipelineChainNotFound(id.to_string()))?;
        let detail = self
            .projects
            .get_project(chain.project_id)
            .await?
            .ok_or_else(|| Error::ProjectNotFound(chain.project_id.to_string()))?;

        let run_id = PipelineRunId::new();
        let agents = self.registry.capability_sets().await;
        let mut planned: HashMap<String, ResolvedSource> = HashMap::new();
        let mut jobs = Vec::new();
        let mut matched = false;

        for (position, member) in chain.pipelines.iter().enumerate() {
            let pipeline = detail
                .pipeline(member)
                .ok_or_else(|| Error::PipelineNotFound(member.clone()))?;
            let selected = select_jobs(pipeline, selection)?;
            let resolved = self.resolve_pipeline(&detail, pipeline, &planned, None).await?;
            if !selected.is_empty() {
                matched = true;
                let plan = PipelinePlan {
                    project: &detail.project,
                    pipeline,
                    run_id: &run_id,
                    resolved: &resolved,
                    chain: Some((chain.chain_id.as_str(), position as u32)),
                    dry_run: selection.dry_run,
                };
                jobs.extend(plan.materialize(&selected, selection.matrix(), &agents, now)?);
            }
            planned.insert(member.clone(), resolved);
        }

        if !matched {
            return Err(Error::validation(match selection.job() {
                Some(job) => format!("unknown job \"{job}\" in pipeline chain \"{}\"", chain.chain_id),
                None => format!("pipeline chain \"{}\" has no jobs", chain.chain_id),
            }));
        }
        self.enqueue(run_id, jobs).await
    }

    /// Resolve the version a run of pipeline `id` would get, without
    /// enqueueing anything.
    pub async fn resolve_version(
        &self,
        id: PipelineRecordId,
        progress: Option<&ResolveProgress>,
    ) -> Result<ResolvedSource> {
        let pipeline = self.pipeline(id).await?;
        let detail = self.project_of(&pipeline).await?;
        report(progress, format!("resolving pipeline \"{}\"", pipeline.pipeline_id));
        let resolved = self
            .resolve_pipeline(&detail, &pipeline, &HashMap::new(), progress)
            .await?;
        match &resolved.version {
            Some(version) => report(progress, format!("resolved version {version}")),
            None => report(progress, "pipeline has no versioning"),
        }
        Ok(resolved)
    }

    /// Branches of the pipeline's source repository.
    pub async fn source_refs(&self, id: PipelineRecordId) -> Result<SourceRefs> {
        let pipeline = self.pipeline(id).await?;
        let repo = pipeline
            .source
            .as_ref()
            .map(|s| s.repo.trim())
            .filter(|r| !r.is_empty())
            .ok_or_else(|| {
                Error::validation(format!(
                    "pipeline \"{}\" has no source repository",
                    pipeline.pipeline_id
                ))
            })?;
        self.source.list_refs(repo).await
    }

    async fn enqueue(&self, run_id: PipelineRunId, jobs: Vec<JobExecution>) -> Result<RunOutcome> {
        self.jobs.create_many(&jobs).await?;
        info!(pipeline_run_id = %run_id, jobs = jobs.len(), "pipeline run enqueued");
        Ok(RunOutcome {
            pipeline_run_id: run_id,
            job_execution_ids: jobs.into_iter().map(|j| j.id).collect(),
        })
    }

    /// Source and version for a run of `pipeline`: its own where configured,
    /// otherwise inherited from its `depends_on` pipelines. `planned` holds
    /// pipelines already planned in the same chain.
    async fn resolve_pipeline(
        &self,
        detail: &ProjectDetail,
        pipeline: &PipelineRecord,
        planned: &HashMap<String, ResolvedSource>,
        progress: Option<&ResolveProgress>,
    ) -> Result<ResolvedSource> {
        let mut inherited = ResolvedSource::default();
        for dep in &pipeline.depends_on {
            if let Some(chained) = planned.get(dep) {
                report(progress, format!("dependency \"{dep}\" runs earlier in this chain"));
                inherited = inherited.or_inherit(chained);
                continue;
            }
            let history = self
                .jobs
                .list(&JobFilter::ByPipeline {
                    project_id: detail.project.id,
                    pipeline_id: dep.clone(),
                })
                .await?;
            let run = latest_run(&history)
                .filter(|run| run.iter().all(|j| j.status == JobStatus::Succeeded))
                .ok_or_else(|| {
                    Error::validation(format!("dependency pipeline \"{dep}\" has not succeeded"))
                })?;
            report(progress, format!("dependency \"{dep}\" succeeded"));
            inherited = inherited.or_inherit(&ResolvedSource::from_run(&run));
        }

        let source = match &pipeline.source {
            Some(src) if !src.repo.trim().is_empty() => {
                let git_ref = match src.git_ref.trim() {
                    "" => "HEAD",
                    other => other,
                };
                let commit = self.source.resolve_commit(&src.repo, git_ref).await?;
                report(progress, format!("resolved {git_ref} to {commit}"));
                Some(JobSource {
                    repo: src.repo.clone(),
                    git_ref: commit,
                })
            }
            _ => None,
        };

        let version = match pipeline.versioning.as_ref().filter(|v| !v.file.trim().is_empty()) {
            Some(versioning) => {
                let from = source.as_ref().or(inherited.source.as_ref()).ok_or_else(|| {
                    Error::validation(format!(
                        "pipeline \"{}\" has versioning but no source repository",
                        pipeline.pipeline_id
                    ))
                })?;
                let content = self
                    .source
                    .read_file_at(&from.repo, &from.git_ref, &versioning.file)
                    .await?;
                let version = format!(
                    "{}{}",
                    versioning.tag_prefix,
                    content.trim_end_matches(['\r', '\n']).trim()
                );
                report(progress, format!("read {} at {}", versioning.file, from.git_ref));
                Some(version)
            }
            None => None,
        };

        Ok(ResolvedSource { source, version }.or_inherit(&inherited))
    }
}

fn check_matrix_selection(selection: &RunSelection) -> Result<()> {
    if selection.matrix().is_some() && selection.job().is_none() {
        return Err(Error::validation("matrix_name requires pipeline_job_id"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeSource, heartbeat, load_project, scheduler_with_source};
    use ciwi_core::job::{LeaseRequest, meta};
    use ciwi_core::ErrorKind;
    use crate::scheduler::StatusUpdateRequest;
    use std::collections::BTreeMap;

    const PROJECT: &str = r#"
project:
  name: demo
  pipelines:
    - id: build
      source: { repo: https://example.com/demo.git, ref: main }
      versioning: { file: VERSION, tag_prefix: v }
      jobs:
        - id: compile
          steps:
            - run: make
    - id: release
      depends_on: [build]
      jobs:
        - id: publish
          steps:
            - run: make publish
    - id: second
      jobs:
        - id: prep
          steps:
            - run: make prep
        - id: publish
          needs: [prep]
          steps:
            - run: make publish
  pipeline_chains:
    - id: ship
      pipelines: [build, second]
"#;

    fn source() -> FakeSource {
        FakeSource::default()
            .with_commit("https://example.com/demo.git", "main", "abc1234")
            .with_file("https://example.com/demo.git", "abc1234", "VERSION", "1.2.3\n")
    }

    async fn succeed_all(scheduler: &Scheduler, agent: &str, now: DateTime<Utc>) {
        let req = LeaseRequest {
            agent_id: agent.into(),
            capabilities: BTreeMap::new(),
        };
        while let Some(job) = scheduler.lease(&req, now).await.unwrap().job_execution {
            scheduler
                .report_status(
                    &job.id,
                    StatusUpdateRequest {
                        agent_id: agent.into(),
                        status: "succeeded".into(),
                        ..Default::default()
                    },
                    now,
                )
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_version_inherited_from_dependency() {
        let (scheduler, _dir) = scheduler_with_source(source()).await;
        let now = Utc::now();
        heartbeat(&scheduler, "agent-1", &[], now).await;
        let detail = load_project(&scheduler, PROJECT).await;
        let build = detail.pipeline("build").unwrap().id;
        let release = detail.pipeline("release").unwrap().id;

        let err = scheduler
            .run_pipeline(release, &RunSelection::default(), now)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "dependency pipeline \"build\" has not succeeded");

        let outcome = scheduler
            .run_pipeline(build, &RunSelection::default(), now)
            .await
            .unwrap();
        let job = scheduler.get_job(&outcome.job_execution_ids[0]).await.unwrap();
        assert_eq!(job.metadata[meta::PIPELINE_VERSION], "v1.2.3");
        assert_eq!(job.source.as_ref().unwrap().git_ref, "abc1234");
        succeed_all(&scheduler, "agent-1", now).await;

        let outcome = scheduler
            .run_pipeline(release, &RunSelection::default(), now)
            .await
            .unwrap();
        let job = scheduler.get_job(&outcome.job_execution_ids[0]).await.unwrap();
        assert_eq!(job.metadata[meta::PIPELINE_VERSION], "v1.2.3");
        assert_eq!(job.source.as_ref().unwrap().git_ref, "abc1234");
    }

    #[tokio::test]
    async fn test_dry_run_does_not_satisfy_dependency() {
        let (scheduler, _dir) = scheduler_with_source(source()).await;
        let now = Utc::now();
        heartbeat(&scheduler, "agent-1", &[], now).await;
        let detail = load_project(&scheduler, PROJECT).await;
        let build = detail.pipeline("build").unwrap().id;
        let release = detail.pipeline("release").unwrap().id;

        let dry = RunSelection {
            dry_run: true,
            ..Default::default()
        };
        let outcome = scheduler.run_pipeline(build, &dry, now).await.unwrap();
        let job = scheduler.get_job(&outcome.job_execution_ids[0]).await.unwrap();
        assert!(job.is_dry_run());
        succeed_all(&scheduler, "agent-1", now).await;

        assert!(scheduler
            .run_pipeline(release, &RunSelection::default(), now)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_chain_selection_is_atomic() {
        let (scheduler, _dir) = scheduler_with_source(source()).await;
        let now = Utc::now();
        let detail = load_project(&scheduler, PROJECT).await;
        let chain = detail.pipeline_chains[0].id;

        let selection = RunSelection {
            pipeline_job_id: Some("publish".into()),
            ..Default::default()
        };
        let err = scheduler.run_chain(chain, &selection, now).await.unwrap_err();
        assert!(err
            .to_string()
            .contains("selection excludes required job \"prep\" needed by \"publish\""));
        assert!(scheduler.list_jobs().await.unwrap().is_empty());

        let outcome = scheduler
            .run_chain(chain, &RunSelection::default(), now)
            .await
            .unwrap();
        assert_eq!(outcome.job_execution_ids.len(), 3);
        let jobs = scheduler.list_jobs().await.unwrap();
        assert!(jobs
            .iter()
            .all(|j| j.pipeline_run_id() == Some(outcome.pipeline_run_id.as_str())));
        assert_eq!(jobs[0].chain_position(), Some(0));
        assert_eq!(jobs[2].chain_position(), Some(1));
    }

    #[tokio::test]
    async fn test_unknown_selection_rejected() {
        let (scheduler, _dir) = scheduler_with_source(source()).await;
        let now = Utc::now();
        let detail = load_project(&scheduler, PROJECT).await;
        let build = detail.pipeline("build").unwrap().id;

        let unknown = RunSelection {
            pipeline_job_id: Some("deploy".into()),
            ..Default::default()
        };
        let err = scheduler.run_pipeline(build, &unknown, now).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let matrix_only = RunSelection {
            matrix_name: Some("linux".into()),
            ..Default::default()
        };
        assert!(scheduler.run_pipeline(build, &matrix_only, now).await.is_err());

        let missing = scheduler
            .run_pipeline(9999, &RunSelection::default(), now)
            .await
            .unwrap_err();
        assert_eq!(missing.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_resolve_version_reports_progress() {
        let (scheduler, _dir) = scheduler_with_source(source()).await;
        let detail = load_project(&scheduler, PROJECT).await;
        let build = detail.pipeline("build").unwrap().id;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let resolved = scheduler.resolve_version(build, Some(&tx)).await.unwrap();
        drop(tx);
        assert_eq!(resolved.version.as_deref(), Some("v1.2.3"));

        let mut steps = Vec::new();
        while let Some(step) = rx.recv().await {
            steps.push(step);
        }
        assert_eq!(steps.first().map(String::as_str), Some("resolving pipeline \"build\""));
        assert_eq!(steps.last().map(String::as_str), Some("resolved version v1.2.3"));

        let refs = scheduler.source_refs(build).await.unwrap();
        assert_eq!(refs.default_ref, "main");
    }
}
