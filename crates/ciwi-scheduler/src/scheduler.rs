//! Job scheduler: leasing, status ingestion, force-fail, and retention.
//!
//! Every operation that reads job state and then writes it back runs under
//! one async mutex, so lease decisions, status posts, and cascades never
//! interleave.

use crate::capabilities::{satisfies, unmet_requirements};
use crate::registry::AgentRegistry;
use crate::script::parse_build_summary;
use chrono::{DateTime, Utc};
use ciwi_core::agent::{Freshness, caps};
use ciwi_core::artifact::TestSummary;
use ciwi_core::events::{JobEvent, JobEventInput, LEASE_EXPIRED};
use ciwi_core::ids::JobExecutionId;
use ciwi_core::job::{
    JobExecution, JobStatus, LeaseRequest, LeaseResponse, NewJobExecution, ReportedStatus,
    StatusReport, meta,
};
use ciwi_core::ports::{
    ArtifactRepository, JobFilter, JobRepository, ProjectRepository, SourceFetcher,
};
use ciwi_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Message returned to an agent that still holds a leased or running job.
pub const AGENT_HAS_ACTIVE_JOB: &str = "agent has active job";

/// Body of `POST /jobs/{id}/status`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusUpdateRequest {
    #[serde(default)]
    pub agent_id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub events: Vec<JobEventInput>,
}

/// Body of `POST /agents/{id}/run-script`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunScriptRequest {
    #[serde(default)]
    pub shell: String,
    #[serde(default)]
    pub script: String,
    #[serde(default)]
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunScriptResponse {
    pub queued: bool,
    pub agent_id: String,
    pub job_execution_id: JobExecutionId,
    pub shell: String,
    pub timeout_seconds: u64,
}

pub struct Scheduler {
    pub(crate) projects: Arc<dyn ProjectRepository>,
    pub(crate) jobs: Arc<dyn JobRepository>,
    pub(crate) artifacts: Arc<dyn ArtifactRepository>,
    pub(crate) source: Arc<dyn SourceFetcher>,
    pub(crate) registry: Arc<AgentRegistry>,
    pub(crate) lock: Mutex<()>,
}

impl Scheduler {
    pub fn new(
        projects: Arc<dyn ProjectRepository>,
        jobs: Arc<dyn JobRepository>,
        artifacts: Arc<dyn ArtifactRepository>,
        source: Arc<dyn SourceFetcher>,
        registry: Arc<AgentRegistry>,
    ) -> Self {
        Self {
            projects,
            jobs,
            artifacts,
            source,
            registry,
            lock: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub async fn get_job(&self, id: &JobExecutionId) -> Result<JobExecution> {
        self.jobs
            .get(id)
            .await?
            .ok_or_else(|| Error::JobNotFound(id.to_string()))
    }

    pub async fn list_jobs(&self) -> Result<Vec<JobExecution>> {
        self.jobs.list(&JobFilter::All).await
    }

    /// Enqueue a raw job execution.
    pub async fn create_job(&self, new: NewJobExecution, now: DateTime<Utc>) -> Result<JobExecution> {
        if new.script.trim().is_empty() {
            return Err(Error::validation("script is required"));
        }
        let mut job = JobExecution::queued(new, now);
        job.unmet_requirements = unmet_requirements(
            &job.required_capabilities,
            &self.registry.capability_sets().await,
        );
        self.jobs.create_many(std::slice::from_ref(&job)).await?;
        info!(job_execution_id = %job.id, "job execution created");
        Ok(job)
    }

    /// Enqueue an ad-hoc script pinned to one agent and shell.
    pub async fn run_script(
        &self,
        agent_id: &str,
        req: RunScriptRequest,
        now: DateTime<Utc>,
    ) -> Result<RunScriptResponse> {
        let agent = self
            .registry
            .get(agent_id)
            .await
            .ok_or_else(|| Error::AgentNotFound(agent_id.to_string()))?;
        let shell = req.shell.trim().to_string();
        if shell.is_empty() {
            return Err(Error::validation("shell is required"));
        }
        if req.script.trim().is_empty() {
            return Err(Error::validation("script is required"));
        }

        let capabilities = agent.effective_capabilities();
        let executor = capabilities.get(caps::EXECUTOR).map(String::as_str);
        let shells = capabilities.get(caps::SHELLS).map(String::as_str).unwrap_or_default();
        let supported = executor == Some("script") && shells.split(',').any(|s| s.trim() == shell);
        if !supported {
            return Err(Error::validation(format!(
                "agent {agent_id} does not support requested shell \"{shell}\""
            )));
        }

        let job = self
            .create_job(
                NewJobExecution {
                    script: req.script,
                    timeout_seconds: req.timeout_seconds,
                    required_capabilities: BTreeMap::from([
                        (caps::AGENT_ID.to_string(), agent_id.to_string()),
                        (caps::SHELL.to_string(), shell.clone()),
                    ]),
                    metadata: BTreeMap::from([(meta::ADHOC.to_string(), "1".to_string())]),
                    ..Default::default()
                },
                now,
            )
            .await?;
        self.registry
            .note(agent_id, now, format!("ad-hoc script queued as {}", job.id))
            .await;

        Ok(RunScriptResponse {
            queued: true,
            agent_id: agent_id.to_string(),
            job_execution_id: job.id,
            shell,
            timeout_seconds: job.timeout_seconds,
        })
    }

    /// Lease the oldest eligible queued job to `req.agent_id`.
    pub async fn lease(&self, req: &LeaseRequest, now: DateTime<Utc>) -> Result<LeaseResponse> {
        let agent_id = req.agent_id.trim();
        if agent_id.is_empty() {
            return Err(Error::validation("agent_id is required"));
        }
        // Snapshot registry state before touching the store.
        let capabilities = self
            .registry
            .effective_capabilities(agent_id, &req.capabilities)
            .await;

        let _guard = self.lock.lock().await;
        self.requeue_abandoned(agent_id, now).await?;

        let held = self.jobs.list(&JobFilter::ByAgent(agent_id.to_string())).await?;
        if held.iter().any(|j| j.status.is_active()) {
            return Ok(LeaseResponse::none(AGENT_HAS_ACTIVE_JOB));
        }

        let queued = self.jobs.list(&JobFilter::Queued).await?;
        let mut runs: HashMap<String, Vec<JobExecution>> = HashMap::new();
        for job in queued {
            if !satisfies(&job.required_capabilities, &capabilities) {
                continue;
            }
            if let Some(run_id) = job.pipeline_run_id() {
                if !runs.contains_key(run_id) {
                    let run = self.jobs.list(&JobFilter::ByRun(run_id.to_string())).await?;
                    runs.insert(run_id.to_string(), run);
                }
                let run = runs.get(run_id).map(Vec::as_slice).unwrap_or_default();
                if !dependencies_ready(&job, run) {
                    continue;
                }
            }
            if !self.jobs.mark_leased(&job.id, agent_id, now).await? {
                debug!(job_execution_id = %job.id, agent_id, "lease lost compare-and-set");
                continue;
            }
            let leased = self.get_job(&job.id).await?;
            info!(job_execution_id = %leased.id, agent_id, "job leased");
            self.registry
                .note(agent_id, now, format!("leased job {}", leased.id))
                .await;
            return Ok(LeaseResponse::assigned(leased));
        }
        Ok(LeaseResponse::none(""))
    }

    /// Return leased jobs whose holder has gone offline to the queue.
    ///
    /// Only jobs that never reported `running` are requeued. The lease time
    /// counts as contact, so a fresh lease survives a server restart that
    /// emptied the registry. Caller holds `self.lock`.
    async fn requeue_abandoned(&self, requester: &str, now: DateTime<Utc>) -> Result<usize> {
        let active = self.jobs.list(&JobFilter::Active).await?;
        let mut requeued = 0;
        for mut job in active.into_iter().filter(|j| j.status == JobStatus::Leased) {
            let Some(holder) = job.leased_by_agent_id.clone() else {
                continue;
            };
            if holder == requester {
                continue;
            }
            let last_seen = self
                .registry
                .get(&holder)
                .await
                .and_then(|agent| agent.last_seen_utc);
            if Freshness::classify(last_seen.max(job.leased_utc), now) != Freshness::Offline {
                continue;
            }
            job.return_to_queue()?;
            let event = JobEventInput::new(
                LEASE_EXPIRED,
                serde_json::json!({ "agent_id": holder, "reason": "agent offline" }),
            );
            if self.jobs.update(&job, JobStatus::Leased, &[event], now).await? {
                requeued += 1;
                warn!(job_execution_id = %job.id, agent_id = %holder, "lease expired, job requeued");
                self.registry
                    .note(&holder, now, format!("lease on job {} expired", job.id))
                    .await;
            }
        }
        Ok(requeued)
    }

    /// Apply a status post from the agent holding the lease.
    pub async fn report_status(
        &self,
        id: &JobExecutionId,
        req: StatusUpdateRequest,
        now: DateTime<Utc>,
    ) -> Result<JobExecution> {
        let agent_id = req.agent_id.trim().to_string();
        if agent_id.is_empty() {
            return Err(Error::validation("agent_id is required"));
        }
        let status = ReportedStatus::parse(&req.status)?;

        let _guard = self.lock.lock().await;
        let mut job = self.get_job(id).await?;
        let expected = job.status;
        job.apply_report(
            &StatusReport {
                agent_id: agent_id.clone(),
                status,
                output: req.output.clone(),
                exit_code: req.exit_code,
                error: req.error,
            },
            now,
        )?;

        let mut patched = false;
        for event in &req.events {
            let effect = event.effect();
            patched |= effect.is_metadata_patch();
            effect.apply(&mut job);
        }
        if !patched {
            if let Some(output) = req.output.as_deref() {
                job.metadata.extend(parse_build_summary(output));
            }
        }

        if !self.jobs.update(&job, expected, &req.events, now).await? {
            return Err(Error::Conflict(format!("job {id} changed concurrently")));
        }
        debug!(job_execution_id = %id, agent_id, status = %job.status, "status applied");

        if job.status.is_terminal() {
            info!(job_execution_id = %id, agent_id, status = %job.status, "job finished");
            self.registry
                .note(&agent_id, now, format!("job {id} {}", job.status))
                .await;
        }
        if job.status == JobStatus::Failed {
            self.cascade_failure(&job, now).await?;
        }
        Ok(job)
    }

    /// Fail a non-terminal job from the operator side.
    pub async fn force_fail(&self, id: &JobExecutionId, now: DateTime<Utc>) -> Result<JobExecution> {
        let _guard = self.lock.lock().await;
        let mut job = self.get_job(id).await?;
        let expected = job.status;
        job.force_fail(now)?;
        if !self.jobs.update(&job, expected, &[], now).await? {
            return Err(Error::Conflict(format!("job {id} changed concurrently")));
        }
        warn!(job_execution_id = %id, previous = %expected, "job force-failed");
        self.cascade_failure(&job, now).await?;
        Ok(job)
    }

    pub async fn list_events(&self, id: &JobExecutionId) -> Result<Vec<JobEvent>> {
        self.get_job(id).await?;
        self.jobs.list_events(id).await
    }

    /// Append events outside of a status post. Finished jobs keep the events
    /// but ignore their effects.
    pub async fn append_events(
        &self,
        id: &JobExecutionId,
        events: &[JobEventInput],
        now: DateTime<Utc>,
    ) -> Result<Vec<JobEvent>> {
        let _guard = self.lock.lock().await;
        let mut job = self.get_job(id).await?;
        if job.status.is_terminal() {
            return self.jobs.append_events(id, events, now).await;
        }
        let expected = job.status;
        for event in events {
            event.effect().apply(&mut job);
        }
        if !self.jobs.update(&job, expected, events, now).await? {
            return Err(Error::Conflict(format!("job {id} changed concurrently")));
        }
        self.jobs.list_events(id).await
    }

    /// Caller holds `self.lock`.
    pub(crate) async fn set_test_summary(
        &self,
        id: &JobExecutionId,
        summary: TestSummary,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut job = self.get_job(id).await?;
        let expected = job.status;
        job.test_summary = Some(summary);
        if !self.jobs.update(&job, expected, &[], now).await? {
            return Err(Error::Conflict(format!("job {id} changed concurrently")));
        }
        Ok(())
    }

    /// Delete a queued job.
    pub async fn delete_job(&self, id: &JobExecutionId) -> Result<()> {
        let _guard = self.lock.lock().await;
        if self.jobs.delete_queued(id).await? {
            self.artifacts.delete_for_jobs(std::slice::from_ref(id)).await?;
            info!(job_execution_id = %id, "queued job deleted");
            return Ok(());
        }
        match self.jobs.get(id).await? {
            None => Err(Error::JobNotFound(id.to_string())),
            Some(_) => Err(Error::validation("only queued jobs can be deleted")),
        }
    }

    /// Delete every queued and leased job. Leased jobs are abandoned.
    pub async fn clear_queue(&self) -> Result<usize> {
        let _guard = self.lock.lock().await;
        let ids = self.jobs.delete_non_terminal().await?;
        self.artifacts.delete_for_jobs(&ids).await?;
        info!(cleared = ids.len(), "queue cleared");
        Ok(ids.len())
    }

    /// Delete every finished job with its artifacts and test reports.
    pub async fn flush_history(&self) -> Result<usize> {
        let _guard = self.lock.lock().await;
        let ids = self.jobs.delete_terminal().await?;
        self.artifacts.delete_for_jobs(&ids).await?;
        info!(flushed = ids.len(), "history flushed");
        Ok(ids.len())
    }

    /// Fail queued jobs that can no longer run because `failed` did not succeed.
    async fn cascade_failure(&self, failed: &JobExecution, now: DateTime<Utc>) -> Result<usize> {
        let Some(run_id) = failed.pipeline_run_id() else {
            return Ok(0);
        };
        let run = self.jobs.list(&JobFilter::ByRun(run_id.to_string())).await?;
        let reason = format!(
            "blocked: dependency {} failed",
            failed.pipeline_job_id().unwrap_or(failed.id.as_str())
        );
        let mut blocked = 0;
        for job in blocked_by(failed, &run) {
            let mut job = job.clone();
            job.block(reason.clone(), now)?;
            if self.jobs.update(&job, JobStatus::Queued, &[], now).await? {
                blocked += 1;
                info!(job_execution_id = %job.id, pipeline_run_id = run_id, "job blocked by failed dependency");
            }
        }
        Ok(blocked)
    }
}

fn same_pipeline(a: &JobExecution, b: &JobExecution) -> bool {
    a.meta(meta::PIPELINE_ID) == b.meta(meta::PIPELINE_ID)
        && a.chain_position() == b.chain_position()
}

/// Whether every upstream job of `job` within its run has succeeded: its
/// `needs` in the same pipeline and, in a chain, every job at a lower
/// position.
pub fn dependencies_ready(job: &JobExecution, run: &[JobExecution]) -> bool {
    let needs_met = job.needs.iter().all(|need| {
        run.iter()
            .filter(|other| same_pipeline(job, other) && other.pipeline_job_id() == Some(need.as_str()))
            .all(|other| other.status == JobStatus::Succeeded)
    });
    let chain_met = match job.chain_position() {
        Some(position) if position > 0 => run
            .iter()
            .filter(|other| other.chain_position().is_some_and(|p| p < position))
            .all(|other| other.status == JobStatus::Succeeded),
        _ => true,
    };
    needs_met && chain_met
}

/// Queued jobs of `run` that transitively need `failed`, plus every queued job
/// at a later chain position.
pub fn blocked_by<'a>(failed: &JobExecution, run: &'a [JobExecution]) -> Vec<&'a JobExecution> {
    let mut failed_ids: BTreeSet<&str> = failed.pipeline_job_id().into_iter().collect();
    loop {
        let before = failed_ids.len();
        for job in run.iter().filter(|j| same_pipeline(failed, j)) {
            if job.needs.iter().any(|n| failed_ids.contains(n.as_str())) {
                if let Some(id) = job.pipeline_job_id() {
                    failed_ids.insert(id);
                }
            }
        }
        if failed_ids.len() == before {
            break;
        }
    }
    let failed_position = failed.chain_position();
    run.iter()
        .filter(|job| job.status == JobStatus::Queued && job.id != failed.id)
        .filter(|job| {
            let downstream = same_pipeline(failed, job)
                && job.needs.iter().any(|n| failed_ids.contains(n.as_str()));
            let later_in_chain = matches!(
                (failed_position, job.chain_position()),
                (Some(f), Some(p)) if p > f
            );
            downstream || later_in_chain
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{heartbeat, scheduler_with_db};
    use ciwi_core::job::{FORCE_FAIL_ERROR, FORCE_FAIL_OUTPUT};
    use serde_json::json;

    fn pipeline_job(run: &str, job_id: &str, needs: &[&str]) -> JobExecution {
        JobExecution::queued(
            NewJobExecution {
                script: format!("echo {job_id}"),
                metadata: BTreeMap::from([
                    (meta::PIPELINE_RUN_ID.to_string(), run.to_string()),
                    (meta::PIPELINE_ID.to_string(), "build".to_string()),
                    (meta::PIPELINE_JOB_ID.to_string(), job_id.to_string()),
                ]),
                needs: needs.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            },
            Utc::now(),
        )
    }

    fn status(agent: &str, status: &str) -> StatusUpdateRequest {
        StatusUpdateRequest {
            agent_id: agent.into(),
            status: status.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_dependencies_ready() {
        let mut compile = pipeline_job("run-1", "compile", &[]);
        let package = pipeline_job("run-1", "package", &["compile"]);
        assert!(!dependencies_ready(&package, &[compile.clone(), package.clone()]));
        compile.status = JobStatus::Succeeded;
        assert!(dependencies_ready(&package, &[compile, package.clone()]));
    }

    #[test]
    fn test_chain_position_gates_later_jobs() {
        let mut first = pipeline_job("run-1", "compile", &[]);
        first.metadata.insert(meta::CHAIN_POSITION.into(), "0".into());
        let mut second = pipeline_job("run-1", "publish", &[]);
        second.metadata.insert(meta::CHAIN_POSITION.into(), "1".into());
        second.metadata.insert(meta::PIPELINE_ID.into(), "release".into());
        assert!(dependencies_ready(&first, &[first.clone(), second.clone()]));
        assert!(!dependencies_ready(&second, &[first.clone(), second.clone()]));
        first.status = JobStatus::Succeeded;
        assert!(dependencies_ready(&second, &[first, second.clone()]));
    }

    #[test]
    fn test_blocked_by_is_transitive() {
        let mut compile = pipeline_job("run-1", "compile", &[]);
        compile.status = JobStatus::Failed;
        let sibling = pipeline_job("run-1", "compile", &[]);
        let package = pipeline_job("run-1", "package", &["compile"]);
        let publish = pipeline_job("run-1", "publish", &["package"]);
        let lint = pipeline_job("run-1", "lint", &[]);
        let run = vec![compile.clone(), sibling, package.clone(), publish.clone(), lint];
        let blocked: Vec<_> = blocked_by(&compile, &run).into_iter().map(|j| j.id.clone()).collect();
        assert_eq!(blocked, vec![package.id, publish.id]);
    }

    #[tokio::test]
    async fn test_lease_fifo_and_single_active_job() {
        let (scheduler, _dir) = scheduler_with_db().await;
        let now = Utc::now();
        heartbeat(&scheduler, "agent-1", &[("os", "linux")], now).await;

        let first = scheduler
            .create_job(NewJobExecution { script: "echo 1".into(), ..Default::default() }, now)
            .await
            .unwrap();
        scheduler
            .create_job(NewJobExecution { script: "echo 2".into(), ..Default::default() }, now)
            .await
            .unwrap();

        let req = LeaseRequest { agent_id: "agent-1".into(), capabilities: BTreeMap::new() };
        let lease = scheduler.lease(&req, now).await.unwrap();
        assert!(lease.assigned);
        assert_eq!(lease.job_execution.unwrap().id, first.id);

        let again = scheduler.lease(&req, now).await.unwrap();
        assert!(!again.assigned);
        assert_eq!(again.message, AGENT_HAS_ACTIVE_JOB);
    }

    #[tokio::test]
    async fn test_offline_holder_lease_is_requeued() {
        let (scheduler, _dir) = scheduler_with_db().await;
        let t0 = Utc::now();
        heartbeat(&scheduler, "agent-1", &[], t0).await;
        let job = scheduler
            .create_job(NewJobExecution { script: "make".into(), ..Default::default() }, t0)
            .await
            .unwrap();
        let first = LeaseRequest { agent_id: "agent-1".into(), capabilities: BTreeMap::new() };
        assert!(scheduler.lease(&first, t0).await.unwrap().assigned);

        // Holder still within the offline window.
        let t1 = t0 + chrono::Duration::seconds(30);
        heartbeat(&scheduler, "agent-2", &[], t1).await;
        let second = LeaseRequest { agent_id: "agent-2".into(), capabilities: BTreeMap::new() };
        assert!(!scheduler.lease(&second, t1).await.unwrap().assigned);
        assert_eq!(scheduler.get_job(&job.id).await.unwrap().status, JobStatus::Leased);

        let t2 = t0 + chrono::Duration::hours(1);
        heartbeat(&scheduler, "agent-2", &[], t2).await;
        let lease = scheduler.lease(&second, t2).await.unwrap();
        assert!(lease.assigned);
        let leased = lease.job_execution.unwrap();
        assert_eq!(leased.id, job.id);
        assert_eq!(leased.leased_by_agent_id.as_deref(), Some("agent-2"));

        let events = scheduler.list_events(&job.id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, LEASE_EXPIRED);
        assert_eq!(events[0].payload["agent_id"], "agent-1");
    }

    #[tokio::test]
    async fn test_expired_lease_returns_job_to_queue() {
        let (scheduler, _dir) = scheduler_with_db().await;
        let t0 = Utc::now();
        heartbeat(&scheduler, "agent-1", &[("os", "linux")], t0).await;
        let job = scheduler
            .create_job(
                NewJobExecution {
                    script: "make".into(),
                    required_capabilities: BTreeMap::from([("os".into(), "linux".into())]),
                    ..Default::default()
                },
                t0,
            )
            .await
            .unwrap();
        let first = LeaseRequest { agent_id: "agent-1".into(), capabilities: BTreeMap::new() };
        assert!(scheduler.lease(&first, t0).await.unwrap().assigned);

        // A poll from an agent that cannot run the job still sweeps.
        let t1 = t0 + chrono::Duration::seconds(61);
        heartbeat(&scheduler, "mac", &[("os", "darwin")], t1).await;
        let mac = LeaseRequest { agent_id: "mac".into(), capabilities: BTreeMap::new() };
        assert!(!scheduler.lease(&mac, t1).await.unwrap().assigned);

        let requeued = scheduler.get_job(&job.id).await.unwrap();
        assert_eq!(requeued.status, JobStatus::Queued);
        assert!(requeued.leased_by_agent_id.is_none());
        assert!(requeued.leased_utc.is_none());

        heartbeat(&scheduler, "agent-1", &[("os", "linux")], t1).await;
        let lease = scheduler.lease(&first, t1).await.unwrap();
        assert!(lease.assigned);
        assert_eq!(lease.job_execution.unwrap().id, job.id);
    }

    #[tokio::test]
    async fn test_running_job_is_not_requeued() {
        let (scheduler, _dir) = scheduler_with_db().await;
        let t0 = Utc::now();
        heartbeat(&scheduler, "agent-1", &[], t0).await;
        let job = scheduler
            .create_job(NewJobExecution { script: "make".into(), ..Default::default() }, t0)
            .await
            .unwrap();
        let first = LeaseRequest { agent_id: "agent-1".into(), capabilities: BTreeMap::new() };
        scheduler.lease(&first, t0).await.unwrap();
        scheduler
            .report_status(&job.id, status("agent-1", "running"), t0)
            .await
            .unwrap();

        let later = t0 + chrono::Duration::hours(1);
        heartbeat(&scheduler, "agent-2", &[], later).await;
        let second = LeaseRequest { agent_id: "agent-2".into(), capabilities: BTreeMap::new() };
        assert!(!scheduler.lease(&second, later).await.unwrap().assigned);
        assert_eq!(scheduler.get_job(&job.id).await.unwrap().status, JobStatus::Running);
    }

    #[tokio::test]
    async fn test_lease_respects_requirements() {
        let (scheduler, _dir) = scheduler_with_db().await;
        let now = Utc::now();
        heartbeat(&scheduler, "mac", &[("os", "darwin")], now).await;
        heartbeat(&scheduler, "linux", &[("os", "linux")], now).await;
        let job = scheduler
            .create_job(
                NewJobExecution {
                    script: "make".into(),
                    required_capabilities: BTreeMap::from([("os".into(), "linux".into())]),
                    ..Default::default()
                },
                now,
            )
            .await
            .unwrap();
        assert!(job.unmet_requirements.is_empty());

        let mac = LeaseRequest { agent_id: "mac".into(), capabilities: BTreeMap::new() };
        let lease = scheduler.lease(&mac, now).await.unwrap();
        assert!(!lease.assigned);
        assert_eq!(lease.message, "");

        let linux = LeaseRequest { agent_id: "linux".into(), capabilities: BTreeMap::new() };
        assert!(scheduler.lease(&linux, now).await.unwrap().assigned);
    }

    #[tokio::test]
    async fn test_status_lifecycle_and_events() {
        let (scheduler, _dir) = scheduler_with_db().await;
        let now = Utc::now();
        heartbeat(&scheduler, "agent-1", &[], now).await;
        let job = scheduler
            .create_job(NewJobExecution { script: "make".into(), ..Default::default() }, now)
            .await
            .unwrap();
        let req = LeaseRequest { agent_id: "agent-1".into(), capabilities: BTreeMap::new() };
        scheduler.lease(&req, now).await.unwrap();

        let err = scheduler
            .report_status(&job.id, status("agent-2", "running"), now)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ciwi_core::ErrorKind::Validation);
        assert!(scheduler
            .report_status(&job.id, status("agent-1", "queued"), now)
            .await
            .is_err());

        let mut running = status("agent-1", "running");
        running.output = Some("compiling\n".into());
        running.events = vec![
            JobEventInput::new("step.started", json!({"step": {"index": 1, "total": 2, "name": "build"}})),
            JobEventInput::new("custom.audit", json!({"note": "kept"})),
        ];
        let job = scheduler.report_status(&job.id, running, now).await.unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.current_step.as_ref().unwrap().name, "build");

        let mut done = status("agent-1", "succeeded");
        done.exit_code = Some(0);
        done.output = Some("__CIWI_BUILD_SUMMARY__ target=linux-amd64 version=v1.0.0 output=dist/app\n".into());
        let job = scheduler.report_status(&job.id, done, now).await.unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.metadata[meta::BUILD_VERSION], "v1.0.0");
        assert!(job.output.starts_with("compiling\n"));

        let events = scheduler.list_events(&job.id).await.unwrap();
        let types: Vec<_> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, vec!["step.started", "custom.audit"]);

        let late = scheduler
            .report_status(&job.id, status("agent-1", "running"), now)
            .await;
        assert!(late.is_err());
    }

    #[tokio::test]
    async fn test_metadata_patch_wins_over_summary_line() {
        let (scheduler, _dir) = scheduler_with_db().await;
        let now = Utc::now();
        heartbeat(&scheduler, "agent-1", &[], now).await;
        let job = scheduler
            .create_job(NewJobExecution { script: "make".into(), ..Default::default() }, now)
            .await
            .unwrap();
        let req = LeaseRequest { agent_id: "agent-1".into(), capabilities: BTreeMap::new() };
        scheduler.lease(&req, now).await.unwrap();

        let mut done = status("agent-1", "succeeded");
        done.output = Some("__CIWI_BUILD_SUMMARY__ version=v0.0.1\n".into());
        done.events = vec![JobEventInput::new(
            "metadata.patch",
            json!({"metadata": {"build_version": "v2.0.0"}}),
        )];
        let job = scheduler.report_status(&job.id, done, now).await.unwrap();
        assert_eq!(job.metadata[meta::BUILD_VERSION], "v2.0.0");
    }

    #[tokio::test]
    async fn test_force_fail_then_flush() {
        let (scheduler, _dir) = scheduler_with_db().await;
        let now = Utc::now();
        heartbeat(&scheduler, "agent-1", &[], now).await;
        let job = scheduler
            .create_job(NewJobExecution { script: "sleep 600".into(), ..Default::default() }, now)
            .await
            .unwrap();
        let req = LeaseRequest { agent_id: "agent-1".into(), capabilities: BTreeMap::new() };
        scheduler.lease(&req, now).await.unwrap();
        scheduler
            .report_status(&job.id, status("agent-1", "running"), now)
            .await
            .unwrap();

        let failed = scheduler.force_fail(&job.id, now).await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some(FORCE_FAIL_ERROR));
        assert!(failed.output.contains(FORCE_FAIL_OUTPUT));
        assert!(failed.leased_by_agent_id.is_none());

        let again = scheduler.force_fail(&job.id, now).await.unwrap_err();
        assert_eq!(again.kind(), ciwi_core::ErrorKind::Conflict);

        // The agent is free again.
        assert!(!scheduler.lease(&req, now).await.unwrap().assigned);
        assert_eq!(scheduler.lease(&req, now).await.unwrap().message, "");

        assert_eq!(scheduler.flush_history().await.unwrap(), 1);
        let gone = scheduler.get_job(&job.id).await.unwrap_err();
        assert_eq!(gone.kind(), ciwi_core::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_failure_blocks_downstream() {
        let (scheduler, _dir) = scheduler_with_db().await;
        let now = Utc::now();
        heartbeat(&scheduler, "agent-1", &[], now).await;
        let compile = pipeline_job("run-9", "compile", &[]);
        let package = pipeline_job("run-9", "package", &["compile"]);
        scheduler
            .jobs
            .create_many(&[compile.clone(), package.clone()])
            .await
            .unwrap();

        let req = LeaseRequest { agent_id: "agent-1".into(), capabilities: BTreeMap::new() };
        let lease = scheduler.lease(&req, now).await.unwrap();
        assert_eq!(lease.job_execution.unwrap().id, compile.id);
        scheduler
            .report_status(&compile.id, status("agent-1", "failed"), now)
            .await
            .unwrap();

        let package = scheduler.get_job(&package.id).await.unwrap();
        assert_eq!(package.status, JobStatus::Failed);
        assert_eq!(package.error.as_deref(), Some("blocked: dependency compile failed"));
        assert!(!scheduler.lease(&req, now).await.unwrap().assigned);
    }

    #[tokio::test]
    async fn test_run_script_validation() {
        let (scheduler, _dir) = scheduler_with_db().await;
        let now = Utc::now();
        heartbeat(
            &scheduler,
            "agent-run",
            &[("executor", "script"), ("shells", "posix,cmd")],
            now,
        )
        .await;

        let ok = scheduler
            .run_script(
                "agent-run",
                RunScriptRequest { shell: "posix".into(), script: "echo hi".into(), timeout_seconds: 30 },
                now,
            )
            .await
            .unwrap();
        assert!(ok.queued);
        let job = scheduler.get_job(&ok.job_execution_id).await.unwrap();
        assert_eq!(job.required_capabilities[caps::AGENT_ID], "agent-run");
        assert_eq!(job.required_capabilities[caps::SHELL], "posix");
        assert_eq!(job.metadata[meta::ADHOC], "1");

        let err = scheduler
            .run_script(
                "agent-run",
                RunScriptRequest { shell: "powershell".into(), script: "echo hi".into(), timeout_seconds: 30 },
                now,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("does not support requested shell"));

        let missing = scheduler
            .run_script("ghost", RunScriptRequest::default(), now)
            .await
            .unwrap_err();
        assert_eq!(missing.kind(), ciwi_core::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_delete_only_queued() {
        let (scheduler, _dir) = scheduler_with_db().await;
        let now = Utc::now();
        heartbeat(&scheduler, "agent-1", &[], now).await;
        let a = scheduler
            .create_job(NewJobExecution { script: "a".into(), ..Default::default() }, now)
            .await
            .unwrap();
        let b = scheduler
            .create_job(NewJobExecution { script: "b".into(), ..Default::default() }, now)
            .await
            .unwrap();
        let req = LeaseRequest { agent_id: "agent-1".into(), capabilities: BTreeMap::new() };
        scheduler.lease(&req, now).await.unwrap();

        let err = scheduler.delete_job(&a.id).await.unwrap_err();
        assert_eq!(err.to_string(), "only queued jobs can be deleted");
        scheduler.delete_job(&b.id).await.unwrap();
        assert!(scheduler.delete_job(&b.id).await.is_err());

        assert_eq!(scheduler.clear_queue().await.unwrap(), 1);
        assert!(scheduler.list_jobs().await.unwrap().is_empty());
    }
}
