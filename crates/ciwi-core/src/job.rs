//! Job executions and their status state machine.

use crate::artifact::TestSummary;
use crate::ids::JobExecutionId;
use crate::redact::redact;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Reserved metadata keys.
pub mod meta {
    pub const ADHOC: &str = "adhoc";
    pub const MATRIX_NAME: &str = "matrix_name";
    pub const PROJECT: &str = "project";
    pub const PROJECT_ID: &str = "project_id";
    pub const PIPELINE_ID: &str = "pipeline_id";
    pub const PIPELINE_JOB_ID: &str = "pipeline_job_id";
    pub const PIPELINE_RUN_ID: &str = "pipeline_run_id";
    pub const PIPELINE_VERSION: &str = "pipeline_version";
    pub const PIPELINE_CHAIN_ID: &str = "pipeline_chain_id";
    pub const CHAIN_POSITION: &str = "chain_position";
    pub const DRY_RUN: &str = "dry_run";
    pub const BUILD_TARGET: &str = "build_target";
    pub const BUILD_VERSION: &str = "build_version";
    pub const BUILD_OUTPUT: &str = "build_output";
}

/// Marker appended to output when an operator force-fails a job.
pub const FORCE_FAIL_OUTPUT: &str = "[control] job force-failed from UI";
pub const FORCE_FAIL_ERROR: &str = "force-failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Leased,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::Leased,
        JobStatus::Running,
        JobStatus::Succeeded,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Leased => "leased",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == raw.trim())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }

    /// Leased or running: the job occupies its agent.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Leased | JobStatus::Running)
    }

    fn invalid(self, to: JobStatus) -> Error {
        Error::InvalidTransition {
            from: self.as_str().to_string(),
            to: to.as_str().to_string(),
        }
    }

    pub fn lease(self) -> Result<Self> {
        match self {
            JobStatus::Queued => Ok(JobStatus::Leased),
            other => Err(other.invalid(JobStatus::Leased)),
        }
    }

    pub fn requeue(self) -> Result<Self> {
        match self {
            JobStatus::Leased => Ok(JobStatus::Queued),
            other => Err(other.invalid(JobStatus::Queued)),
        }
    }

    /// Progress report from the leasing agent. Repeated `running` posts are
    /// accepted.
    pub fn start(self) -> Result<Self> {
        match self {
            JobStatus::Leased | JobStatus::Running => Ok(JobStatus::Running),
            other => Err(other.invalid(JobStatus::Running)),
        }
    }

    pub fn finish(self, outcome: Outcome) -> Result<Self> {
        let to = outcome.status();
        match self {
            JobStatus::Leased | JobStatus::Running => Ok(to),
            other => Err(other.invalid(to)),
        }
    }

    pub fn force_fail(self) -> Result<Self> {
        if self.is_terminal() {
            return Err(Error::Conflict(format!(
                "job is already {}",
                self.as_str()
            )));
        }
        Ok(JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Failed,
}

impl Outcome {
    pub fn status(self) -> JobStatus {
        match self {
            Outcome::Succeeded => JobStatus::Succeeded,
            Outcome::Failed => JobStatus::Failed,
        }
    }
}

/// Status an agent may report for its leased job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportedStatus {
    Running,
    Finished(Outcome),
}

impl ReportedStatus {
    pub fn parse(raw: &str) -> Result<Self> {
        match JobStatus::parse(raw) {
            Some(JobStatus::Running) => Ok(ReportedStatus::Running),
            Some(JobStatus::Succeeded) => Ok(ReportedStatus::Finished(Outcome::Succeeded)),
            Some(JobStatus::Failed) => Ok(ReportedStatus::Finished(Outcome::Failed)),
            _ => Err(Error::validation(
                "status must be one of running, succeeded, failed",
            )),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSource {
    pub repo: String,
    #[serde(rename = "ref", default)]
    pub git_ref: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSpec {
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub env: String,
}

/// Step progress reported through `step.*` events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepProgress {
    pub index: u32,
    pub total: u32,
    pub name: String,
    #[serde(default)]
    pub finished: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExecution {
    pub id: JobExecutionId,
    pub script: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub required_capabilities: BTreeMap<String, String>,
    #[serde(default)]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub artifact_globs: Vec<String>,
    #[serde(default)]
    pub caches: Vec<CacheSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<JobSource>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Pipeline job ids that must succeed in the same run first.
    #[serde(default)]
    pub needs: Vec<String>,
    pub status: JobStatus,
    pub created_utc: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leased_utc: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_utc: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_utc: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leased_by_agent_id: Option<String>,
    /// Agent that last held the lease. Survives completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executed_by_agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub unmet_requirements: Vec<String>,
    #[serde(default)]
    pub sensitive_values: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_summary: Option<TestSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<StepProgress>,
}

impl JobExecution {
    /// Materialize a queued job from a creation request.
    pub fn queued(new: NewJobExecution, now: DateTime<Utc>) -> Self {
        Self {
            id: JobExecutionId::new(),
            script: new.script,
            env: new.env,
            required_capabilities: new.required_capabilities,
            timeout_seconds: new.timeout_seconds,
            artifact_globs: new.artifact_globs,
            caches: new.caches,
            source: new.source,
            metadata: new.metadata,
            needs: new.needs,
            status: JobStatus::Queued,
            created_utc: now,
            leased_utc: None,
            started_utc: None,
            finished_utc: None,
            leased_by_agent_id: None,
            executed_by_agent_id: None,
            exit_code: None,
            error: None,
            output: String::new(),
            unmet_requirements: Vec::new(),
            sensitive_values: new.sensitive_values,
            test_summary: None,
            current_step: None,
        }
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    pub fn pipeline_run_id(&self) -> Option<&str> {
        self.meta(meta::PIPELINE_RUN_ID)
    }

    pub fn pipeline_job_id(&self) -> Option<&str> {
        self.meta(meta::PIPELINE_JOB_ID)
    }

    pub fn chain_position(&self) -> Option<u32> {
        self.meta(meta::CHAIN_POSITION)?.parse().ok()
    }

    pub fn is_dry_run(&self) -> bool {
        self.meta(meta::DRY_RUN) == Some("1")
    }

    pub fn lease_to(&mut self, agent_id: &str, now: DateTime<Utc>) -> Result<()> {
        self.status = self.status.lease()?;
        self.leased_by_agent_id = Some(agent_id.to_string());
        self.executed_by_agent_id = Some(agent_id.to_string());
        self.leased_utc = Some(now);
        Ok(())
    }

    pub fn return_to_queue(&mut self) -> Result<()> {
        self.status = self.status.requeue()?;
        self.leased_by_agent_id = None;
        self.executed_by_agent_id = None;
        self.leased_utc = None;
        Ok(())
    }

    /// Apply a status report from the agent holding the lease.
    pub fn apply_report(&mut self, report: &StatusReport, now: DateTime<Utc>) -> Result<()> {
        if self.status.is_terminal() {
            let to = match report.status {
                ReportedStatus::Running => JobStatus::Running,
                ReportedStatus::Finished(outcome) => outcome.status(),
            };
            return Err(self.status.invalid(to));
        }
        match self.leased_by_agent_id.as_deref() {
            Some(holder) if holder == report.agent_id => {}
            _ => {
                return Err(Error::validation(format!(
                    "job is not leased by agent {}",
                    report.agent_id
                )));
            }
        }
        self.status = match report.status {
            ReportedStatus::Running => self.status.start()?,
            ReportedStatus::Finished(outcome) => self.status.finish(outcome)?,
        };
        if report.status == ReportedStatus::Running && self.started_utc.is_none() {
            self.started_utc = Some(now);
        }
        if self.status.is_terminal() {
            self.leased_by_agent_id = None;
            if self.finished_utc.is_none() {
                self.finished_utc = Some(now);
            }
        }
        if let Some(chunk) = report.output.as_deref() {
            self.append_output(chunk);
        }
        if report.exit_code.is_some() {
            self.exit_code = report.exit_code;
        }
        if let Some(error) = report.error.as_deref().filter(|e| !e.is_empty()) {
            self.error = Some(redact(error, &self.sensitive_values));
        }
        Ok(())
    }

    pub fn force_fail(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.status = self.status.force_fail()?;
        self.error = Some(FORCE_FAIL_ERROR.to_string());
        self.append_line(FORCE_FAIL_OUTPUT);
        self.leased_by_agent_id = None;
        if self.finished_utc.is_none() {
            self.finished_utc = Some(now);
        }
        Ok(())
    }

    /// Fail a queued job whose upstream cannot succeed any more.
    pub fn block(&mut self, reason: String, now: DateTime<Utc>) -> Result<()> {
        if self.status != JobStatus::Queued {
            return Err(self.status.invalid(JobStatus::Failed));
        }
        self.status = JobStatus::Failed;
        self.error = Some(reason);
        self.finished_utc = Some(now);
        Ok(())
    }

    /// Append a chunk of agent output with sensitive values masked.
    ///
    /// The unmasked tail of the buffer is re-scanned together with the chunk
    /// so a value split across two posts is still caught.
    pub fn append_output(&mut self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        let longest = self
            .sensitive_values
            .iter()
            .filter(|v| !v.trim().is_empty())
            .map(String::len)
            .max()
            .unwrap_or(0);
        let mut start = self.output.len().saturating_sub(longest.saturating_sub(1));
        while !self.output.is_char_boundary(start) {
            start -= 1;
        }
        let mut pending = self.output.split_off(start);
        pending.push_str(chunk);
        self.output.push_str(&redact(&pending, &self.sensitive_values));
    }

    fn append_line(&mut self, line: &str) {
        if !self.output.is_empty() && !self.output.ends_with('\n') {
            self.output.push('\n');
        }
        self.output.push_str(line);
        self.output.push('\n');
    }
}

/// Request body for creating a raw job execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewJobExecution {
    pub script: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub required_capabilities: BTreeMap<String, String>,
    #[serde(default)]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub artifact_globs: Vec<String>,
    #[serde(default)]
    pub caches: Vec<CacheSpec>,
    #[serde(default)]
    pub source: Option<JobSource>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub needs: Vec<String>,
    #[serde(default)]
    pub sensitive_values: Vec<String>,
}

/// A validated status post.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub agent_id: String,
    pub status: ReportedStatus,
    pub output: Option<String>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeaseRequest {
    #[serde(default)]
    pub agent_id: String,
    #[serde(default)]
    pub capabilities: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseResponse {
    pub assigned: bool,
    pub job_execution: Option<JobExecution>,
    pub message: String,
}

impl LeaseResponse {
    pub fn assigned(job: JobExecution) -> Self {
        Self {
            assigned: true,
            job_execution: Some(job),
            message: String::new(),
        }
    }

    pub fn none(message: impl Into<String>) -> Self {
        Self {
            assigned: false,
            job_execution: None,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> JobExecution {
        JobExecution::queued(
            NewJobExecution {
                script: "echo hi".into(),
                sensitive_values: vec!["hunter2".into()],
                ..Default::default()
            },
            Utc::now(),
        )
    }

    fn report(agent: &str, status: ReportedStatus) -> StatusReport {
        StatusReport {
            agent_id: agent.into(),
            status,
            output: None,
            exit_code: None,
            error: None,
        }
    }

    #[test]
    fn test_status_transitions() {
        assert_eq!(JobStatus::Queued.lease().unwrap(), JobStatus::Leased);
        assert!(JobStatus::Leased.lease().is_err());
        assert_eq!(JobStatus::Leased.requeue().unwrap(), JobStatus::Queued);
        assert!(JobStatus::Queued.requeue().is_err());
        assert_eq!(JobStatus::Leased.start().unwrap(), JobStatus::Running);
        assert!(JobStatus::Queued.start().is_err());
        assert_eq!(
            JobStatus::Running.finish(Outcome::Succeeded).unwrap(),
            JobStatus::Succeeded
        );
        assert!(JobStatus::Succeeded.finish(Outcome::Failed).is_err());
        assert_eq!(JobStatus::Queued.force_fail().unwrap(), JobStatus::Failed);
        assert!(matches!(
            JobStatus::Failed.force_fail(),
            Err(Error::Conflict(_))
        ));
    }

    #[test]
    fn test_reported_status_rejects_queued() {
        assert!(ReportedStatus::parse("queued").is_err());
        assert!(ReportedStatus::parse("leased").is_err());
        assert_eq!(
            ReportedStatus::parse("failed").unwrap(),
            ReportedStatus::Finished(Outcome::Failed)
        );
    }

    #[test]
    fn test_report_lifecycle_sets_timestamps_once() {
        let mut job = job();
        let t0 = Utc::now();
        job.lease_to("agent-1", t0).unwrap();
        job.apply_report(&report("agent-1", ReportedStatus::Running), t0)
            .unwrap();
        let started = job.started_utc;
        assert!(started.is_some());
        let t1 = t0 + chrono::Duration::seconds(5);
        job.apply_report(&report("agent-1", ReportedStatus::Running), t1)
            .unwrap();
        assert_eq!(job.started_utc, started);
        job.apply_report(
            &report("agent-1", ReportedStatus::Finished(Outcome::Succeeded)),
            t1,
        )
        .unwrap();
        assert_eq!(job.finished_utc, Some(t1));
        assert!(job
            .apply_report(&report("agent-1", ReportedStatus::Running), t1)
            .is_err());
    }

    #[test]
    fn test_report_from_other_agent_rejected() {
        let mut job = job();
        job.lease_to("agent-1", Utc::now()).unwrap();
        assert!(job
            .apply_report(&report("agent-2", ReportedStatus::Running), Utc::now())
            .is_err());
    }

    #[test]
    fn test_output_is_redacted() {
        let mut job = job();
        job.append_output("token=hunter2\n");
        assert_eq!(job.output, "token=***\n");
    }

    #[test]
    fn test_output_redacts_value_split_across_chunks() {
        let mut job = job();
        job.append_output("token=hun");
        job.append_output("ter2 done\n");
        assert_eq!(job.output, "token=*** done\n");
        job.append_output("héllo hunter");
        job.append_output("2");
        assert_eq!(job.output, "token=*** done\nhéllo ***");
    }

    #[test]
    fn test_finish_without_running_leaves_started_unset() {
        let mut job = job();
        let t0 = Utc::now();
        job.lease_to("agent-1", t0).unwrap();
        job.apply_report(
            &report("agent-1", ReportedStatus::Finished(Outcome::Failed)),
            t0,
        )
        .unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.started_utc.is_none());
        assert_eq!(job.finished_utc, Some(t0));
    }

    #[test]
    fn test_force_fail_clears_lease() {
        let mut job = job();
        job.lease_to("agent-1", Utc::now()).unwrap();
        job.force_fail(Utc::now()).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some(FORCE_FAIL_ERROR));
        assert!(job.output.contains(FORCE_FAIL_OUTPUT));
        assert!(job.leased_by_agent_id.is_none());
        assert!(job.force_fail(Utc::now()).is_err());
    }
}
