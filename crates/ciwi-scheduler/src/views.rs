//! Summary, queued, and history views over job executions.

use ciwi_core::ids::JobExecutionId;
use ciwi_core::job::{JobExecution, JobStatus};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

pub const DEFAULT_PAGE_LIMIT: usize = 50;
pub const MAX_PAGE_LIMIT: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobView {
    Summary,
    Queued,
    History,
}

impl JobView {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "summary" => Some(Self::Summary),
            "queued" => Some(Self::Queued),
            "history" => Some(Self::History),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Page {
    pub fn new(offset: Option<usize>, limit: Option<usize>) -> Self {
        Self {
            offset: offset.unwrap_or(0),
            limit: limit
                .filter(|&l| l > 0)
                .unwrap_or(DEFAULT_PAGE_LIMIT)
                .min(MAX_PAGE_LIMIT),
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(None, None)
    }
}

/// Jobs sharing a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobGroup {
    pub pipeline_run_id: String,
    pub job_execution_ids: Vec<JobExecutionId>,
    pub collapsible: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobsSummary {
    pub total: usize,
    pub queued: usize,
    pub leased: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub queued_groups: usize,
    pub history_groups: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPage {
    pub job_executions: Vec<JobExecution>,
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
    pub groups: Vec<JobGroup>,
}

pub fn summary(jobs: &[JobExecution]) -> JobsSummary {
    let count = |status: JobStatus| jobs.iter().filter(|j| j.status == status).count();
    let distinct_runs = |terminal: bool| {
        jobs.iter()
            .filter(|j| j.status.is_terminal() == terminal)
            .filter_map(JobExecution::pipeline_run_id)
            .collect::<BTreeSet<_>>()
            .len()
    };
    JobsSummary {
        total: jobs.len(),
        queued: count(JobStatus::Queued),
        leased: count(JobStatus::Leased),
        running: count(JobStatus::Running),
        succeeded: count(JobStatus::Succeeded),
        failed: count(JobStatus::Failed),
        queued_groups: distinct_runs(false),
        history_groups: distinct_runs(true),
    }
}

/// Non-terminal jobs, oldest first.
pub fn queued_page(jobs: Vec<JobExecution>, page: Page) -> JobPage {
    let mut rows: Vec<_> = jobs.into_iter().filter(|j| !j.status.is_terminal()).collect();
    rows.sort_by(|a, b| a.created_utc.cmp(&b.created_utc));
    paginate(rows, page)
}

/// Finished jobs, most recently finished first.
pub fn history_page(jobs: Vec<JobExecution>, page: Page) -> JobPage {
    let mut rows: Vec<_> = jobs.into_iter().filter(|j| j.status.is_terminal()).collect();
    rows.sort_by(|a, b| b.finished_utc.cmp(&a.finished_utc));
    paginate(rows, page)
}

fn paginate(rows: Vec<JobExecution>, page: Page) -> JobPage {
    let total = rows.len();
    let job_executions: Vec<_> = rows.into_iter().skip(page.offset).take(page.limit).collect();
    let groups = groups(&job_executions);
    JobPage {
        job_executions,
        total,
        offset: page.offset,
        limit: page.limit,
        groups,
    }
}

/// Groups in order of first appearance.
pub fn groups(jobs: &[JobExecution]) -> Vec<JobGroup> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut groups: Vec<JobGroup> = Vec::new();
    for job in jobs {
        let Some(run_id) = job.pipeline_run_id() else {
            continue;
        };
        let slot = *index.entry(run_id).or_insert_with(|| {
            groups.push(JobGroup {
                pipeline_run_id: run_id.to_string(),
                job_execution_ids: Vec::new(),
                collapsible: false,
            });
            groups.len() - 1
        });
        groups[slot].job_execution_ids.push(job.id.clone());
    }
    for group in &mut groups {
        group.collapsible = group.job_execution_ids.len() >= 2;
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use ciwi_core::job::{NewJobExecution, meta};
    use std::collections::BTreeMap;

    fn job(run: Option<&str>, status: JobStatus, minutes: i64) -> JobExecution {
        let base = Utc::now();
        let mut job = JobExecution::queued(
            NewJobExecution {
                script: "true".into(),
                metadata: run
                    .map(|r| BTreeMap::from([(meta::PIPELINE_RUN_ID.to_string(), r.to_string())]))
                    .unwrap_or_default(),
                ..Default::default()
            },
            base + Duration::minutes(minutes),
        );
        job.status = status;
        if status.is_terminal() {
            job.finished_utc = Some(base + Duration::minutes(minutes + 1));
        }
        job
    }

    #[test]
    fn test_page_limits() {
        assert_eq!(Page::default(), Page { offset: 0, limit: 50 });
        assert_eq!(Page::new(Some(10), Some(10_000)).limit, MAX_PAGE_LIMIT);
        assert_eq!(Page::new(None, Some(0)).limit, DEFAULT_PAGE_LIMIT);
        assert_eq!(JobView::parse("history"), Some(JobView::History));
        assert_eq!(JobView::parse("everything"), None);
    }

    #[test]
    fn test_summary_counts_groups() {
        let jobs = vec![
            job(Some("run-a"), JobStatus::Queued, 0),
            job(Some("run-a"), JobStatus::Running, 1),
            job(Some("run-b"), JobStatus::Succeeded, 2),
            job(None, JobStatus::Failed, 3),
        ];
        let summary = summary(&jobs);
        assert_eq!(summary.total, 4);
        assert_eq!(summary.queued, 1);
        assert_eq!(summary.running, 1);
        assert_eq!(summary.queued_groups, 1);
        assert_eq!(summary.history_groups, 1);
    }

    #[test]
    fn test_queued_and_history_ordering() {
        let jobs = vec![
            job(Some("run-a"), JobStatus::Succeeded, 0),
            job(Some("run-b"), JobStatus::Queued, 5),
            job(Some("run-b"), JobStatus::Queued, 1),
            job(Some("run-a"), JobStatus::Failed, 3),
        ];
        let queued = queued_page(jobs.clone(), Page::default());
        assert_eq!(queued.total, 2);
        assert!(queued.job_executions[0].created_utc < queued.job_executions[1].created_utc);
        assert_eq!(queued.groups.len(), 1);
        assert!(queued.groups[0].collapsible);

        let history = history_page(jobs, Page::new(Some(0), Some(1)));
        assert_eq!(history.total, 2);
        assert_eq!(history.job_executions.len(), 1);
        assert_eq!(history.job_executions[0].status, JobStatus::Failed);
        assert!(!history.groups[0].collapsible);
    }
}
