//! Artifacts and test reports attached to job executions.

use crate::ids::JobExecutionId;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Name of the synthetic artifact that mirrors a stored test report.
pub const TEST_REPORT_ARTIFACT: &str = "test-report.json";

/// Stored artifact metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub job_execution_id: JobExecutionId,
    pub path: String,
    pub content_type: String,
    pub size_bytes: u64,
    /// Location of the file relative to the artifact root.
    pub stored_path: String,
    pub url: String,
}

impl Artifact {
    pub fn new(job_id: &JobExecutionId, path: &str, size_bytes: u64) -> Self {
        let stored_path = format!("{}/{}", job_id, path);
        Self {
            job_execution_id: job_id.clone(),
            path: path.to_string(),
            content_type: content_type_for(path).to_string(),
            size_bytes,
            url: format!("/artifacts/{stored_path}"),
            stored_path,
        }
    }
}

/// One file in an artifact upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactUpload {
    pub path: String,
    pub data_base64: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadArtifactsRequest {
    #[serde(default)]
    pub agent_id: String,
    #[serde(default)]
    pub artifacts: Vec<ArtifactUpload>,
}

/// Normalize an uploaded artifact path into a forward-slash relative path.
///
/// Rejects absolute escapes, `..` segments, and empty paths.
pub fn normalize_artifact_path(raw: &str) -> Result<String> {
    let replaced = raw.trim().replace('\\', "/");
    let mut segments = Vec::new();
    for segment in replaced.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                return Err(Error::validation(format!("invalid artifact path: {raw}")));
            }
            other => segments.push(other),
        }
    }
    if segments.is_empty() {
        return Err(Error::validation("artifact path is required"));
    }
    Ok(segments.join("/"))
}

pub fn content_type_for(path: &str) -> &'static str {
    let ext = path
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "json" => "application/json",
        "txt" | "log" => "text/plain; charset=utf-8",
        "html" | "htm" => "text/html; charset=utf-8",
        "xml" => "application/xml",
        "zip" => "application/zip",
        "gz" | "tgz" => "application/gzip",
        "png" => "image/png",
        "svg" => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestCaseStatus {
    Pass,
    Fail,
    Skip,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    #[serde(default)]
    pub package: String,
    pub name: String,
    pub status: TestCaseStatus,
    #[serde(default)]
    pub duration_seconds: f64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestSuite {
    pub name: String,
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub cases: Vec<TestCase>,
}

impl TestSuite {
    pub fn summary(&self) -> SuiteSummary {
        let mut summary = SuiteSummary {
            name: self.name.clone(),
            ..SuiteSummary::default()
        };
        for case in &self.cases {
            summary.total += 1;
            match case.status {
                TestCaseStatus::Pass => summary.passed += 1,
                TestCaseStatus::Fail => summary.failed += 1,
                TestCaseStatus::Skip => summary.skipped += 1,
            }
        }
        summary
    }
}

/// Test report uploaded by an agent after running test steps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestReport {
    #[serde(default)]
    pub suites: Vec<TestSuite>,
}

impl TestReport {
    pub fn summary(&self) -> TestSummary {
        let suites: Vec<SuiteSummary> = self.suites.iter().map(TestSuite::summary).collect();
        let mut summary = TestSummary::default();
        for suite in &suites {
            summary.total += suite.total;
            summary.passed += suite.passed;
            summary.failed += suite.failed;
            summary.skipped += suite.skipped;
        }
        summary.suites = suites;
        summary
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuiteSummary {
    pub name: String,
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
}

/// Aggregated totals stored on the job execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSummary {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    #[serde(default)]
    pub suites: Vec<SuiteSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadTestReportRequest {
    #[serde(default)]
    pub agent_id: String,
    pub report: TestReport,
}

/// A stored report together with its aggregates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredTestReport {
    pub job_execution_id: JobExecutionId,
    pub summary: TestSummary,
    pub suites: Vec<TestSuite>,
}
