//! Artifact and test-report uploads for job executions.

use crate::scheduler::Scheduler;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use ciwi_core::artifact::{
    Artifact, StoredTestReport, UploadArtifactsRequest, UploadTestReportRequest,
    normalize_artifact_path,
};
use ciwi_core::ids::JobExecutionId;
use ciwi_core::{Error, Result};
use tracing::info;

impl Scheduler {
    /// Decode and store every file in the upload. All paths are validated
    /// before anything is written.
    ///
    /// The existence check and the writes share the scheduler lock so a
    /// concurrent delete or flush cannot leave files behind.
    pub async fn upload_artifacts(
        &self,
        id: &JobExecutionId,
        req: UploadArtifactsRequest,
    ) -> Result<Vec<Artifact>> {
        let mut files = Vec::with_capacity(req.artifacts.len());
        for upload in &req.artifacts {
            let path = normalize_artifact_path(&upload.path)?;
            let data = STANDARD.decode(upload.data_base64.trim()).map_err(|e| {
                Error::validation(format!("artifact {path} is not valid base64: {e}"))
            })?;
            files.push((path, data));
        }

        let _guard = self.lock.lock().await;
        self.get_job(id).await?;
        for (path, data) in &files {
            self.artifacts.upsert(id, path, data).await?;
        }
        info!(job_execution_id = %id, agent_id = %req.agent_id, files = files.len(), "artifacts uploaded");
        self.artifacts.list(id).await
    }

    pub async fn list_artifacts(&self, id: &JobExecutionId) -> Result<Vec<Artifact>> {
        self.get_job(id).await?;
        self.artifacts.list(id).await
    }

    /// Zip of every artifact of the job.
    pub async fn artifact_bundle(&self, id: &JobExecutionId) -> Result<Vec<u8>> {
        self.get_job(id).await?;
        self.artifacts.bundle(id).await
    }

    pub async fn read_artifact(&self, id: &JobExecutionId, raw_path: &str) -> Result<(Artifact, Vec<u8>)> {
        let path = normalize_artifact_path(raw_path)?;
        self.artifacts
            .read(id, &path)
            .await?
            .ok_or_else(|| Error::NotFound(format!("artifact {path}")))
    }

    /// Store a test report and copy its totals onto the job.
    pub async fn upload_test_report(
        &self,
        id: &JobExecutionId,
        req: UploadTestReportRequest,
        now: DateTime<Utc>,
    ) -> Result<StoredTestReport> {
        let _guard = self.lock.lock().await;
        self.get_job(id).await?;
        let stored = self.artifacts.store_test_report(id, &req.report).await?;
        self.set_test_summary(id, stored.summary.clone(), now).await?;
        info!(
            job_execution_id = %id,
            total = stored.summary.total,
            failed = stored.summary.failed,
            "test report stored"
        );
        Ok(stored)
    }

    pub async fn test_report(&self, id: &JobExecutionId) -> Result<StoredTestReport> {
        self.get_job(id).await?;
        self.artifacts
            .get_test_report(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("test report for job {id}")))
    }
}
