//! Artifact files on disk with their metadata and test reports in SQLite.

use crate::{db_err, decode_json, encode_json, encode_ts};
use async_trait::async_trait;
use chrono::Utc;
use ciwi_core::artifact::{Artifact, StoredTestReport, TEST_REPORT_ARTIFACT, TestReport};
use ciwi_core::ids::JobExecutionId;
use ciwi_core::ports::ArtifactRepository;
use ciwi_core::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

pub struct SqliteArtifactRepository {
    pool: SqlitePool,
    root: PathBuf,
}

impl SqliteArtifactRepository {
    pub fn new(pool: SqlitePool, root: impl Into<PathBuf>) -> Self {
        Self {
            pool,
            root: root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn row_to_artifact(r: &SqliteRow) -> Artifact {
        Artifact {
            job_execution_id: JobExecutionId::from(r.get::<String, _>("job_execution_id")),
            path: r.get("path"),
            content_type: r.get("content_type"),
            size_bytes: r.get::<i64, _>("size_bytes").max(0) as u64,
            stored_path: r.get("stored_path"),
            url: r.get("url"),
        }
    }

    async fn find(&self, job_id: &JobExecutionId, path: &str) -> Result<Option<Artifact>> {
        let row = sqlx::query(
            "SELECT job_execution_id, path, content_type, size_bytes, stored_path, url FROM job_artifacts WHERE job_execution_id = ? AND path = ?",
        )
        .bind(job_id.as_str())
        .bind(path)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.as_ref().map(Self::row_to_artifact))
    }
}

fn build_zip(entries: Vec<(String, Vec<u8>)>) -> Result<Vec<u8>> {
    let zip_err = |e: zip::result::ZipError| Error::Internal(format!("zip: {e}"));
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    for (path, data) in entries {
        writer.start_file(path, options).map_err(zip_err)?;
        writer.write_all(&data)?;
    }
    Ok(writer.finish().map_err(zip_err)?.into_inner())
}

#[async_trait]
impl ArtifactRepository for SqliteArtifactRepository {
    async fn upsert(&self, job_id: &JobExecutionId, path: &str, data: &[u8]) -> Result<Artifact> {
        let artifact = Artifact::new(job_id, path, data.len() as u64);
        let file = self.root.join(&artifact.stored_path);
        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&file, data).await?;

        sqlx::query(
            r#"INSERT INTO job_artifacts (job_execution_id, path, content_type, size_bytes, stored_path, url, updated_utc)
               VALUES (?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT (job_execution_id, path) DO UPDATE SET
                 content_type = excluded.content_type, size_bytes = excluded.size_bytes,
                 stored_path = excluded.stored_path, url = excluded.url, updated_utc = excluded.updated_utc"#,
        )
        .bind(job_id.as_str())
        .bind(&artifact.path)
        .bind(&artifact.content_type)
        .bind(artifact.size_bytes as i64)
        .bind(&artifact.stored_path)
        .bind(&artifact.url)
        .bind(encode_ts(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        tracing::debug!(job_execution_id = %job_id, path, size = data.len(), "stored artifact");
        Ok(artifact)
    }

    async fn list(&self, job_id: &JobExecutionId) -> Result<Vec<Artifact>> {
        let rows = sqlx::query(
            "SELECT job_execution_id, path, content_type, size_bytes, stored_path, url FROM job_artifacts WHERE job_execution_id = ? ORDER BY path",
        )
        .bind(job_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.iter().map(Self::row_to_artifact).collect())
    }

    async fn read(
        &self,
        job_id: &JobExecutionId,
        path: &str,
    ) -> Result<Option<(Artifact, Vec<u8>)>> {
        let Some(artifact) = self.find(job_id, path).await? else {
            return Ok(None);
        };
        match tokio::fs::read(self.root.join(&artifact.stored_path)).await {
            Ok(data) => Ok(Some((artifact, data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn bundle(&self, job_id: &JobExecutionId) -> Result<Vec<u8>> {
        let mut entries = Vec::new();
        for artifact in self.list(job_id).await? {
            let data = tokio::fs::read(self.root.join(&artifact.stored_path)).await?;
            entries.push((artifact.path, data));
        }
        tokio::task::spawn_blocking(move || build_zip(entries))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?
    }

    async fn store_test_report(
        &self,
        job_id: &JobExecutionId,
        report: &TestReport,
    ) -> Result<StoredTestReport> {
        let stored = StoredTestReport {
            job_execution_id: job_id.clone(),
            summary: report.summary(),
            suites: report.suites.clone(),
        };
        sqlx::query(
            r#"INSERT INTO job_test_reports (job_execution_id, summary, suites, created_utc)
               VALUES (?, ?, ?, ?)
               ON CONFLICT (job_execution_id) DO UPDATE SET
                 summary = excluded.summary, suites = excluded.suites, created_utc = excluded.created_utc"#,
        )
        .bind(job_id.as_str())
        .bind(encode_json(&stored.summary)?)
        .bind(encode_json(&stored.suites)?)
        .bind(encode_ts(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        let body = serde_json::to_vec_pretty(&stored)?;
        self.upsert(job_id, TEST_REPORT_ARTIFACT, &body).await?;
        Ok(stored)
    }

    async fn get_test_report(&self, job_id: &JobExecutionId) -> Result<Option<StoredTestReport>> {
        let row = sqlx::query(
            "SELECT summary, suites FROM job_test_reports WHERE job_execution_id = ?",
        )
        .bind(job_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(StoredTestReport {
            job_execution_id: job_id.clone(),
            summary: decode_json(row.get("summary"))?,
            suites: decode_json(row.get("suites"))?,
        }))
    }

    async fn delete_for_jobs(&self, ids: &[JobExecutionId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for id in ids {
            sqlx::query("DELETE FROM job_artifacts WHERE job_execution_id = ?")
                .bind(id.as_str())
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            sqlx::query("DELETE FROM job_test_reports WHERE job_execution_id = ?")
                .bind(id.as_str())
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;

        for id in ids {
            match tokio::fs::remove_dir_all(self.root.join(id.as_str())).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(job_execution_id = %id, error = %e, "failed to remove artifact directory");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_db;
    use ciwi_core::artifact::{TestCase, TestCaseStatus, TestSuite};
    use std::io::Read;

    #[tokio::test]
    async fn test_upsert_list_and_bundle_sorted() {
        let db = test_db().await;
        let dir = tempfile::tempdir().unwrap();
        let repo = SqliteArtifactRepository::new(db.pool().clone(), dir.path());
        let job = JobExecutionId::from("job-1");

        repo.upsert(&job, "zeta/out.txt", b"zzz").await.unwrap();
        repo.upsert(&job, "alpha.bin", b"first").await.unwrap();
        repo.upsert(&job, "alpha.bin", b"second!").await.unwrap();

        let listed = repo.list(&job).await.unwrap();
        let paths: Vec<_> = listed.iter().map(|a| a.path.as_str()).collect();
        assert_eq!(paths, vec!["alpha.bin", "zeta/out.txt"]);
        assert_eq!(listed[0].size_bytes, 7);

        let bytes = repo.bundle(&job).await.unwrap();
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), 2);
        assert_eq!(archive.by_index(0).unwrap().name(), "alpha.bin");
        let mut content = String::new();
        archive
            .by_name("zeta/out.txt")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "zzz");
    }

    #[tokio::test]
    async fn test_report_becomes_artifact_and_is_deleted() {
        let db = test_db().await;
        let dir = tempfile::tempdir().unwrap();
        let repo = SqliteArtifactRepository::new(db.pool().clone(), dir.path());
        let job = JobExecutionId::from("job-2");
        let report = TestReport {
            suites: vec![TestSuite {
                name: "unit".into(),
                format: "go-test-json".into(),
                cases: vec![TestCase {
                    package: "p".into(),
                    name: "t".into(),
                    status: TestCaseStatus::Pass,
                    duration_seconds: 0.0,
                    output: String::new(),
                }],
            }],
        };

        let stored = repo.store_test_report(&job, &report).await.unwrap();
        assert_eq!(stored.summary.passed, 1);
        assert_eq!(repo.get_test_report(&job).await.unwrap().unwrap(), stored);
        let listed = repo.list(&job).await.unwrap();
        assert_eq!(listed[0].path, TEST_REPORT_ARTIFACT);
        assert!(!listed[0].url.is_empty());

        repo.delete_for_jobs(std::slice::from_ref(&job)).await.unwrap();
        assert!(repo.list(&job).await.unwrap().is_empty());
        assert!(repo.get_test_report(&job).await.unwrap().is_none());
        assert!(!dir.path().join("job-2").exists());
    }
}
