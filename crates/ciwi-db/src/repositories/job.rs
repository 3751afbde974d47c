//! SQLite implementation of JobRepository.

use crate::{db_err, decode_json, decode_opt_json, decode_opt_ts, decode_ts, encode_json, encode_ts};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ciwi_core::events::{JobEvent, JobEventInput};
use ciwi_core::ids::JobExecutionId;
use ciwi_core::job::{JobExecution, JobStatus, meta};
use ciwi_core::ports::{JobFilter, JobRepository};
use ciwi_core::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

const JOB_COLUMNS: &str = "id, status, script, env, required_capabilities, timeout_seconds, \
     artifact_globs, caches, source, metadata, needs, created_utc, leased_utc, started_utc, \
     finished_utc, leased_by_agent_id, executed_by_agent_id, exit_code, error, output, \
     unmet_requirements, sensitive_values, test_summary, current_step";

const ACTIVE: &str = "status IN ('leased', 'running')";
const TERMINAL: &str = "status IN ('succeeded', 'failed')";

pub struct SqliteJobRepository {
    pool: SqlitePool,
}

impl SqliteJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_job(r: &SqliteRow) -> Result<JobExecution> {
        let status: &str = r.get("status");
        let status = JobStatus::parse(status)
            .ok_or_else(|| Error::Database(format!("unknown job status {status:?}")))?;
        Ok(JobExecution {
            id: JobExecutionId::from(r.get::<String, _>("id")),
            script: r.get("script"),
            env: decode_json(r.get("env"))?,
            required_capabilities: decode_json(r.get("required_capabilities"))?,
            timeout_seconds: r.get::<i64, _>("timeout_seconds").max(0) as u64,
            artifact_globs: decode_json(r.get("artifact_globs"))?,
            caches: decode_json(r.get("caches"))?,
            source: decode_opt_json(r.get("source"))?,
            metadata: decode_json(r.get("metadata"))?,
            needs: decode_json(r.get("needs"))?,
            status,
            created_utc: decode_ts(r.get("created_utc"))?,
            leased_utc: decode_opt_ts(r.get("leased_utc"))?,
            started_utc: decode_opt_ts(r.get("started_utc"))?,
            finished_utc: decode_opt_ts(r.get("finished_utc"))?,
            leased_by_agent_id: r.get("leased_by_agent_id"),
            executed_by_agent_id: r.get("executed_by_agent_id"),
            exit_code: r.get::<Option<i64>, _>("exit_code").map(|c| c as i32),
            error: r.get("error"),
            output: r.get("output"),
            unmet_requirements: decode_json(r.get("unmet_requirements"))?,
            sensitive_values: decode_json(r.get("sensitive_values"))?,
            test_summary: decode_opt_json(r.get("test_summary"))?,
            current_step: decode_opt_json(r.get("current_step"))?,
        })
    }

    async fn insert_events(
        tx: &mut Transaction<'_, Sqlite>,
        id: &JobExecutionId,
        events: &[JobEventInput],
        now: DateTime<Utc>,
    ) -> Result<Vec<JobEvent>> {
        let created = encode_ts(now);
        let mut stored = Vec::with_capacity(events.len());
        for event in events {
            let payload = event.payload_value();
            let sequence = sqlx::query(
                "INSERT INTO job_events (job_execution_id, event_type, payload, created_utc) VALUES (?, ?, ?, ?)",
            )
            .bind(id.as_str())
            .bind(&event.event_type)
            .bind(encode_json(&payload)?)
            .bind(&created)
            .execute(&mut **tx)
            .await
            .map_err(db_err)?
            .last_insert_rowid();
            stored.push(JobEvent {
                sequence,
                job_execution_id: id.clone(),
                event_type: event.event_type.clone(),
                payload,
                created_utc: now,
            });
        }
        Ok(stored)
    }

    async fn delete_where(&self, predicate: &str) -> Result<Vec<JobExecutionId>> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let ids: Vec<String> =
            sqlx::query_scalar(&format!("SELECT id FROM job_executions WHERE {predicate}"))
                .fetch_all(&mut *tx)
                .await
                .map_err(db_err)?;
        sqlx::query(&format!(
            "DELETE FROM job_events WHERE job_execution_id IN (SELECT id FROM job_executions WHERE {predicate})"
        ))
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        sqlx::query(&format!("DELETE FROM job_executions WHERE {predicate}"))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(ids.into_iter().map(JobExecutionId::from).collect())
    }
}

#[async_trait]
impl JobRepository for SqliteJobRepository {
    async fn create_many(&self, jobs: &[JobExecution]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for job in jobs {
            let project_id: Option<i64> = job.meta(meta::PROJECT_ID).and_then(|v| v.parse().ok());
            sqlx::query(&format!(
                "INSERT INTO job_executions ({JOB_COLUMNS}, pipeline_run_id, project_id, pipeline_id) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            ))
            .bind(job.id.as_str())
            .bind(job.status.as_str())
            .bind(&job.script)
            .bind(encode_json(&job.env)?)
            .bind(encode_json(&job.required_capabilities)?)
            .bind(job.timeout_seconds as i64)
            .bind(encode_json(&job.artifact_globs)?)
            .bind(encode_json(&job.caches)?)
            .bind(job.source.as_ref().map(encode_json).transpose()?)
            .bind(encode_json(&job.metadata)?)
            .bind(encode_json(&job.needs)?)
            .bind(encode_ts(job.created_utc))
            .bind(job.leased_utc.map(encode_ts))
            .bind(job.started_utc.map(encode_ts))
            .bind(job.finished_utc.map(encode_ts))
            .bind(&job.leased_by_agent_id)
            .bind(&job.executed_by_agent_id)
            .bind(job.exit_code.map(i64::from))
            .bind(&job.error)
            .bind(&job.output)
            .bind(encode_json(&job.unmet_requirements)?)
            .bind(encode_json(&job.sensitive_values)?)
            .bind(job.test_summary.as_ref().map(encode_json).transpose()?)
            .bind(job.current_step.as_ref().map(encode_json).transpose()?)
            .bind(job.pipeline_run_id())
            .bind(project_id)
            .bind(job.meta(meta::PIPELINE_ID))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        tracing::debug!(count = jobs.len(), "inserted job executions");
        Ok(())
    }

    async fn get(&self, id: &JobExecutionId) -> Result<Option<JobExecution>> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM job_executions WHERE id = ?"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(Self::row_to_job).transpose()
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<JobExecution>> {
        let (predicate, first, second): (String, Option<String>, Option<String>) = match filter {
            JobFilter::All => ("1 = 1".into(), None, None),
            JobFilter::Queued => ("status = 'queued'".into(), None, None),
            JobFilter::Active => (ACTIVE.into(), None, None),
            JobFilter::History => (TERMINAL.into(), None, None),
            JobFilter::ByRun(run) => ("pipeline_run_id = ?".into(), Some(run.clone()), None),
            JobFilter::ByAgent(agent) => (
                "executed_by_agent_id = ?".into(),
                Some(agent.clone()),
                None,
            ),
            JobFilter::ByPipeline {
                pipeline_id,
                ..
            } => (
                "project_id = ? AND pipeline_id = ?".into(),
                None,
                Some(pipeline_id.clone()),
            ),
        };
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM job_executions WHERE {predicate} ORDER BY created_utc, rowid"
        );
        let mut query = sqlx::query(&sql);
        if let JobFilter::ByPipeline { project_id, .. } = filter {
            query = query.bind(*project_id);
        } else if let Some(value) = first {
            query = query.bind(value);
        }
        if let Some(value) = second {
            query = query.bind(value);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(db_err)?;
        rows.iter().map(Self::row_to_job).collect()
    }

    async fn mark_leased(
        &self,
        id: &JobExecutionId,
        agent_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(&format!(
            "UPDATE job_executions
             SET status = 'leased', leased_by_agent_id = ?, executed_by_agent_id = ?, leased_utc = ?
             WHERE id = ? AND status = 'queued'
               AND NOT EXISTS (SELECT 1 FROM job_executions WHERE leased_by_agent_id = ? AND {ACTIVE})"
        ))
        .bind(agent_id)
        .bind(agent_id)
        .bind(encode_ts(now))
        .bind(id.as_str())
        .bind(agent_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn update(
        &self,
        job: &JobExecution,
        expected: JobStatus,
        events: &[JobEventInput],
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let result = sqlx::query(
            r#"UPDATE job_executions SET
                 status = ?, metadata = ?, leased_utc = ?, started_utc = ?, finished_utc = ?,
                 leased_by_agent_id = ?, executed_by_agent_id = ?, exit_code = ?, error = ?,
                 output = ?, unmet_requirements = ?, test_summary = ?, current_step = ?
               WHERE id = ? AND status = ?"#,
        )
        .bind(job.status.as_str())
        .bind(encode_json(&job.metadata)?)
        .bind(job.leased_utc.map(encode_ts))
        .bind(job.started_utc.map(encode_ts))
        .bind(job.finished_utc.map(encode_ts))
        .bind(&job.leased_by_agent_id)
        .bind(&job.executed_by_agent_id)
        .bind(job.exit_code.map(i64::from))
        .bind(&job.error)
        .bind(&job.output)
        .bind(encode_json(&job.unmet_requirements)?)
        .bind(job.test_summary.as_ref().map(encode_json).transpose()?)
        .bind(job.current_step.as_ref().map(encode_json).transpose()?)
        .bind(job.id.as_str())
        .bind(expected.as_str())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        if result.rows_affected() != 1 {
            tx.rollback().await.map_err(db_err)?;
            return Ok(false);
        }
        Self::insert_events(&mut tx, &job.id, events, now).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(true)
    }

    async fn append_events(
        &self,
        id: &JobExecutionId,
        events: &[JobEventInput],
        now: DateTime<Utc>,
    ) -> Result<Vec<JobEvent>> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let stored = Self::insert_events(&mut tx, id, events, now).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(stored)
    }

    async fn list_events(&self, id: &JobExecutionId) -> Result<Vec<JobEvent>> {
        let rows = sqlx::query(
            "SELECT sequence, job_execution_id, event_type, payload, created_utc FROM job_events WHERE job_execution_id = ? ORDER BY sequence",
        )
        .bind(id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter()
            .map(|r| {
                Ok(JobEvent {
                    sequence: r.get("sequence"),
                    job_execution_id: JobExecutionId::from(r.get::<String, _>("job_execution_id")),
                    event_type: r.get("event_type"),
                    payload: decode_json(r.get("payload"))?,
                    created_utc: decode_ts(r.get("created_utc"))?,
                })
            })
            .collect()
    }

    async fn delete_queued(&self, id: &JobExecutionId) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let deleted = sqlx::query("DELETE FROM job_executions WHERE id = ? AND status = 'queued'")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?
            .rows_affected()
            == 1;
        if deleted {
            sqlx::query("DELETE FROM job_events WHERE job_execution_id = ?")
                .bind(id.as_str())
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(deleted)
    }

    async fn delete_non_terminal(&self) -> Result<Vec<JobExecutionId>> {
        self.delete_where("status IN ('queued', 'leased', 'running')")
            .await
    }

    async fn delete_terminal(&self) -> Result<Vec<JobExecutionId>> {
        self.delete_where(TERMINAL).await
    }
}
