//! SQLite implementation of ProjectRepository.

use crate::{db_err, decode_json, decode_opt_json, decode_ts, encode_json, encode_ts};
use async_trait::async_trait;
use chrono::Utc;
use ciwi_core::ids::{PipelineChainRecordId, PipelineRecordId, ProjectId};
use ciwi_core::pipeline::{
    ConfigOrigin, PipelineChainRecord, PipelineRecord, Project, ProjectConfig, ProjectDetail,
};
use ciwi_core::ports::ProjectRepository;
use ciwi_core::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

const PROJECT_COLUMNS: &str =
    "id, name, origin_key, repo_url, repo_ref, config_file, source_commit, loaded_utc";
const PIPELINE_COLUMNS: &str =
    "id, project_id, pipeline_id, trigger, depends_on, source, versioning, jobs";
const CHAIN_COLUMNS: &str = "id, project_id, chain_id, pipelines";

pub struct SqliteProjectRepository {
    pool: SqlitePool,
}

impl SqliteProjectRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_project(r: &SqliteRow) -> Result<Project> {
        Ok(Project {
            id: r.get("id"),
            name: r.get("name"),
            origin_key: r.get("origin_key"),
            repo_url: r.get("repo_url"),
            repo_ref: r.get("repo_ref"),
            config_file: r.get("config_file"),
            source_commit: r.get("source_commit"),
            loaded_utc: decode_ts(r.get("loaded_utc"))?,
        })
    }

    fn row_to_pipeline(r: &SqliteRow) -> Result<PipelineRecord> {
        Ok(PipelineRecord {
            id: r.get("id"),
            project_id: r.get("project_id"),
            pipeline_id: r.get("pipeline_id"),
            trigger: r.get("trigger"),
            depends_on: decode_json(r.get("depends_on"))?,
            source: decode_opt_json(r.get("source"))?,
            versioning: decode_opt_json(r.get("versioning"))?,
            jobs: decode_json(r.get("jobs"))?,
        })
    }

    fn row_to_chain(r: &SqliteRow) -> Result<PipelineChainRecord> {
        Ok(PipelineChainRecord {
            id: r.get("id"),
            project_id: r.get("project_id"),
            chain_id: r.get("chain_id"),
            pipelines: decode_json(r.get("pipelines"))?,
        })
    }
}

#[async_trait]
impl ProjectRepository for SqliteProjectRepository {
    async fn load_config(
        &self,
        config: &ProjectConfig,
        origin: &ConfigOrigin,
    ) -> Result<ProjectDetail> {
        let now = encode_ts(Utc::now());
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let existing: Option<i64> = sqlx::query_scalar("SELECT id FROM projects WHERE name = ?")
            .bind(&config.name)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;

        let project_id = match existing {
            Some(id) => {
                sqlx::query(
                    r#"UPDATE projects SET origin_key = ?, repo_url = ?, repo_ref = ?, config_file = ?,
                       source_commit = ?, loaded_utc = ? WHERE id = ?"#,
                )
                .bind(&origin.origin_key)
                .bind(&origin.repo_url)
                .bind(&origin.repo_ref)
                .bind(&origin.config_file)
                .bind(&origin.source_commit)
                .bind(&now)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
                id
            }
            None => sqlx::query(
                r#"INSERT INTO projects (name, origin_key, repo_url, repo_ref, config_file, source_commit, loaded_utc)
                   VALUES (?, ?, ?, ?, ?, ?, ?)"#,
            )
            .bind(&config.name)
            .bind(&origin.origin_key)
            .bind(&origin.repo_url)
            .bind(&origin.repo_ref)
            .bind(&origin.config_file)
            .bind(&origin.source_commit)
            .bind(&now)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?
            .last_insert_rowid(),
        };

        // Upsert keeps numeric pipeline ids stable across reloads.
        for (position, pipeline) in config.pipelines.iter().enumerate() {
            sqlx::query(
                r#"INSERT INTO pipelines (project_id, pipeline_id, position, trigger, depends_on, source, versioning, jobs)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                   ON CONFLICT (project_id, pipeline_id) DO UPDATE SET
                     position = excluded.position, trigger = excluded.trigger,
                     depends_on = excluded.depends_on, source = excluded.source,
                     versioning = excluded.versioning, jobs = excluded.jobs"#,
            )
            .bind(project_id)
            .bind(&pipeline.id)
            .bind(position as i64)
            .bind(&pipeline.trigger)
            .bind(encode_json(&pipeline.depends_on)?)
            .bind(pipeline.source.as_ref().map(encode_json).transpose()?)
            .bind(pipeline.versioning.as_ref().map(encode_json).transpose()?)
            .bind(encode_json(&pipeline.jobs)?)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        let stored: Vec<String> =
            sqlx::query_scalar("SELECT pipeline_id FROM pipelines WHERE project_id = ?")
                .bind(project_id)
                .fetch_all(&mut *tx)
                .await
                .map_err(db_err)?;
        for stale in stored
            .iter()
            .filter(|id| !config.pipelines.iter().any(|p| &p.id == *id))
        {
            sqlx::query("DELETE FROM pipelines WHERE project_id = ? AND pipeline_id = ?")
                .bind(project_id)
                .bind(stale)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }

        sqlx::query("DELETE FROM pipeline_chains WHERE project_id = ?")
            .bind(project_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        for (position, chain) in config.pipeline_chains.iter().enumerate() {
            sqlx::query(
                "INSERT INTO pipeline_chains (project_id, chain_id, position, pipelines) VALUES (?, ?, ?, ?)",
            )
            .bind(project_id)
            .bind(&chain.id)
            .bind(position as i64)
            .bind(encode_json(&chain.pipelines)?)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        tracing::info!(project = %config.name, project_id, pipelines = config.pipelines.len(), "loaded project config");

        self.get_project(project_id)
            .await?
            .ok_or_else(|| Error::ProjectNotFound(project_id.to_string()))
    }

    async fn list_projects(&self) -> Result<Vec<Project>> {
        let rows = sqlx::query(&format!(
            "SELECT {PROJECT_COLUMNS} FROM projects ORDER BY name"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(Self::row_to_project).collect()
    }

    async fn get_project(&self, id: ProjectId) -> Result<Option<ProjectDetail>> {
        let row = sqlx::query(&format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let project = Self::row_to_project(&row)?;

        let pipelines = sqlx::query(&format!(
            "SELECT {PIPELINE_COLUMNS} FROM pipelines WHERE project_id = ? ORDER BY position"
        ))
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?
        .iter()
        .map(Self::row_to_pipeline)
        .collect::<Result<Vec<_>>>()?;

        let pipeline_chains = sqlx::query(&format!(
            "SELECT {CHAIN_COLUMNS} FROM pipeline_chains WHERE project_id = ? ORDER BY position"
        ))
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?
        .iter()
        .map(Self::row_to_chain)
        .collect::<Result<Vec<_>>>()?;

        Ok(Some(ProjectDetail {
            project,
            pipelines,
            pipeline_chains,
        }))
    }

    async fn get_project_by_name(&self, name: &str) -> Result<Option<Project>> {
        let row = sqlx::query(&format!(
            "SELECT {PROJECT_COLUMNS} FROM projects WHERE name = ?"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(Self::row_to_project).transpose()
    }

    async fn get_pipeline(&self, id: PipelineRecordId) -> Result<Option<PipelineRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {PIPELINE_COLUMNS} FROM pipelines WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(Self::row_to_pipeline).transpose()
    }

    async fn get_pipeline_chain(
        &self,
        id: PipelineChainRecordId,
    ) -> Result<Option<PipelineChainRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {CHAIN_COLUMNS} FROM pipeline_chains WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(Self::row_to_chain).transpose()
    }
}
