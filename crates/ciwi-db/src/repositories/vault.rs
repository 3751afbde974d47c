//! SQLite implementation of VaultRepository.

use crate::{db_err, decode_ts, encode_ts};
use async_trait::async_trait;
use chrono::Utc;
use ciwi_core::ids::VaultConnectionId;
use ciwi_core::ports::VaultRepository;
use ciwi_core::vault::{VaultConnection, VaultConnectionInput};
use ciwi_core::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

const COLUMNS: &str =
    "id, name, url, auth_method, mount, role_id, secret_id_env, created_utc, updated_utc";

pub struct SqliteVaultRepository {
    pool: SqlitePool,
}

impl SqliteVaultRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_connection(r: &SqliteRow) -> Result<VaultConnection> {
        Ok(VaultConnection {
            id: r.get("id"),
            name: r.get("name"),
            url: r.get("url"),
            auth_method: r.get("auth_method"),
            mount: r.get("mount"),
            role_id: r.get("role_id"),
            secret_id_env: r.get("secret_id_env"),
            created_utc: decode_ts(r.get("created_utc"))?,
            updated_utc: decode_ts(r.get("updated_utc"))?,
        })
    }
}

fn map_unique(err: sqlx::Error, name: &str) -> Error {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            Error::validation(format!("vault connection {name:?} already exists"))
        }
        _ => db_err(err),
    }
}

#[async_trait]
impl VaultRepository for SqliteVaultRepository {
    async fn list(&self) -> Result<Vec<VaultConnection>> {
        let rows = sqlx::query(&format!("SELECT {COLUMNS} FROM vault_connections ORDER BY name"))
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(Self::row_to_connection).collect()
    }

    async fn get(&self, id: VaultConnectionId) -> Result<Option<VaultConnection>> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM vault_connections WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(Self::row_to_connection).transpose()
    }

    async fn create(&self, input: &VaultConnectionInput) -> Result<VaultConnection> {
        let now = encode_ts(Utc::now());
        let id = sqlx::query(
            r#"INSERT INTO vault_connections (name, url, auth_method, mount, role_id, secret_id_env, created_utc, updated_utc)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&input.name)
        .bind(&input.url)
        .bind(&input.auth_method)
        .bind(&input.mount)
        .bind(&input.role_id)
        .bind(&input.secret_id_env)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique(e, &input.name))?
        .last_insert_rowid();
        self.get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("vault connection {id}")))
    }

    async fn update(
        &self,
        id: VaultConnectionId,
        input: &VaultConnectionInput,
    ) -> Result<Option<VaultConnection>> {
        let updated = sqlx::query(
            r#"UPDATE vault_connections SET name = ?, url = ?, auth_method = ?, mount = ?, role_id = ?,
               secret_id_env = ?, updated_utc = ? WHERE id = ?"#,
        )
        .bind(&input.name)
        .bind(&input.url)
        .bind(&input.auth_method)
        .bind(&input.mount)
        .bind(&input.role_id)
        .bind(&input.secret_id_env)
        .bind(encode_ts(Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique(e, &input.name))?
        .rows_affected();
        if updated == 0 {
            return Ok(None);
        }
        self.get(id).await
    }

    async fn delete(&self, id: VaultConnectionId) -> Result<bool> {
        let deleted = sqlx::query("DELETE FROM vault_connections WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?
            .rows_affected();
        Ok(deleted == 1)
    }
}
