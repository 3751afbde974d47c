//! SQLite implementation of AppStateRepository.

use crate::{db_err, encode_ts};
use async_trait::async_trait;
use chrono::Utc;
use ciwi_core::Result;
use ciwi_core::ports::AppStateRepository;
use sqlx::SqlitePool;
use std::collections::BTreeMap;

const UPSERT: &str = "INSERT INTO app_state (key, value, updated_utc) VALUES (?, ?, ?) \
     ON CONFLICT (key) DO UPDATE SET value = excluded.value, updated_utc = excluded.updated_utc";

pub struct SqliteAppStateRepository {
    pool: SqlitePool,
}

impl SqliteAppStateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AppStateRepository for SqliteAppStateRepository {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        sqlx::query_scalar("SELECT value FROM app_state WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(UPSERT)
            .bind(key)
            .bind(value)
            .bind(encode_ts(Utc::now()))
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn set_many(&self, values: &[(&str, String)]) -> Result<()> {
        let now = encode_ts(Utc::now());
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for (key, value) in values {
            sqlx::query(UPSERT)
                .bind(*key)
                .bind(value)
                .bind(&now)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn list(&self) -> Result<BTreeMap<String, String>> {
        let rows: Vec<(String, String)> = sqlx::query_as("SELECT key, value FROM app_state")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(rows.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_db;

    #[tokio::test]
    async fn test_set_get_list() {
        let db = test_db().await;
        let repo = SqliteAppStateRepository::new(db.pool().clone());
        assert!(repo.get("update_message").await.unwrap().is_none());
        repo.set("update_message", "checking").await.unwrap();
        repo.set_many(&[
            ("update_message", "done".to_string()),
            ("update_latest_version", "v1.2.3".to_string()),
        ])
        .await
        .unwrap();
        assert_eq!(repo.get("update_message").await.unwrap().as_deref(), Some("done"));
        let all = repo.list().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["update_latest_version"], "v1.2.3");
    }
}
