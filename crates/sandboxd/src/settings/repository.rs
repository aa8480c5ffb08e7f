//! System and per-user settings storage (JSON-encoded values).

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::SqlitePool;
use tracing::{debug, instrument};

use crate::db::now_timestamp;

#[derive(Debug, Clone)]
pub struct SettingsRepository {
    pool: SqlitePool,
}

impl SettingsRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Raw stored value of a system setting.
    #[instrument(skip(self))]
    pub async fn get_system_raw(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM system_settings WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .with_context(|| format!("Failed to read system setting {key}"))?;
        Ok(value)
    }

    /// Decode a system setting.
    pub async fn get_system<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get_system_raw(key).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .with_context(|| format!("Invalid value for system setting {key}")),
            None => Ok(None),
        }
    }

    /// String-valued system setting. Values that are not JSON strings are returned raw.
    pub async fn get_system_string(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .get_system_raw(key)
            .await?
            .map(|raw| serde_json::from_str::<String>(&raw).unwrap_or(raw)))
    }

    #[instrument(skip(self, value))]
    pub async fn set_system<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let encoded = serde_json::to_string(value).context("Failed to encode setting")?;
        sqlx::query(
            r#"
            INSERT INTO system_settings (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(&encoded)
        .bind(now_timestamp())
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to write system setting {key}"))?;
        debug!("System setting {} updated", key);
        Ok(())
    }

    pub async fn delete_system(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM system_settings WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to delete system setting {key}"))?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn get_user<T: DeserializeOwned>(&self, user_id: i64, key: &str) -> Result<Option<T>> {
        let raw: Option<String> =
            sqlx::query_scalar("SELECT value FROM user_settings WHERE user_id = ? AND key = ?")
                .bind(user_id)
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .with_context(|| format!("Failed to read user setting {key}"))?;
        match raw {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .with_context(|| format!("Invalid value for user setting {key}")),
            None => Ok(None),
        }
    }

    #[instrument(skip(self, value))]
    pub async fn set_user<T: Serialize + ?Sized>(
        &self,
        user_id: i64,
        key: &str,
        value: &T,
    ) -> Result<()> {
        let encoded = serde_json::to_string(value).context("Failed to encode setting")?;
        sqlx::query(
            r#"
            INSERT INTO user_settings (user_id, key, value, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(user_id, key) DO UPDATE
                SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(user_id)
        .bind(key)
        .bind(&encoded)
        .bind(now_timestamp())
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to write user setting {key}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use serde_json::json;

    #[tokio::test]
    async fn system_settings_upsert() {
        let db = Database::in_memory().await.unwrap();
        let repo = SettingsRepository::new(db.pool().clone());

        assert!(repo.get_system_raw("sandbox_image").await.unwrap().is_none());
        repo.set_system("sandbox_image", "registry/a:1").await.unwrap();
        repo.set_system("sandbox_image", "registry/a:2").await.unwrap();
        assert_eq!(
            repo.get_system_string("sandbox_image").await.unwrap().as_deref(),
            Some("registry/a:2")
        );
    }

    #[tokio::test]
    async fn raw_non_json_string_is_tolerated() {
        let db = Database::in_memory().await.unwrap();
        sqlx::query("INSERT INTO system_settings (key, value, updated_at) VALUES ('k', 'plain', 'x')")
            .execute(db.pool())
            .await
            .unwrap();
        let repo = SettingsRepository::new(db.pool().clone());
        assert_eq!(repo.get_system_string("k").await.unwrap().as_deref(), Some("plain"));
    }

    #[tokio::test]
    async fn user_settings_are_scoped() {
        let db = Database::in_memory().await.unwrap();
        let repo = SettingsRepository::new(db.pool().clone());
        repo.set_user(1, "resource_limits", &json!({"cpu_request": "1"}))
            .await
            .unwrap();

        let mine: Option<serde_json::Value> = repo.get_user(1, "resource_limits").await.unwrap();
        let theirs: Option<serde_json::Value> = repo.get_user(2, "resource_limits").await.unwrap();
        assert_eq!(mine.unwrap()["cpu_request"], "1");
        assert!(theirs.is_none());
    }
}
