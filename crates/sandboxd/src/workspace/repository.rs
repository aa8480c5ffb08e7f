//! Workspace catalog and quota repository.
//!
//! Quota rows are never incremented. Every catalog mutation recomputes the
//! affected row from `SUM(size_bytes)` / `COUNT(*)` in the same transaction.

use anyhow::{Context, Result};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::{debug, instrument};

use super::models::{
    NewWorkspaceFile, Quota, QuotaDefaults, QuotaScope, WorkspaceFile, WorkspaceType, file_name,
};
use crate::db::now_timestamp;

const FILE_COLUMNS: &str = "id, user_id, agent_id, group_id, workspace_type, object_key, \
                            file_name, file_path, content_type, size_bytes, checksum, \
                            is_directory, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct WorkspaceRepository {
    pool: SqlitePool,
    defaults: QuotaDefaults,
}

impl WorkspaceRepository {
    pub fn new(pool: SqlitePool, defaults: QuotaDefaults) -> Self {
        Self { pool, defaults }
    }

    /// Current quota for a scope, creating the row with default ceilings if absent.
    #[instrument(skip(self))]
    pub async fn quota(&self, scope: QuotaScope) -> Result<Quota> {
        let mut tx = self.pool.begin().await.context("beginning transaction")?;
        self.ensure_quota_row(&mut tx, scope).await?;
        let quota = Self::read_quota(&mut tx, scope).await?;
        tx.commit().await.context("committing quota read")?;
        Ok(quota)
    }

    async fn ensure_quota_row(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        scope: QuotaScope,
    ) -> Result<()> {
        let now = now_timestamp();
        match scope {
            QuotaScope::Agent { user_id, agent_id } => {
                sqlx::query(
                    r#"
                    INSERT INTO workspace_quotas (user_id, agent_id, used_bytes, max_bytes,
                                                  file_count, max_file_count, updated_at)
                    VALUES (?, ?, 0, ?, 0, ?, ?)
                    ON CONFLICT(user_id, agent_id) DO NOTHING
                    "#,
                )
                .bind(user_id)
                .bind(agent_id)
                .bind(self.defaults.max_bytes)
                .bind(self.defaults.max_file_count)
                .bind(&now)
                .execute(&mut **tx)
                .await
                .context("creating workspace quota")?;
            }
            QuotaScope::Group { group_id } => {
                sqlx::query(
                    r#"
                    INSERT INTO group_workspace_quotas (group_id, used_bytes, max_bytes,
                                                        file_count, max_file_count, updated_at)
                    VALUES (?, 0, ?, 0, ?, ?)
                    ON CONFLICT(group_id) DO NOTHING
                    "#,
                )
                .bind(group_id)
                .bind(self.defaults.max_bytes)
                .bind(self.defaults.max_file_count)
                .bind(&now)
                .execute(&mut **tx)
                .await
                .context("creating group workspace quota")?;
            }
        }
        Ok(())
    }

    async fn read_quota(tx: &mut Transaction<'_, Sqlite>, scope: QuotaScope) -> Result<Quota> {
        let quota = match scope {
            QuotaScope::Agent { user_id, agent_id } => sqlx::query_as::<_, Quota>(
                "SELECT used_bytes, max_bytes, file_count, max_file_count
                 FROM workspace_quotas WHERE user_id = ? AND agent_id = ?",
            )
            .bind(user_id)
            .bind(agent_id)
            .fetch_one(&mut **tx)
            .await,
            QuotaScope::Group { group_id } => sqlx::query_as::<_, Quota>(
                "SELECT used_bytes, max_bytes, file_count, max_file_count
                 FROM group_workspace_quotas WHERE group_id = ?",
            )
            .bind(group_id)
            .fetch_one(&mut **tx)
            .await,
        };
        quota.context("reading quota")
    }

    /// Recompute a quota row from the catalog.
    async fn recompute(&self, tx: &mut Transaction<'_, Sqlite>, scope: QuotaScope) -> Result<()> {
        self.ensure_quota_row(tx, scope).await?;
        let now = now_timestamp();
        match scope {
            QuotaScope::Agent { user_id, agent_id } => {
                sqlx::query(
                    r#"
                    UPDATE workspace_quotas
                    SET used_bytes = (SELECT COALESCE(SUM(size_bytes), 0) FROM workspace_files
                                      WHERE user_id = ?1 AND agent_id = ?2
                                        AND workspace_type = 'private' AND is_directory = 0),
                        file_count = (SELECT COUNT(*) FROM workspace_files
                                      WHERE user_id = ?1 AND agent_id = ?2
                                        AND workspace_type = 'private' AND is_directory = 0),
                        updated_at = ?3
                    WHERE user_id = ?1 AND agent_id = ?2
                    "#,
                )
                .bind(user_id)
                .bind(agent_id)
                .bind(&now)
                .execute(&mut **tx)
                .await
                .context("recomputing workspace quota")?;
            }
            QuotaScope::Group { group_id } => {
                sqlx::query(
                    r#"
                    UPDATE group_workspace_quotas
                    SET used_bytes = (SELECT COALESCE(SUM(size_bytes), 0) FROM workspace_files
                                      WHERE group_id = ?1 AND workspace_type = 'group'
                                        AND is_directory = 0),
                        file_count = (SELECT COUNT(*) FROM workspace_files
                                      WHERE group_id = ?1 AND workspace_type = 'group'
                                        AND is_directory = 0),
                        updated_at = ?2
                    WHERE group_id = ?1
                    "#,
                )
                .bind(group_id)
                .bind(&now)
                .execute(&mut **tx)
                .await
                .context("recomputing group workspace quota")?;
            }
        }
        Ok(())
    }

    /// Insert or update a catalog row by object key, then recompute its quota.
    #[instrument(skip(self, file), fields(key = %file.object_key))]
    pub async fn upsert_file(
        &self,
        file: NewWorkspaceFile,
        scope: Option<QuotaScope>,
    ) -> Result<WorkspaceFile> {
        let now = now_timestamp();
        let mut tx = self.pool.begin().await.context("beginning transaction")?;

        sqlx::query(
            r#"
            INSERT INTO workspace_files (user_id, agent_id, group_id, workspace_type, object_key,
                                         file_name, file_path, content_type, size_bytes, checksum,
                                         is_directory, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(object_key) DO UPDATE SET
                size_bytes = excluded.size_bytes,
                checksum = excluded.checksum,
                content_type = excluded.content_type,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(file.user_id)
        .bind(file.agent_id)
        .bind(file.group_id)
        .bind(file.workspace_type.as_str())
        .bind(&file.object_key)
        .bind(file_name(&file.file_path))
        .bind(&file.file_path)
        .bind(&file.content_type)
        .bind(file.size_bytes)
        .bind(&file.checksum)
        .bind(file.is_directory)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .context("upserting workspace file")?;

        if let Some(scope) = scope {
            self.recompute(&mut tx, scope).await?;
        }

        let row = sqlx::query_as::<_, WorkspaceFile>(&format!(
            "SELECT {FILE_COLUMNS} FROM workspace_files WHERE object_key = ?"
        ))
        .bind(&file.object_key)
        .fetch_one(&mut *tx)
        .await
        .context("reading workspace file")?;

        tx.commit().await.context("committing workspace file")?;
        debug!("Catalogued {} ({} bytes)", row.object_key, row.size_bytes);
        Ok(row)
    }

    /// Delete one catalog row, or every row under a prefix when `key` ends in `/`,
    /// then recompute the quota. Returns the number of rows removed.
    #[instrument(skip(self))]
    pub async fn delete_files(&self, key: &str, scope: Option<QuotaScope>) -> Result<u64> {
        let mut tx = self.pool.begin().await.context("beginning transaction")?;

        let query = if key.ends_with('/') {
            // Case-sensitive prefix match
            sqlx::query(
                "DELETE FROM workspace_files WHERE substr(object_key, 1, length(?1)) = ?1",
            )
            .bind(key.to_string())
        } else {
            sqlx::query("DELETE FROM workspace_files WHERE object_key = ?").bind(key.to_string())
        };
        let result = query
            .execute(&mut *tx)
            .await
            .context("deleting workspace files")?;

        if let Some(scope) = scope {
            self.recompute(&mut tx, scope).await?;
        }
        tx.commit().await.context("committing workspace delete")?;
        Ok(result.rows_affected())
    }

    pub async fn get_file(&self, object_key: &str) -> Result<Option<WorkspaceFile>> {
        let row = sqlx::query_as::<_, WorkspaceFile>(&format!(
            "SELECT {FILE_COLUMNS} FROM workspace_files WHERE object_key = ?"
        ))
        .bind(object_key)
        .fetch_optional(&self.pool)
        .await
        .context("getting workspace file")?;
        Ok(row)
    }

    /// Object keys of files catalogued under `prefix`, matched case-sensitively.
    pub async fn file_keys_under(&self, prefix: &str) -> Result<Vec<String>> {
        let keys = sqlx::query_scalar::<_, String>(
            "SELECT object_key FROM workspace_files
             WHERE substr(object_key, 1, length(?1)) = ?1 AND is_directory = 0
             ORDER BY object_key",
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await
        .context("listing catalogued files")?;
        Ok(keys)
    }

    /// Output-namespace files of a sandbox, excluding directories.
    pub async fn output_files(&self, user_id: i64, agent_id: i64) -> Result<Vec<WorkspaceFile>> {
        let rows = sqlx::query_as::<_, WorkspaceFile>(&format!(
            "SELECT {FILE_COLUMNS} FROM workspace_files
             WHERE user_id = ? AND agent_id = ? AND workspace_type = ? AND is_directory = 0
             ORDER BY file_path"
        ))
        .bind(user_id)
        .bind(agent_id)
        .bind(WorkspaceType::Output.as_str())
        .fetch_all(&self.pool)
        .await
        .context("listing output files")?;
        Ok(rows)
    }

    /// Agent-scoped catalog rows whose agent no longer exists.
    pub async fn orphaned_files(&self) -> Result<Vec<WorkspaceFile>> {
        let rows = sqlx::query_as::<_, WorkspaceFile>(&format!(
            "SELECT {FILE_COLUMNS} FROM workspace_files
             WHERE agent_id != 0 AND agent_id NOT IN (SELECT id FROM agents)
             ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await
        .context("listing orphaned workspace files")?;
        Ok(rows)
    }

    /// Drop catalog rows by id, plus the quota rows of agents that no longer exist.
    pub async fn purge_orphans(&self, ids: &[i64]) -> Result<u64> {
        let mut tx = self.pool.begin().await.context("beginning transaction")?;
        let mut removed = 0;
        for id in ids {
            removed += sqlx::query("DELETE FROM workspace_files WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await
                .context("deleting orphaned workspace file")?
                .rows_affected();
        }
        sqlx::query("DELETE FROM workspace_quotas WHERE agent_id NOT IN (SELECT id FROM agents)")
            .execute(&mut *tx)
            .await
            .context("deleting orphaned quotas")?;
        tx.commit().await.context("committing orphan purge")?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    async fn repo() -> (WorkspaceRepository, Database) {
        let db = Database::in_memory().await.unwrap();
        (
            WorkspaceRepository::new(db.pool().clone(), QuotaDefaults::default()),
            db,
        )
    }

    fn private_file(key: &str, size: i64) -> NewWorkspaceFile {
        NewWorkspaceFile {
            user_id: 1,
            agent_id: 2,
            group_id: None,
            workspace_type: WorkspaceType::Private,
            object_key: format!("users/1/agents/2/{key}"),
            file_path: key.to_string(),
            content_type: "text/plain".to_string(),
            size_bytes: size,
            checksum: String::new(),
            is_directory: false,
        }
    }

    const SCOPE: QuotaScope = QuotaScope::Agent {
        user_id: 1,
        agent_id: 2,
    };

    #[tokio::test]
    async fn quota_is_recomputed_not_incremented() {
        let (repo, _db) = repo().await;
        repo.upsert_file(private_file("a.txt", 10), Some(SCOPE)).await.unwrap();
        repo.upsert_file(private_file("b.txt", 5), Some(SCOPE)).await.unwrap();
        // Overwrite replaces the size
        repo.upsert_file(private_file("a.txt", 3), Some(SCOPE)).await.unwrap();

        let quota = repo.quota(SCOPE).await.unwrap();
        assert_eq!(quota.used_bytes, 8);
        assert_eq!(quota.file_count, 2);
        assert_eq!(quota.max_bytes, 1 << 30);
    }

    #[tokio::test]
    async fn prefix_delete_removes_nested_rows() {
        let (repo, _db) = repo().await;
        repo.upsert_file(private_file("docs/a.txt", 1), Some(SCOPE)).await.unwrap();
        repo.upsert_file(private_file("docs/sub/b.txt", 1), Some(SCOPE)).await.unwrap();
        repo.upsert_file(private_file("docs_other.txt", 1), Some(SCOPE)).await.unwrap();

        let removed = repo
            .delete_files("users/1/agents/2/docs/", Some(SCOPE))
            .await
            .unwrap();
        assert_eq!(removed, 2);
        let quota = repo.quota(SCOPE).await.unwrap();
        assert_eq!(quota.file_count, 1);
    }

    #[tokio::test]
    async fn prefix_delete_is_case_sensitive() {
        let (repo, _db) = repo().await;
        repo.upsert_file(private_file("docs/keep.txt", 5), Some(SCOPE)).await.unwrap();
        repo.upsert_file(private_file("Docs/gone.txt", 1), Some(SCOPE)).await.unwrap();
        repo.upsert_file(private_file("Docs_100%.txt", 2), Some(SCOPE)).await.unwrap();

        let removed = repo
            .delete_files("users/1/agents/2/Docs/", Some(SCOPE))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(repo.get_file("users/1/agents/2/docs/keep.txt").await.unwrap().is_some());
        let quota = repo.quota(SCOPE).await.unwrap();
        assert_eq!(quota.used_bytes, 7);
        assert_eq!(quota.file_count, 2);
    }

    #[tokio::test]
    async fn output_files_exclude_directories() {
        let (repo, _db) = repo().await;
        let mut chart = private_file("chart.png", 4);
        chart.workspace_type = WorkspaceType::Output;
        chart.object_key = "users/1/agents/2/output/chart.png".to_string();
        repo.upsert_file(chart, None).await.unwrap();

        let mut dir = private_file("plots/", 0);
        dir.workspace_type = WorkspaceType::Output;
        dir.object_key = "users/1/agents/2/output/plots/".to_string();
        dir.is_directory = true;
        repo.upsert_file(dir, None).await.unwrap();

        let files = repo.output_files(1, 2).await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].file_name, "chart.png");
    }

    #[tokio::test]
    async fn orphans_are_rows_of_missing_agents() {
        let (repo, _db) = repo().await;
        repo.upsert_file(private_file("a.txt", 1), Some(SCOPE)).await.unwrap();
        let orphans = repo.orphaned_files().await.unwrap();
        assert_eq!(orphans.len(), 1);

        let ids: Vec<i64> = orphans.iter().map(|f| f.id).collect();
        assert_eq!(repo.purge_orphans(&ids).await.unwrap(), 1);
        assert!(repo.orphaned_files().await.unwrap().is_empty());
    }
}
