//! Session database repository.
//!
//! Status changes are compare-and-set on the prior status; bulk soft-deletes
//! take their `status IN (...)` filter from the event's legal sources.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tracing::{debug, instrument};

use super::models::{Session, SessionEvent, SessionStatus};
use crate::db::{is_unique_violation, now_timestamp};

const SESSION_COLUMNS: &str =
    "id, user_id, agent_id, pod_name, pod_ip, status, last_active, created_at, updated_at";

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Statuses a bulk `event` may move, narrowed to `within`.
fn bulk_sources(event: SessionEvent, within: &[SessionStatus]) -> Vec<&'static str> {
    event
        .legal_sources()
        .iter()
        .filter(|s| within.contains(s))
        .map(|s| s.as_str())
        .collect()
}

/// Repository for session persistence.
#[derive(Debug, Clone)]
pub struct SessionRepository {
    pool: SqlitePool,
}

impl SessionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a session. Returns false if another current session for the same
    /// (user, agent) already holds the slot.
    #[instrument(skip(self, session), fields(id = %session.id))]
    pub async fn insert(&self, session: &Session) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO sessions (id, user_id, agent_id, pod_name, pod_ip, status,
                                  last_active, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.id)
        .bind(session.user_id)
        .bind(session.agent_id)
        .bind(&session.pod_name)
        .bind(&session.pod_ip)
        .bind(session.status.as_str())
        .bind(&session.last_active)
        .bind(&session.created_at)
        .bind(&session.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(true),
            Err(e) if is_unique_violation(&e) => {
                debug!("Session slot already taken for {}/{}", session.user_id, session.agent_id);
                Ok(false)
            }
            Err(e) => Err(e).context("creating session"),
        }
    }

    pub async fn get(&self, id: &str) -> Result<Option<Session>> {
        let session = sqlx::query_as::<_, Session>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("getting session")?;
        Ok(session)
    }

    /// Most recent session for (user, agent) in one of `statuses`.
    pub async fn find_latest(
        &self,
        user_id: i64,
        agent_id: i64,
        statuses: &[SessionStatus],
    ) -> Result<Option<Session>> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions
             WHERE user_id = ? AND agent_id = ? AND status IN ({})
             ORDER BY created_at DESC LIMIT 1",
            placeholders(statuses.len())
        );
        let mut query = sqlx::query_as::<_, Session>(&sql).bind(user_id).bind(agent_id);
        for status in statuses {
            query = query.bind(status.as_str());
        }
        query
            .fetch_optional(&self.pool)
            .await
            .context("finding latest session")
    }

    /// Non-deleted sessions of a user, newest first.
    pub async fn list_for_user(&self, user_id: i64) -> Result<Vec<Session>> {
        let sessions = sqlx::query_as::<_, Session>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions
             WHERE user_id = ? AND status != 'deleted'
             ORDER BY created_at DESC, id"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("listing sessions for user")?;
        Ok(sessions)
    }

    /// Sessions whose sandbox is expected to be up.
    pub async fn list_active(&self) -> Result<Vec<Session>> {
        self.list_by_status(SessionStatus::ACTIVE).await
    }

    pub async fn list_by_status(&self, statuses: &[SessionStatus]) -> Result<Vec<Session>> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE status IN ({}) ORDER BY created_at",
            placeholders(statuses.len())
        );
        let mut query = sqlx::query_as::<_, Session>(&sql);
        for status in statuses {
            query = query.bind(status.as_str());
        }
        query
            .fetch_all(&self.pool)
            .await
            .context("listing sessions by status")
    }

    /// Current sessions, including ones stuck in `creating`, last updated before `cutoff`.
    pub async fn list_current_updated_before(&self, cutoff: &str) -> Result<Vec<Session>> {
        let statuses = SessionStatus::CURRENT;
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions
             WHERE status IN ({}) AND updated_at < ?
             ORDER BY updated_at",
            placeholders(statuses.len())
        );
        let mut query = sqlx::query_as::<_, Session>(&sql);
        for status in statuses {
            query = query.bind(status.as_str());
        }
        query
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await
            .context("listing stale sessions")
    }

    /// Apply `event` to a session, if it is still in status `from`.
    ///
    /// Returns the new status, or None when the row moved on concurrently.
    /// `Ready` and `Activity` also refresh `last_active` and, when given, the pod IP.
    #[instrument(skip(self))]
    pub async fn apply(
        &self,
        id: &str,
        from: SessionStatus,
        event: SessionEvent,
        pod_ip: Option<&str>,
    ) -> Result<Option<SessionStatus>> {
        let to = from.transition(event)?;
        let now = now_timestamp();
        let touches = matches!(event, SessionEvent::Ready | SessionEvent::Activity);

        let result = sqlx::query(
            r#"
            UPDATE sessions
            SET status = ?,
                updated_at = ?,
                last_active = CASE WHEN ? THEN ? ELSE last_active END,
                pod_ip = COALESCE(?, pod_ip)
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(to.as_str())
        .bind(&now)
        .bind(touches)
        .bind(&now)
        .bind(pod_ip)
        .bind(id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await
        .context("updating session status")?;

        Ok((result.rows_affected() > 0).then_some(to))
    }

    /// Soft-delete the user's current sessions on agents other than `keep_agent_id`.
    pub async fn soft_delete_other_agents(&self, user_id: i64, keep_agent_id: i64) -> Result<u64> {
        let sources = bulk_sources(SessionEvent::Delete, SessionStatus::CURRENT);
        let sql = format!(
            "UPDATE sessions SET status = ?, updated_at = ?
             WHERE user_id = ? AND agent_id != ? AND status IN ({})",
            placeholders(sources.len())
        );
        let mut query = sqlx::query(&sql)
            .bind(SessionEvent::Delete.target().as_str())
            .bind(now_timestamp())
            .bind(user_id)
            .bind(keep_agent_id);
        for status in sources {
            query = query.bind(status);
        }
        let result = query
            .execute(&self.pool)
            .await
            .context("closing other agent sessions")?;
        Ok(result.rows_affected())
    }

    /// Soft-delete the current sessions bound to one sandbox.
    pub async fn soft_delete_for_sandbox(&self, user_id: i64, agent_id: i64) -> Result<u64> {
        let sources = bulk_sources(SessionEvent::Delete, SessionStatus::CURRENT);
        let sql = format!(
            "UPDATE sessions SET status = ?, updated_at = ?
             WHERE user_id = ? AND agent_id = ? AND status IN ({})",
            placeholders(sources.len())
        );
        let mut query = sqlx::query(&sql)
            .bind(SessionEvent::Delete.target().as_str())
            .bind(now_timestamp())
            .bind(user_id)
            .bind(agent_id);
        for status in sources {
            query = query.bind(status);
        }
        let result = query
            .execute(&self.pool)
            .await
            .context("closing sandbox sessions")?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use uuid::Uuid;

    async fn repo() -> (SessionRepository, Database) {
        let db = Database::in_memory().await.unwrap();
        (SessionRepository::new(db.pool().clone()), db)
    }

    fn session(user_id: i64, agent_id: i64, status: SessionStatus) -> Session {
        let now = now_timestamp();
        Session {
            id: Uuid::new_v4().to_string(),
            user_id,
            agent_id,
            pod_name: format!("sandbox-{user_id}-{agent_id}-0"),
            pod_ip: "10.0.0.1".to_string(),
            status,
            last_active: now.clone(),
            created_at: now.clone(),
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn second_current_session_loses_the_slot() {
        let (repo, _db) = repo().await;
        assert!(repo.insert(&session(1, 2, SessionStatus::Creating)).await.unwrap());
        assert!(!repo.insert(&session(1, 2, SessionStatus::Running)).await.unwrap());
        // Deleted rows do not hold the slot
        assert!(repo.insert(&session(1, 2, SessionStatus::Deleted)).await.unwrap());
        assert!(repo.insert(&session(1, 3, SessionStatus::Running)).await.unwrap());
    }

    #[tokio::test]
    async fn apply_is_compare_and_set() {
        let (repo, _db) = repo().await;
        let s = session(1, 2, SessionStatus::Creating);
        repo.insert(&s).await.unwrap();

        let to = repo
            .apply(&s.id, SessionStatus::Creating, SessionEvent::Ready, Some("10.0.0.9"))
            .await
            .unwrap();
        assert_eq!(to, Some(SessionStatus::Running));

        // Stale prior status: no row updated
        let stale = repo
            .apply(&s.id, SessionStatus::Creating, SessionEvent::Ready, None)
            .await
            .unwrap();
        assert_eq!(stale, None);

        let stored = repo.get(&s.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Running);
        assert_eq!(stored.pod_ip, "10.0.0.9");
    }

    #[tokio::test]
    async fn apply_rejects_illegal_events() {
        let (repo, _db) = repo().await;
        let s = session(1, 2, SessionStatus::Deleted);
        repo.insert(&s).await.unwrap();
        assert!(
            repo.apply(&s.id, SessionStatus::Deleted, SessionEvent::Activity, None)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn soft_delete_other_agents_keeps_target_and_stopped() {
        let (repo, _db) = repo().await;
        let keep = session(1, 2, SessionStatus::Running);
        let other = session(1, 3, SessionStatus::Idle);
        let stopped = session(1, 4, SessionStatus::Stopped);
        let foreign = session(9, 3, SessionStatus::Running);
        for s in [&keep, &other, &stopped, &foreign] {
            repo.insert(s).await.unwrap();
        }

        assert_eq!(repo.soft_delete_other_agents(1, 2).await.unwrap(), 1);
        assert_eq!(
            repo.get(&other.id).await.unwrap().unwrap().status,
            SessionStatus::Deleted
        );
        assert_eq!(
            repo.get(&stopped.id).await.unwrap().unwrap().status,
            SessionStatus::Stopped
        );
        assert_eq!(
            repo.get(&foreign.id).await.unwrap().unwrap().status,
            SessionStatus::Running
        );
    }

    #[tokio::test]
    async fn listing_excludes_deleted_and_orders_newest_first() {
        let (repo, _db) = repo().await;
        let first = session(1, 2, SessionStatus::Stopped);
        repo.insert(&first).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let second = session(1, 3, SessionStatus::Running);
        repo.insert(&second).await.unwrap();
        repo.insert(&session(1, 4, SessionStatus::Deleted)).await.unwrap();

        let listed = repo.list_for_user(1).await.unwrap();
        let ids: Vec<_> = listed.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec![second.id.as_str(), first.id.as_str()]);
    }
}
