//! Session database repository, plus the append-only message and event
//! logs. Sequence numbers are assigned inside the INSERT itself so they
//! stay dense and unique per `(tenant, session_id)` without a lock.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::db::now_rfc3339;

use super::models::{Message, Session, SessionEvent, SessionStatus};

const COLUMNS: &str =
    "id, tenant, agent_name, sandbox_id, status, runner_id, created_at, last_active_at";

/// Repository for session persistence.
#[derive(Debug, Clone)]
pub struct SessionRepository {
    pool: SqlitePool,
}

impl SessionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, session: &Session) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (id, tenant, agent_name, sandbox_id, status,
                                  runner_id, created_at, last_active_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.id)
        .bind(&session.tenant)
        .bind(&session.agent_name)
        .bind(&session.sandbox_id)
        .bind(session.status.to_string())
        .bind(&session.runner_id)
        .bind(&session.created_at)
        .bind(&session.last_active_at)
        .execute(&self.pool)
        .await
        .context("creating session")?;

        Ok(())
    }

    pub async fn get(&self, tenant: &str, id: &str) -> Result<Option<Session>> {
        let session = sqlx::query_as::<_, Session>(&format!(
            "SELECT {COLUMNS} FROM sessions WHERE tenant = ? AND id = ?"
        ))
        .bind(tenant)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching session")?;

        Ok(session)
    }

    pub async fn list(&self, tenant: &str) -> Result<Vec<Session>> {
        let sessions = sqlx::query_as::<_, Session>(&format!(
            "SELECT {COLUMNS} FROM sessions WHERE tenant = ? ORDER BY created_at DESC"
        ))
        .bind(tenant)
        .fetch_all(&self.pool)
        .await
        .context("listing sessions")?;

        Ok(sessions)
    }

    /// Update status and bump activity. Ended sessions are terminal and
    /// never leave that status.
    pub async fn update_status(&self, id: &str, status: SessionStatus) -> Result<()> {
        sqlx::query(
            "UPDATE sessions SET status = ?, last_active_at = ?
             WHERE id = ? AND status != 'ended'",
        )
        .bind(status.to_string())
        .bind(now_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("updating session status")?;

        Ok(())
    }

    pub async fn set_sandbox(&self, id: &str, sandbox_id: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE sessions SET sandbox_id = ? WHERE id = ?")
            .bind(sandbox_id)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("setting session sandbox")?;

        Ok(())
    }

    pub async fn set_runner(&self, id: &str, runner_id: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE sessions SET runner_id = ? WHERE id = ?")
            .bind(runner_id)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("setting session runner")?;

        Ok(())
    }

    pub async fn touch(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET last_active_at = ? WHERE id = ?")
            .bind(now_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("touching session")?;

        Ok(())
    }

    /// Append a message with the next sequence number, atomically.
    pub async fn append_message(
        &self,
        tenant: &str,
        session_id: &str,
        role: &str,
        content: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO messages (tenant, session_id, sequence, role, content, created_at)
            SELECT ?, ?, COALESCE(MAX(sequence), 0) + 1, ?, ?, ?
            FROM messages WHERE tenant = ? AND session_id = ?
            "#,
        )
        .bind(tenant)
        .bind(session_id)
        .bind(role)
        .bind(content)
        .bind(now_rfc3339())
        .bind(tenant)
        .bind(session_id)
        .execute(&self.pool)
        .await
        .context("appending message")?;

        Ok(())
    }

    pub async fn list_messages(&self, tenant: &str, session_id: &str) -> Result<Vec<Message>> {
        let messages = sqlx::query_as::<_, Message>(
            "SELECT tenant, session_id, sequence, role, content, created_at
             FROM messages WHERE tenant = ? AND session_id = ? ORDER BY sequence",
        )
        .bind(tenant)
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .context("listing messages")?;

        Ok(messages)
    }

    /// Append a lifecycle event with the next sequence number, atomically.
    pub async fn append_event(
        &self,
        tenant: &str,
        session_id: &str,
        kind: &str,
        detail: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO session_events (tenant, session_id, sequence, kind, detail, created_at)
            SELECT ?, ?, COALESCE(MAX(sequence), 0) + 1, ?, ?, ?
            FROM session_events WHERE tenant = ? AND session_id = ?
            "#,
        )
        .bind(tenant)
        .bind(session_id)
        .bind(kind)
        .bind(detail)
        .bind(now_rfc3339())
        .bind(tenant)
        .bind(session_id)
        .execute(&self.pool)
        .await
        .context("appending session event")?;

        Ok(())
    }

    pub async fn list_events(&self, tenant: &str, session_id: &str) -> Result<Vec<SessionEvent>> {
        let events = sqlx::query_as::<_, SessionEvent>(
            "SELECT tenant, session_id, sequence, kind, detail, created_at
             FROM session_events WHERE tenant = ? AND session_id = ? ORDER BY sequence",
        )
        .bind(tenant)
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .context("listing session events")?;

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn session(id: &str, status: SessionStatus) -> Session {
        Session {
            id: id.to_string(),
            tenant: "default".to_string(),
            agent_name: "qa".to_string(),
            sandbox_id: Some(id.to_string()),
            status,
            runner_id: None,
            created_at: now_rfc3339(),
            last_active_at: now_rfc3339(),
        }
    }

    async fn repo() -> SessionRepository {
        let db = Database::in_memory().await.unwrap();
        SessionRepository::new(db.pool().clone())
    }

    #[tokio::test]
    async fn test_ended_is_terminal() {
        let repo = repo().await;
        repo.create(&session("s1", SessionStatus::Ended)).await.unwrap();

        repo.update_status("s1", SessionStatus::Active).await.unwrap();
        assert_eq!(
            repo.get("default", "s1").await.unwrap().unwrap().status,
            SessionStatus::Ended
        );
    }

    #[tokio::test]
    async fn test_message_sequences_are_dense_per_session() {
        let repo = repo().await;
        repo.append_message("default", "s1", "user", "one").await.unwrap();
        repo.append_message("default", "s1", "assistant", "two").await.unwrap();
        repo.append_message("default", "s2", "user", "other").await.unwrap();

        let messages = repo.list_messages("default", "s1").await.unwrap();
        let seqs: Vec<i64> = messages.iter().map(|m| m.sequence).collect();
        assert_eq!(seqs, vec![1, 2]);

        let other = repo.list_messages("default", "s2").await.unwrap();
        assert_eq!(other[0].sequence, 1);
    }

    #[tokio::test]
    async fn test_events_append_in_order() {
        let repo = repo().await;
        repo.append_event("default", "s1", "created", None).await.unwrap();
        repo.append_event("default", "s1", "paused", Some("evicted")).await.unwrap();

        let events = repo.list_events("default", "s1").await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].kind, "paused");
        assert_eq!(events[1].sequence, 2);
    }

    #[tokio::test]
    async fn test_tenant_scoping() {
        let repo = repo().await;
        repo.create(&session("s1", SessionStatus::Active)).await.unwrap();
        assert!(repo.get("other", "s1").await.unwrap().is_none());
    }
}
