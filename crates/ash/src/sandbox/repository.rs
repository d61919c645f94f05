//! Sandbox database repository.
//!
//! The pool is the only writer of this table. The eviction candidate query
//! encodes the tier order directly so selection is a single statement.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::db::now_rfc3339;

use super::models::{Sandbox, SandboxState};

const COLUMNS: &str =
    "id, tenant, session_id, agent_name, state, workspace_dir, created_at, last_used_at";

/// Repository for sandbox persistence.
#[derive(Debug, Clone)]
pub struct SandboxRepository {
    pool: SqlitePool,
}

impl SandboxRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, sandbox: &Sandbox) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sandboxes (id, tenant, session_id, agent_name, state,
                                   workspace_dir, created_at, last_used_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&sandbox.id)
        .bind(&sandbox.tenant)
        .bind(&sandbox.session_id)
        .bind(&sandbox.agent_name)
        .bind(sandbox.state.to_string())
        .bind(&sandbox.workspace_dir)
        .bind(&sandbox.created_at)
        .bind(&sandbox.last_used_at)
        .execute(&self.pool)
        .await
        .context("inserting sandbox")?;

        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Sandbox>> {
        let sandbox = sqlx::query_as::<_, Sandbox>(&format!(
            "SELECT {COLUMNS} FROM sandboxes WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching sandbox")?;

        Ok(sandbox)
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM sandboxes WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("deleting sandbox")?;

        Ok(())
    }

    /// Update state and bump `last_used_at`.
    pub async fn update_state(&self, id: &str, state: SandboxState) -> Result<()> {
        sqlx::query("UPDATE sandboxes SET state = ?, last_used_at = ? WHERE id = ?")
            .bind(state.to_string())
            .bind(now_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("updating sandbox state")?;

        Ok(())
    }

    /// Total sandbox rows; the database is authoritative for capacity.
    pub async fn count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sandboxes")
            .fetch_one(&self.pool)
            .await
            .context("counting sandboxes")?;

        Ok(count)
    }

    /// Rows per state, for the stats surface.
    pub async fn count_by_state(&self) -> Result<Vec<(String, i64)>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM sandboxes GROUP BY state")
                .fetch_all(&self.pool)
                .await
                .context("counting sandboxes by state")?;

        Ok(rows)
    }

    /// Eviction candidates in preference order: cold before warm before
    /// waiting, least-recently-used first, id as the deterministic
    /// tie-break. `running` is excluded by the predicate itself.
    pub async fn eviction_candidates(&self, limit: i64) -> Result<Vec<Sandbox>> {
        let sandboxes = sqlx::query_as::<_, Sandbox>(&format!(
            r#"
            SELECT {COLUMNS} FROM sandboxes
            WHERE state IN ('cold', 'warm', 'waiting')
            ORDER BY CASE state
                WHEN 'cold' THEN 0
                WHEN 'warm' THEN 1
                ELSE 2
            END, last_used_at ASC, id ASC
            LIMIT ?
            "#
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("selecting eviction candidates")?;

        Ok(sandboxes)
    }

    /// Waiting sandboxes idle since before the cutoff.
    pub async fn idle_waiting(&self, cutoff: &str) -> Result<Vec<Sandbox>> {
        let sandboxes = sqlx::query_as::<_, Sandbox>(&format!(
            "SELECT {COLUMNS} FROM sandboxes WHERE state = 'waiting' AND last_used_at < ?"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .context("selecting idle sandboxes")?;

        Ok(sandboxes)
    }

    /// Cold sandboxes unused since before the cutoff.
    pub async fn cold_expired(&self, cutoff: &str) -> Result<Vec<Sandbox>> {
        let sandboxes = sqlx::query_as::<_, Sandbox>(&format!(
            "SELECT {COLUMNS} FROM sandboxes WHERE state = 'cold' AND last_used_at < ?"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .context("selecting expired cold sandboxes")?;

        Ok(sandboxes)
    }

    /// Restart recovery: every non-cold row's process is gone by
    /// definition, so flip them all. Idempotent.
    pub async fn mark_all_cold(&self) -> Result<u64> {
        let result = sqlx::query("UPDATE sandboxes SET state = 'cold' WHERE state != 'cold'")
            .execute(&self.pool)
            .await
            .context("marking all sandboxes cold")?;

        Ok(result.rows_affected())
    }
}
