//! Runner registry repository.
//!
//! The coordinator owns all writes to this table. Deregistration (graceful
//! or sweep-forced) pairs one bulk session pause with the row delete in a
//! single transaction; both statements are idempotent, so concurrent
//! control-plane replicas converge on the same final state.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::db::now_rfc3339;

use super::models::Runner;

const COLUMNS: &str =
    "id, host, port, max_sandboxes, active_count, warming_count, last_heartbeat_at, registered_at";

/// Repository for the runner registry.
#[derive(Debug, Clone)]
pub struct RunnerRepository {
    pool: SqlitePool,
}

impl RunnerRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Register a runner. Re-registering the same id refreshes the row
    /// instead of duplicating it.
    pub async fn upsert(&self, id: &str, host: &str, port: i64, max_sandboxes: i64) -> Result<()> {
        let now = now_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO runners (id, host, port, max_sandboxes, active_count,
                                 warming_count, last_heartbeat_at, registered_at)
            VALUES (?, ?, ?, ?, 0, 0, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                host = excluded.host,
                port = excluded.port,
                max_sandboxes = excluded.max_sandboxes,
                last_heartbeat_at = excluded.last_heartbeat_at
            "#,
        )
        .bind(id)
        .bind(host)
        .bind(port)
        .bind(max_sandboxes)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("registering runner")?;

        Ok(())
    }

    /// Record a heartbeat. Returns false for an unknown runner, which
    /// should re-register.
    pub async fn heartbeat(&self, id: &str, active: i64, warming: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE runners SET active_count = ?, warming_count = ?, last_heartbeat_at = ?
             WHERE id = ?",
        )
        .bind(active)
        .bind(warming)
        .bind(now_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("recording heartbeat")?;

        Ok(result.rows_affected() > 0)
    }

    /// Remove a runner: pause its non-terminal sessions in one bulk
    /// statement, then delete the row. Safe to run for an already-removed
    /// runner.
    pub async fn deregister(&self, id: &str) -> Result<u64> {
        let mut tx = self.pool.begin().await.context("starting deregister")?;

        let paused = sqlx::query(
            "UPDATE sessions SET status = 'paused', last_active_at = ?
             WHERE runner_id = ? AND status IN ('active', 'starting')",
        )
        .bind(now_rfc3339())
        .bind(id)
        .execute(&mut *tx)
        .await
        .context("pausing runner sessions")?
        .rows_affected();

        sqlx::query("DELETE FROM runners WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .context("deleting runner")?;

        tx.commit().await.context("committing deregister")?;
        Ok(paused)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Runner>> {
        let runner =
            sqlx::query_as::<_, Runner>(&format!("SELECT {COLUMNS} FROM runners WHERE id = ?"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .context("fetching runner")?;

        Ok(runner)
    }

    pub async fn list(&self) -> Result<Vec<Runner>> {
        let runners =
            sqlx::query_as::<_, Runner>(&format!("SELECT {COLUMNS} FROM runners ORDER BY id"))
                .fetch_all(&self.pool)
                .await
                .context("listing runners")?;

        Ok(runners)
    }

    /// Healthy runner with the most free capacity.
    pub async fn select_least_loaded(&self, heartbeat_cutoff: &str) -> Result<Option<Runner>> {
        let runner = sqlx::query_as::<_, Runner>(&format!(
            r#"
            SELECT {COLUMNS} FROM runners
            WHERE last_heartbeat_at > ?
            ORDER BY (max_sandboxes - active_count - warming_count) DESC, id ASC
            LIMIT 1
            "#
        ))
        .bind(heartbeat_cutoff)
        .fetch_optional(&self.pool)
        .await
        .context("selecting runner")?;

        Ok(runner)
    }

    /// Runners whose heartbeat is older than the cutoff.
    pub async fn dead(&self, heartbeat_cutoff: &str) -> Result<Vec<Runner>> {
        let runners = sqlx::query_as::<_, Runner>(&format!(
            "SELECT {COLUMNS} FROM runners WHERE last_heartbeat_at <= ?"
        ))
        .bind(heartbeat_cutoff)
        .fetch_all(&self.pool)
        .await
        .context("selecting dead runners")?;

        Ok(runners)
    }

    /// Liveness check for a single runner.
    pub async fn is_healthy(&self, id: &str, heartbeat_cutoff: &str) -> Result<bool> {
        Ok(self
            .get(id)
            .await?
            .map(|runner| runner.last_heartbeat_at.as_str() > heartbeat_cutoff)
            .unwrap_or(false))
    }
}
