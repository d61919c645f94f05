//! Agent database repository.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::db::now_rfc3339;

use super::models::Agent;

/// Repository for agent persistence.
#[derive(Debug, Clone)]
pub struct AgentRepository {
    pool: SqlitePool,
}

impl AgentRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a new agent, or bump the version of an existing one.
    pub async fn upsert(&self, tenant: &str, name: &str, path: &str) -> Result<Agent> {
        let now = now_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO agents (tenant, name, version, path, created_at, updated_at)
            VALUES (?, ?, 1, ?, ?, ?)
            ON CONFLICT (tenant, name) DO UPDATE SET
                version = version + 1,
                path = excluded.path,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(tenant)
        .bind(name)
        .bind(path)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("upserting agent")?;

        self.get(tenant, name)
            .await?
            .context("agent vanished after upsert")
    }

    /// Get an agent by name.
    pub async fn get(&self, tenant: &str, name: &str) -> Result<Option<Agent>> {
        let agent = sqlx::query_as::<_, Agent>(
            "SELECT tenant, name, version, path, created_at, updated_at
             FROM agents WHERE tenant = ? AND name = ?",
        )
        .bind(tenant)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .context("fetching agent")?;

        Ok(agent)
    }

    /// List all agents for a tenant.
    pub async fn list(&self, tenant: &str) -> Result<Vec<Agent>> {
        let agents = sqlx::query_as::<_, Agent>(
            "SELECT tenant, name, version, path, created_at, updated_at
             FROM agents WHERE tenant = ? ORDER BY name",
        )
        .bind(tenant)
        .fetch_all(&self.pool)
        .await
        .context("listing agents")?;

        Ok(agents)
    }

    /// Delete an agent. Returns whether a row was removed.
    pub async fn delete(&self, tenant: &str, name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM agents WHERE tenant = ? AND name = ?")
            .bind(tenant)
            .bind(name)
            .execute(&self.pool)
            .await
            .context("deleting agent")?;

        Ok(result.rows_affected() > 0)
    }
}
