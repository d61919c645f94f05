//! Agent service - deploy validation and resolution.

use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{CoreError, CoreResult};

use super::models::Agent;
use super::repository::AgentRepository;

/// File every agent directory must contain; it is the system prompt the
/// bridge loads on startup.
pub const SYSTEM_PROMPT_FILE: &str = "CLAUDE.md";

/// Service for managing agents.
#[derive(Debug, Clone)]
pub struct AgentService {
    repo: AgentRepository,
}

impl AgentService {
    pub fn new(repo: AgentRepository) -> Self {
        Self { repo }
    }

    /// Deploy an agent from a directory. Redeploying an existing name bumps
    /// its version; sessions created afterwards pick up the new files.
    pub async fn deploy(&self, tenant: &str, name: &str, path: &str) -> CoreResult<Agent> {
        let dir = Path::new(path);
        if !dir.is_dir() {
            return Err(CoreError::bad_state(format!(
                "agent path is not a directory: {path}"
            )));
        }
        if !dir.join(SYSTEM_PROMPT_FILE).is_file() {
            return Err(CoreError::bad_state(format!(
                "agent directory missing {SYSTEM_PROMPT_FILE}: {path}"
            )));
        }

        let agent = self.repo.upsert(tenant, name, path).await?;
        info!(agent = %name, version = agent.version, "agent deployed");
        Ok(agent)
    }

    /// Resolve an agent or fail with `NotFound`.
    pub async fn resolve(&self, tenant: &str, name: &str) -> CoreResult<Agent> {
        self.repo
            .get(tenant, name)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("agent {name}")))
    }

    /// Directory of a resolved agent.
    pub async fn agent_dir(&self, tenant: &str, name: &str) -> CoreResult<PathBuf> {
        Ok(PathBuf::from(self.resolve(tenant, name).await?.path))
    }

    pub async fn list(&self, tenant: &str) -> CoreResult<Vec<Agent>> {
        Ok(self.repo.list(tenant).await?)
    }

    pub async fn delete(&self, tenant: &str, name: &str) -> CoreResult<()> {
        if !self.repo.delete(tenant, name).await? {
            return Err(CoreError::not_found(format!("agent {name}")));
        }
        info!(agent = %name, "agent deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    async fn service() -> AgentService {
        let db = Database::in_memory().await.unwrap();
        AgentService::new(AgentRepository::new(db.pool().clone()))
    }

    #[tokio::test]
    async fn test_deploy_requires_system_prompt() {
        let svc = service().await;
        let dir = tempfile::tempdir().unwrap();

        let err = svc
            .deploy("default", "qa", dir.path().to_str().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::BadState(_)));

        std::fs::write(dir.path().join(SYSTEM_PROMPT_FILE), "You are qa.").unwrap();
        let agent = svc
            .deploy("default", "qa", dir.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(agent.version, 1);
    }

    #[tokio::test]
    async fn test_resolve_missing_is_not_found() {
        let svc = service().await;
        let err = svc.resolve("default", "ghost").await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }
}
