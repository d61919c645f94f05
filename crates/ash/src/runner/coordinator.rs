//! Runner coordination: selection, routing, and the liveness sweep.
//!
//! Control-plane replicas are stateless with respect to each other; the
//! runners table is the only shared truth. The remote-backend cache here
//! is lookaside only and is rebuilt from the table at any time.

use dashmap::DashMap;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::db::cutoff_rfc3339;
use crate::error::{CoreError, CoreResult};
use crate::session::Session;
use crate::settings::Mode;

use super::backend::{RemoteBackend, RunnerBackend};
use super::models::Runner;
use super::repository::RunnerRepository;

/// Liveness sweep cadence; each tick adds 0-5s of jitter so replicas do
/// not stampede the database together.
const SWEEP_PERIOD: Duration = Duration::from_secs(30);
const SWEEP_JITTER_MS: u64 = 5_000;

/// Routes sessions to runner backends.
pub struct Coordinator {
    repo: RunnerRepository,
    mode: Mode,
    local: Arc<dyn RunnerBackend>,
    remotes: DashMap<String, Arc<RemoteBackend>>,
    client: reqwest::Client,
    liveness_timeout: Duration,
    internal_secret: Option<String>,
}

impl Coordinator {
    pub fn new(
        repo: RunnerRepository,
        mode: Mode,
        local: Arc<dyn RunnerBackend>,
        liveness_timeout: Duration,
        internal_secret: Option<String>,
    ) -> Self {
        Self {
            repo,
            mode,
            local,
            remotes: DashMap::new(),
            client: reqwest::Client::new(),
            liveness_timeout,
            internal_secret,
        }
    }

    pub fn repository(&self) -> &RunnerRepository {
        &self.repo
    }

    fn heartbeat_cutoff(&self) -> String {
        cutoff_rfc3339(self.liveness_timeout.as_millis() as u64)
    }

    fn remote_for(&self, runner: &Runner) -> Arc<dyn RunnerBackend> {
        let backend = self
            .remotes
            .entry(runner.id.clone())
            .or_insert_with(|| {
                Arc::new(RemoteBackend::new(
                    self.client.clone(),
                    runner.id.clone(),
                    runner.base_url(),
                    self.internal_secret.clone(),
                ))
            })
            .clone();
        backend
    }

    /// Select a backend for a new session: the local pool in standalone
    /// mode, otherwise the least-loaded healthy runner.
    pub async fn select_backend(&self) -> CoreResult<Arc<dyn RunnerBackend>> {
        match self.mode {
            Mode::Standalone => Ok(Arc::clone(&self.local)),
            Mode::Coordinator => {
                let runner = self
                    .repo
                    .select_least_loaded(&self.heartbeat_cutoff())
                    .await?
                    .ok_or(CoreError::NoRunners)?;
                Ok(self.remote_for(&runner))
            }
        }
    }

    /// Backend hosting an existing session. Any replica can route any
    /// session because the mapping lives in the database.
    pub async fn backend_for_session(&self, session: &Session) -> CoreResult<Arc<dyn RunnerBackend>> {
        match &session.runner_id {
            None => Ok(Arc::clone(&self.local)),
            Some(runner_id) => {
                let runner = self
                    .repo
                    .get(runner_id)
                    .await?
                    .ok_or(CoreError::NoRunners)?;
                Ok(self.remote_for(&runner))
            }
        }
    }

    /// Backend for a cold resume: the session's previous runner when it is
    /// still healthy (workspace locality), else a fresh selection.
    pub async fn backend_preferring(
        &self,
        previous: Option<&str>,
    ) -> CoreResult<Arc<dyn RunnerBackend>> {
        if let Some(runner_id) = previous {
            if self
                .repo
                .is_healthy(runner_id, &self.heartbeat_cutoff())
                .await?
            {
                if let Some(runner) = self.repo.get(runner_id).await? {
                    return Ok(self.remote_for(&runner));
                }
            }
        }
        self.select_backend().await
    }

    pub async fn is_runner_healthy(&self, runner_id: &str) -> CoreResult<bool> {
        Ok(self
            .repo
            .is_healthy(runner_id, &self.heartbeat_cutoff())
            .await?)
    }

    /// One liveness pass: pause sessions of dead runners, drop their rows,
    /// and purge stale cached handles. Every step is idempotent, so
    /// concurrent replicas sweeping the same runner converge.
    pub async fn liveness_sweep(&self) -> CoreResult<usize> {
        let dead = self.repo.dead(&self.heartbeat_cutoff()).await?;
        let swept = dead.len();
        for runner in dead {
            let paused = self.repo.deregister(&runner.id).await?;
            self.remotes.remove(&runner.id);
            warn!(runner_id = %runner.id, paused_sessions = paused, "dead runner removed");
        }

        // Cached handles for runners that vanished some other way.
        let live_ids: Vec<String> = self.repo.list().await?.into_iter().map(|r| r.id).collect();
        self.remotes.retain(|id, _| live_ids.contains(id));

        Ok(swept)
    }

    /// Start the periodic liveness sweep.
    pub fn spawn_sweep(self: &Arc<Self>, cancel: CancellationToken) {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let jitter = rand::rng().random_range(0..SWEEP_JITTER_MS);
                let wait = SWEEP_PERIOD + Duration::from_millis(jitter);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
                match coordinator.liveness_sweep().await {
                    Ok(0) => {}
                    Ok(n) => info!(count = n, "liveness sweep removed runners"),
                    Err(e) => error!(error = ?e, "liveness sweep failed"),
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentRepository, AgentService};
    use crate::bridge::ResourceLimits;
    use crate::db::Database;
    use crate::runner::backend::LocalBackend;
    use crate::sandbox::{PoolConfig, SandboxPool, SandboxRepository};
    use crate::session::{SessionRepository, SessionStatus};
    use crate::workspace::WorkspaceStore;

    async fn setup(mode: Mode) -> (Arc<Coordinator>, RunnerRepository, SessionRepository, tempfile::TempDir) {
        let db = Database::in_memory().await.unwrap();
        let data = tempfile::tempdir().unwrap();
        let workspace = WorkspaceStore::new(data.path(), None, None);
        let pool = Arc::new(SandboxPool::new(
            SandboxRepository::new(db.pool().clone()),
            workspace.clone(),
            PoolConfig {
                max_capacity: 10,
                idle_timeout: Duration::from_secs(1800),
                cold_ttl: Duration::from_secs(7200),
                bridge_argv: vec!["/bin/false".to_string()],
                ready_timeout: Duration::from_millis(100),
                limits: ResourceLimits::default(),
                data_dir: data.path().to_path_buf(),
            },
        ));
        let agents = AgentService::new(AgentRepository::new(db.pool().clone()));
        let local = Arc::new(LocalBackend::new(pool, workspace, agents));
        let repo = RunnerRepository::new(db.pool().clone());
        let coordinator = Arc::new(Coordinator::new(
            repo.clone(),
            mode,
            local,
            Duration::from_secs(30),
            None,
        ));
        (coordinator, repo, SessionRepository::new(db.pool().clone()), data)
    }

    #[tokio::test]
    async fn test_standalone_selects_local() {
        let (coordinator, _, _, _data) = setup(Mode::Standalone).await;
        let backend = coordinator.select_backend().await.unwrap();
        assert!(backend.runner_id().is_none());
    }

    #[tokio::test]
    async fn test_coordinator_without_runners_is_503() {
        let (coordinator, _, _, _data) = setup(Mode::Coordinator).await;
        let err = match coordinator.select_backend().await {
            Ok(_) => panic!("expected select_backend to fail"),
            Err(e) => e,
        };
        assert!(matches!(err, CoreError::NoRunners));
    }

    #[tokio::test]
    async fn test_coordinator_picks_least_loaded_runner() {
        let (coordinator, runners, _, _data) = setup(Mode::Coordinator).await;
        runners.upsert("busy", "h1", 7410, 10).await.unwrap();
        runners.heartbeat("busy", 8, 0).await.unwrap();
        runners.upsert("free", "h2", 7410, 10).await.unwrap();
        runners.heartbeat("free", 1, 0).await.unwrap();

        let backend = coordinator.select_backend().await.unwrap();
        assert_eq!(backend.runner_id().as_deref(), Some("free"));
    }

    #[tokio::test]
    async fn test_sweep_pauses_and_purges() {
        let (coordinator, runners, sessions, _data) = setup(Mode::Coordinator).await;
        runners.upsert("r1", "h", 7410, 10).await.unwrap();
        sessions
            .create(&crate::session::Session {
                id: "s1".to_string(),
                tenant: "default".to_string(),
                agent_name: "qa".to_string(),
                sandbox_id: Some("s1".to_string()),
                status: SessionStatus::Active,
                runner_id: Some("r1".to_string()),
                created_at: crate::db::now_rfc3339(),
                last_active_at: crate::db::now_rfc3339(),
            })
            .await
            .unwrap();

        // Stale the heartbeat by registering far in the past.
        sqlx::query("UPDATE runners SET last_heartbeat_at = '2020-01-01T00:00:00+00:00'")
            .execute(runners_pool(&runners))
            .await
            .unwrap();

        let swept = coordinator.liveness_sweep().await.unwrap();
        assert_eq!(swept, 1);
        assert!(runners.get("r1").await.unwrap().is_none());
        assert_eq!(
            sessions.get("default", "s1").await.unwrap().unwrap().status,
            SessionStatus::Paused
        );

        // A second replica sweeping concurrently sees nothing left to do.
        assert_eq!(coordinator.liveness_sweep().await.unwrap(), 0);
    }

    fn runners_pool(repo: &RunnerRepository) -> &sqlx::SqlitePool {
        // Test-only peek for staling heartbeats.
        repo.pool()
    }
}
