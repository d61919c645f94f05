//! Shared test harness: a full router over an in-memory database.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tempfile::TempDir;

use ash::agent::{AgentRepository, AgentService};
use ash::api::{AppState, create_router};
use ash::bridge::ResourceLimits;
use ash::db::Database;
use ash::runner::{Coordinator, LocalBackend, RunnerBackend, RunnerRepository};
use ash::sandbox::{EvictHook, PoolConfig, SandboxPool, SandboxRepository};
use ash::session::{SessionRepository, SessionService};
use ash::settings::Mode;
use ash::workspace::WorkspaceStore;

pub struct TestApp {
    pub router: Router,
    /// Keeps the data directory alive for the duration of the test.
    pub data_dir: TempDir,
}

pub struct TestAppOptions {
    pub max_sandboxes: i64,
    pub internal_secret: Option<String>,
    pub mode: Mode,
}

impl Default for TestAppOptions {
    fn default() -> Self {
        Self {
            max_sandboxes: 10,
            internal_secret: None,
            mode: Mode::Standalone,
        }
    }
}

pub async fn test_app() -> TestApp {
    test_app_with(TestAppOptions::default()).await
}

pub async fn test_app_with(options: TestAppOptions) -> TestApp {
    let db = Database::in_memory().await.unwrap();
    let data_dir = tempfile::tempdir().unwrap();

    let workspace = WorkspaceStore::new(data_dir.path(), None, None);
    let sandbox_repo = SandboxRepository::new(db.pool().clone());
    let pool = Arc::new(SandboxPool::new(
        sandbox_repo.clone(),
        workspace.clone(),
        PoolConfig {
            max_capacity: options.max_sandboxes,
            idle_timeout: Duration::from_secs(1800),
            cold_ttl: Duration::from_secs(7200),
            // No real bridge in router tests; spawns fail fast.
            bridge_argv: vec!["/bin/false".to_string()],
            ready_timeout: Duration::from_millis(200),
            limits: ResourceLimits::default(),
            data_dir: data_dir.path().to_path_buf(),
        },
    ));
    pool.recover().await.unwrap();

    let agents = AgentService::new(AgentRepository::new(db.pool().clone()));
    let local: Arc<dyn RunnerBackend> = Arc::new(LocalBackend::new(
        Arc::clone(&pool),
        workspace.clone(),
        agents.clone(),
    ));
    let coordinator = Arc::new(Coordinator::new(
        RunnerRepository::new(db.pool().clone()),
        options.mode,
        Arc::clone(&local),
        Duration::from_secs(30),
        options.internal_secret.clone(),
    ));
    let sessions = Arc::new(SessionService::new(
        SessionRepository::new(db.pool().clone()),
        sandbox_repo,
        agents.clone(),
        Arc::clone(&pool),
        workspace,
        Arc::clone(&coordinator),
        Duration::from_secs(30),
    ));
    pool.set_evict_hook(Arc::clone(&sessions) as Arc<dyn EvictHook>);

    let router = create_router(AppState {
        sessions,
        agents: Arc::new(agents),
        pool,
        coordinator,
        local,
        internal_secret: options.internal_secret,
        sse_write_timeout: Duration::from_secs(30),
    });

    TestApp { router, data_dir }
}

/// Create an agent directory with a valid system prompt.
pub fn agent_dir() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("CLAUDE.md"), "You are a test agent.").unwrap();
    dir
}
