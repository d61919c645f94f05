//! Sandbox pool - lifecycle, capacity, and sweeps.
//!
//! The pool owns all writes to the sandbox table and the in-memory
//! live-handle map. The map is authoritative for the run/wait distinction;
//! the database is authoritative for capacity. `mark_running` and
//! `mark_waiting` are synchronous map updates so an eviction decision can
//! never observe a stale run state; the matching row updates are flushed
//! fire-and-forget.

use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bridge::{Bridge, BridgeSpawnSpec, ResourceLimits};
use crate::db::{cutoff_rfc3339, now_rfc3339};
use crate::error::{CoreError, CoreResult};
use crate::metrics::{PoolStats, ResumeCounters};
use crate::workspace::{WorkspaceStore, dir_size};

use super::models::{Sandbox, SandboxState};
use super::repository::SandboxRepository;

/// Cadence of the waiting -> cold idle sweep.
const IDLE_SWEEP_PERIOD: Duration = Duration::from_secs(60);
/// Cadence of the cold-row cleanup sweep.
const COLD_SWEEP_PERIOD: Duration = Duration::from_secs(5 * 60);
/// Cadence of the workspace disk sweep.
const DISK_SWEEP_PERIOD: Duration = Duration::from_secs(30);
/// Grace given to a bridge on eviction shutdown.
const EVICT_GRACE: Duration = Duration::from_secs(5);
/// How many eviction candidates to fetch per attempt; entries that turned
/// out to be running in memory are skipped.
const EVICTION_BATCH: i64 = 16;

/// Callbacks into the session manager, wired after construction to keep
/// the pool free of a static cycle.
#[async_trait::async_trait]
pub trait EvictHook: Send + Sync {
    /// A waiting sandbox is about to lose its process (tier-3 eviction or
    /// idle sweep): persist the workspace and pause the session.
    async fn on_before_evict(&self, sandbox: &Sandbox);

    /// The workspace exceeded its disk quota and the sandbox is being
    /// destroyed.
    async fn on_disk_quota_exceeded(&self, sandbox: &Sandbox);
}

/// A live bridge handle plus the authoritative run flag.
#[derive(Debug)]
pub struct LiveBridge {
    pub bridge: Arc<Bridge>,
    running: AtomicBool,
}

impl LiveBridge {
    fn new(bridge: Arc<Bridge>) -> Self {
        Self {
            bridge,
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_capacity: i64,
    pub idle_timeout: Duration,
    pub cold_ttl: Duration,
    pub bridge_argv: Vec<String>,
    pub ready_timeout: Duration,
    pub limits: ResourceLimits,
    pub data_dir: PathBuf,
}

/// Request to create a sandbox bound to a session.
#[derive(Debug, Clone)]
pub struct CreateSandbox {
    /// Session id; doubles as the sandbox id and directory name.
    pub session_id: String,
    pub tenant: String,
    pub agent_name: String,
    pub agent_dir: PathBuf,
}

/// The sandbox pool.
pub struct SandboxPool {
    repo: SandboxRepository,
    workspace: WorkspaceStore,
    config: PoolConfig,
    live: DashMap<String, Arc<LiveBridge>>,
    counters: Arc<ResumeCounters>,
    evict_hook: RwLock<Option<Arc<dyn EvictHook>>>,
}

impl SandboxPool {
    pub fn new(repo: SandboxRepository, workspace: WorkspaceStore, config: PoolConfig) -> Self {
        Self {
            repo,
            workspace,
            config,
            live: DashMap::new(),
            counters: Arc::new(ResumeCounters::default()),
            evict_hook: RwLock::new(None),
        }
    }

    /// Wire the session manager's callbacks. Called once during startup.
    pub fn set_evict_hook(&self, hook: Arc<dyn EvictHook>) {
        *self.evict_hook.write().unwrap_or_else(|e| e.into_inner()) = Some(hook);
    }

    fn hook(&self) -> Option<Arc<dyn EvictHook>> {
        self.evict_hook
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Resume-path counters, shared with the session manager.
    pub fn counters(&self) -> Arc<ResumeCounters> {
        Arc::clone(&self.counters)
    }

    /// Restart recovery: any process recorded as live belonged to the
    /// previous incarnation of this server and is gone.
    pub async fn recover(&self) -> CoreResult<()> {
        let flipped = self.repo.mark_all_cold().await?;
        if flipped > 0 {
            info!(count = flipped, "marked orphaned sandboxes cold");
        }
        Ok(())
    }

    /// Create a sandbox for a session, evicting to make room if needed.
    /// The workspace must already be in place (restored or fresh).
    pub async fn create(&self, req: CreateSandbox) -> CoreResult<Arc<LiveBridge>> {
        self.ensure_capacity().await?;

        let now = now_rfc3339();
        let workspace_dir = self.workspace.live_dir(&req.session_id);
        let sandbox = Sandbox {
            id: req.session_id.clone(),
            tenant: req.tenant.clone(),
            session_id: Some(req.session_id.clone()),
            agent_name: req.agent_name.clone(),
            state: SandboxState::Warming,
            workspace_dir: workspace_dir.display().to_string(),
            created_at: now.clone(),
            last_used_at: now,
        };
        self.repo.insert(&sandbox).await?;

        match self.spawn_bridge(&req, &workspace_dir).await {
            Ok(live) => {
                self.repo
                    .update_state(&req.session_id, SandboxState::Warm)
                    .await?;
                self.live.insert(req.session_id.clone(), Arc::clone(&live));
                debug!(sandbox_id = %req.session_id, "sandbox warm");
                Ok(live)
            }
            Err(e) => {
                // Keep the row (cold) only if there is durable state worth
                // resuming from later.
                if self.workspace.snapshot_dir(&req.session_id).is_dir() {
                    let _ = self
                        .repo
                        .update_state(&req.session_id, SandboxState::Cold)
                        .await;
                } else {
                    let _ = self.repo.delete(&req.session_id).await;
                }
                Err(e)
            }
        }
    }

    async fn spawn_bridge(
        &self,
        req: &CreateSandbox,
        workspace_dir: &std::path::Path,
    ) -> CoreResult<Arc<LiveBridge>> {
        let spec = BridgeSpawnSpec {
            argv: self.config.bridge_argv.clone(),
            sandbox_dir: self.config.data_dir.join("sandboxes").join(&req.session_id),
            workspace_dir: workspace_dir.to_path_buf(),
            agent_dir: req.agent_dir.clone(),
            sandbox_id: req.session_id.clone(),
            session_id: req.session_id.clone(),
            ready_timeout: self.config.ready_timeout,
            limits: self.config.limits,
        };
        let bridge = Bridge::spawn(spec).await?;
        bridge.expect_ready().await?;
        Ok(Arc::new(LiveBridge::new(Arc::new(bridge))))
    }

    /// Live handle for a sandbox, if its process is attached here.
    pub fn get_live(&self, id: &str) -> Option<Arc<LiveBridge>> {
        self.live.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Flip a sandbox to running. Synchronous: must complete before any
    /// await in the message-send path so eviction can never pick it.
    pub fn mark_running(&self, id: &str) -> bool {
        let Some(entry) = self.live.get(id) else {
            return false;
        };
        entry.running.store(true, Ordering::SeqCst);
        self.flush_state(id, SandboxState::Running);
        true
    }

    /// Flip a sandbox back to waiting after a turn.
    pub fn mark_waiting(&self, id: &str) -> bool {
        let Some(entry) = self.live.get(id) else {
            return false;
        };
        entry.running.store(false, Ordering::SeqCst);
        self.flush_state(id, SandboxState::Waiting);
        true
    }

    /// Database writes of run/wait transitions are eventual.
    fn flush_state(&self, id: &str, state: SandboxState) {
        let repo = self.repo.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            if let Err(e) = repo.update_state(&id, state).await {
                warn!(sandbox_id = %id, error = ?e, "sandbox state flush failed");
            }
        });
    }

    /// Enforce the capacity cap, evicting at most one candidate per loop.
    async fn ensure_capacity(&self) -> CoreResult<()> {
        loop {
            if self.repo.count().await? < self.config.max_capacity {
                return Ok(());
            }
            if !self.evict_one().await? {
                return Err(CoreError::CapacityFull);
            }
        }
    }

    /// Evict the tier-preferred candidate. Returns false when everything
    /// left is running.
    async fn evict_one(&self) -> CoreResult<bool> {
        let candidates = self.repo.eviction_candidates(EVICTION_BATCH).await?;
        for sandbox in candidates {
            // The in-memory map is authoritative: a sandbox whose running
            // flag flipped after the query is off limits.
            if self
                .get_live(&sandbox.id)
                .is_some_and(|live| live.is_running())
            {
                continue;
            }
            self.evict(&sandbox).await;
            return Ok(true);
        }
        Ok(false)
    }

    async fn evict(&self, sandbox: &Sandbox) {
        info!(sandbox_id = %sandbox.id, state = %sandbox.state, "evicting sandbox");
        match sandbox.state {
            SandboxState::Cold => {
                // Tier 1: local snapshot and row go; the cloud snapshot is
                // the long-term backup and stays.
                self.workspace.remove_snapshot(&sandbox.id);
                self.delete_row(&sandbox.id).await;
            }
            SandboxState::Warm | SandboxState::Warming => {
                self.kill_live(&sandbox.id).await;
                self.delete_row(&sandbox.id).await;
            }
            SandboxState::Waiting => {
                if let Some(hook) = self.hook() {
                    hook.on_before_evict(sandbox).await;
                }
                self.kill_live(&sandbox.id).await;
                if let Err(e) = self.repo.update_state(&sandbox.id, SandboxState::Cold).await {
                    error!(sandbox_id = %sandbox.id, error = ?e, "cold transition failed");
                }
            }
            SandboxState::Running => unreachable!("eviction query excludes running"),
        }
    }

    async fn kill_live(&self, id: &str) {
        if let Some((_, live)) = self.live.remove(id) {
            live.bridge.shutdown(EVICT_GRACE).await;
        }
    }

    async fn delete_row(&self, id: &str) {
        if let Err(e) = self.repo.delete(id).await {
            error!(sandbox_id = %id, error = ?e, "sandbox row delete failed");
        }
    }

    /// Destroy a sandbox outright: process, row, and live workspace. Local
    /// and cloud snapshots are left alone.
    pub async fn destroy(&self, id: &str) {
        self.kill_live(id).await;
        self.delete_row(id).await;
        self.workspace.remove_live(id);
    }

    /// waiting -> cold for sandboxes idle past the timeout.
    pub async fn idle_sweep(&self) -> CoreResult<usize> {
        let cutoff = cutoff_rfc3339(self.config.idle_timeout.as_millis() as u64);
        let idle = self.repo.idle_waiting(&cutoff).await?;
        let mut evicted = 0;
        for sandbox in idle {
            if self
                .get_live(&sandbox.id)
                .is_some_and(|live| live.is_running())
            {
                continue;
            }
            self.evict(&sandbox).await;
            evicted += 1;
        }
        Ok(evicted)
    }

    /// Remove cold rows (and their directories) past the retention TTL.
    pub async fn cold_cleanup(&self) -> CoreResult<usize> {
        let cutoff = cutoff_rfc3339(self.config.cold_ttl.as_millis() as u64);
        let expired = self.repo.cold_expired(&cutoff).await?;
        let mut removed = 0;
        for sandbox in expired {
            self.workspace.remove_live(&sandbox.id);
            self.workspace.remove_snapshot(&sandbox.id);
            self.delete_row(&sandbox.id).await;
            removed += 1;
        }
        Ok(removed)
    }

    /// Destroy any live sandbox whose workspace outgrew the disk quota.
    pub async fn disk_sweep(&self) {
        let over: Vec<(String, u64)> = self
            .live
            .iter()
            .map(|entry| {
                let dir = self.workspace.live_dir(entry.key());
                (entry.key().clone(), dir_size(&dir))
            })
            .filter(|(_, size)| *size > self.config.limits.disk_bytes)
            .collect();

        for (id, size) in over {
            warn!(sandbox_id = %id, bytes = size, "workspace disk quota exceeded");
            if let (Some(hook), Ok(Some(sandbox))) = (self.hook(), self.repo.get(&id).await) {
                hook.on_disk_quota_exceeded(&sandbox).await;
            }
            self.destroy(&id).await;
        }
    }

    /// Start the periodic sweeps; they stop when the token is cancelled.
    pub fn spawn_sweeps(self: &Arc<Self>, cancel: CancellationToken) {
        for (period, which) in [
            (IDLE_SWEEP_PERIOD, Sweep::Idle),
            (COLD_SWEEP_PERIOD, Sweep::Cold),
            (DISK_SWEEP_PERIOD, Sweep::Disk),
        ] {
            let pool = Arc::clone(self);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    let result = match which {
                        Sweep::Idle => pool.idle_sweep().await.map(|_| ()),
                        Sweep::Cold => pool.cold_cleanup().await.map(|_| ()),
                        Sweep::Disk => {
                            pool.disk_sweep().await;
                            Ok(())
                        }
                    };
                    if let Err(e) = result {
                        error!(sweep = ?which, error = ?e, "sweep failed");
                    }
                }
            });
        }
    }

    /// Current pool statistics.
    pub async fn stats(&self) -> CoreResult<PoolStats> {
        let by_state = self.repo.count_by_state().await?;
        let get = |name: &str| {
            by_state
                .iter()
                .find(|(state, _)| state == name)
                .map(|(_, count)| *count)
                .unwrap_or(0)
        };
        let (warm_hits, cold_hits, local, cloud, fresh) = self.counters.snapshot();

        Ok(PoolStats {
            total: by_state.iter().map(|(_, count)| count).sum(),
            cold: get("cold"),
            warming: get("warming"),
            warm: get("warm"),
            waiting: get("waiting"),
            running: get("running"),
            max_capacity: self.config.max_capacity,
            resume_warm_hits: warm_hits,
            resume_cold_hits: cold_hits,
            resume_cold_local_hits: local,
            resume_cold_cloud_hits: cloud,
            resume_cold_fresh_hits: fresh,
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum Sweep {
    Idle,
    Cold,
    Disk,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use std::sync::Mutex;

    struct RecordingHook {
        evicted: Mutex<Vec<String>>,
        quota: Mutex<Vec<String>>,
    }

    impl RecordingHook {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                evicted: Mutex::new(Vec::new()),
                quota: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait::async_trait]
    impl EvictHook for RecordingHook {
        async fn on_before_evict(&self, sandbox: &Sandbox) {
            self.evicted.lock().unwrap().push(sandbox.id.clone());
        }

        async fn on_disk_quota_exceeded(&self, sandbox: &Sandbox) {
            self.quota.lock().unwrap().push(sandbox.id.clone());
        }
    }

    async fn pool_with_capacity(max: i64) -> (Arc<SandboxPool>, SandboxRepository, tempfile::TempDir) {
        let db = Database::in_memory().await.unwrap();
        let repo = SandboxRepository::new(db.pool().clone());
        let data = tempfile::tempdir().unwrap();
        let workspace = WorkspaceStore::new(data.path(), None, None);
        let pool = SandboxPool::new(
            repo.clone(),
            workspace,
            PoolConfig {
                max_capacity: max,
                idle_timeout: Duration::from_secs(30 * 60),
                cold_ttl: Duration::from_secs(2 * 3600),
                bridge_argv: vec!["/bin/false".to_string()],
                ready_timeout: Duration::from_millis(500),
                limits: ResourceLimits::default(),
                data_dir: data.path().to_path_buf(),
            },
        );
        (Arc::new(pool), repo, data)
    }

    fn row(id: &str, state: SandboxState, last_used_at: &str) -> Sandbox {
        Sandbox {
            id: id.to_string(),
            tenant: "default".to_string(),
            session_id: Some(id.to_string()),
            agent_name: "qa".to_string(),
            state,
            workspace_dir: String::new(),
            created_at: last_used_at.to_string(),
            last_used_at: last_used_at.to_string(),
        }
    }

    #[tokio::test]
    async fn test_capacity_full_when_everything_runs() {
        let (pool, repo, _data) = pool_with_capacity(2).await;
        repo.insert(&row("a", SandboxState::Running, "2026-01-01T00:00:00+00:00"))
            .await
            .unwrap();
        repo.insert(&row("b", SandboxState::Running, "2026-01-01T00:00:01+00:00"))
            .await
            .unwrap();

        let err = pool.ensure_capacity().await.unwrap_err();
        assert!(matches!(err, CoreError::CapacityFull));
        assert_eq!(repo.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_under_capacity_does_not_evict() {
        let (pool, repo, _data) = pool_with_capacity(2).await;
        repo.insert(&row("a", SandboxState::Waiting, "2026-01-01T00:00:00+00:00"))
            .await
            .unwrap();

        pool.ensure_capacity().await.unwrap();
        assert_eq!(repo.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_at_capacity_evicts_cold_first() {
        let (pool, repo, _data) = pool_with_capacity(2).await;
        repo.insert(&row("waiter", SandboxState::Waiting, "2026-01-01T00:00:00+00:00"))
            .await
            .unwrap();
        repo.insert(&row("colder", SandboxState::Cold, "2026-01-02T00:00:00+00:00"))
            .await
            .unwrap();

        pool.ensure_capacity().await.unwrap();
        assert!(repo.get("colder").await.unwrap().is_none());
        assert!(repo.get("waiter").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_waiting_eviction_runs_hook_and_goes_cold() {
        let (pool, repo, _data) = pool_with_capacity(1).await;
        let hook = RecordingHook::new();
        pool.set_evict_hook(hook.clone());

        repo.insert(&row("w", SandboxState::Waiting, "2026-01-01T00:00:00+00:00"))
            .await
            .unwrap();

        assert!(pool.evict_one().await.unwrap());
        assert_eq!(*hook.evicted.lock().unwrap(), vec!["w".to_string()]);
        assert_eq!(
            repo.get("w").await.unwrap().unwrap().state,
            SandboxState::Cold
        );
    }

    #[tokio::test]
    async fn test_idle_sweep_only_touches_stale_waiters() {
        let (pool, repo, _data) = pool_with_capacity(10).await;
        let hook = RecordingHook::new();
        pool.set_evict_hook(hook.clone());

        repo.insert(&row("stale", SandboxState::Waiting, "2020-01-01T00:00:00+00:00"))
            .await
            .unwrap();
        repo.insert(&row("fresh", SandboxState::Waiting, &now_rfc3339()))
            .await
            .unwrap();

        let evicted = pool.idle_sweep().await.unwrap();
        assert_eq!(evicted, 1);
        assert_eq!(
            repo.get("stale").await.unwrap().unwrap().state,
            SandboxState::Cold
        );
        assert_eq!(
            repo.get("fresh").await.unwrap().unwrap().state,
            SandboxState::Waiting
        );
    }

    #[tokio::test]
    async fn test_cold_cleanup_removes_expired_rows_and_dirs() {
        let (pool, repo, data) = pool_with_capacity(10).await;
        repo.insert(&row("old", SandboxState::Cold, "2020-01-01T00:00:00+00:00"))
            .await
            .unwrap();

        let live = data.path().join("sandboxes/old/workspace");
        let snap = data.path().join("sessions/old/workspace");
        std::fs::create_dir_all(&live).unwrap();
        std::fs::create_dir_all(&snap).unwrap();

        let removed = pool.cold_cleanup().await.unwrap();
        assert_eq!(removed, 1);
        assert!(repo.get("old").await.unwrap().is_none());
        assert!(!live.exists());
        assert!(!snap.exists());
    }

    #[tokio::test]
    async fn test_failed_create_cleans_up_row() {
        let (pool, repo, _data) = pool_with_capacity(10).await;
        let err = match pool
            .create(CreateSandbox {
                session_id: "s1".to_string(),
                tenant: "default".to_string(),
                agent_name: "qa".to_string(),
                agent_dir: PathBuf::from("/nonexistent"),
            })
            .await
        {
            Ok(_) => panic!("expected create to fail"),
            Err(e) => e,
        };
        assert!(matches!(err, CoreError::BridgeStartup { .. }));
        // No snapshot existed, so the warming row is gone entirely.
        assert!(repo.get("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stats_aggregates_states() {
        let (pool, repo, _data) = pool_with_capacity(10).await;
        repo.insert(&row("a", SandboxState::Cold, "2026-01-01T00:00:00+00:00"))
            .await
            .unwrap();
        repo.insert(&row("b", SandboxState::Waiting, "2026-01-01T00:00:00+00:00"))
            .await
            .unwrap();
        repo.insert(&row("c", SandboxState::Running, "2026-01-01T00:00:00+00:00"))
            .await
            .unwrap();

        let stats = pool.stats().await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.cold, 1);
        assert_eq!(stats.waiting, 1);
        assert_eq!(stats.running, 1);
        assert_eq!(stats.max_capacity, 10);
    }
}
