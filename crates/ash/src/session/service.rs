//! Session service - lifecycle orchestration.
//!
//! Owns all writes to session status. Message turns run as one task from
//! request arrival to stream close; the capacity-1 channel between the
//! turn driver and the SSE writer is what bounds per-connection memory and
//! carries client backpressure into the bridge read loop.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};
use uuid::Uuid;

use ash_bridge_protocol::{BridgeCommand, BridgeEvent};

use crate::agent::AgentService;
use crate::db::now_rfc3339;
use crate::error::{CoreError, CoreResult};
use crate::runner::{Coordinator, NewSandbox, RunnerBackend};
use crate::sandbox::{EvictHook, Sandbox, SandboxPool, SandboxRepository, SandboxState};
use crate::workspace::WorkspaceStore;

use super::models::{Session, SessionStatus};
use super::repository::SessionRepository;

/// Service for managing sessions.
#[derive(Clone)]
pub struct SessionService {
    repo: SessionRepository,
    sandboxes: SandboxRepository,
    agents: AgentService,
    pool: Arc<SandboxPool>,
    workspace: WorkspaceStore,
    coordinator: Arc<Coordinator>,
    sse_write_timeout: Duration,
}

impl SessionService {
    pub fn new(
        repo: SessionRepository,
        sandboxes: SandboxRepository,
        agents: AgentService,
        pool: Arc<SandboxPool>,
        workspace: WorkspaceStore,
        coordinator: Arc<Coordinator>,
        sse_write_timeout: Duration,
    ) -> Self {
        Self {
            repo,
            sandboxes,
            agents,
            pool,
            workspace,
            coordinator,
            sse_write_timeout,
        }
    }

    async fn resolve(&self, tenant: &str, id: &str) -> CoreResult<Session> {
        self.repo
            .get(tenant, id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("session {id}")))
    }

    pub async fn get(&self, tenant: &str, id: &str) -> CoreResult<Session> {
        self.resolve(tenant, id).await
    }

    pub async fn list(&self, tenant: &str) -> CoreResult<Vec<Session>> {
        Ok(self.repo.list(tenant).await?)
    }

    /// Create a session: resolve the agent, pick a backend, bind a sandbox
    /// whose id and directory are the session id.
    pub async fn create(&self, tenant: &str, agent_name: &str) -> CoreResult<Session> {
        self.agents.resolve(tenant, agent_name).await?;
        let backend = self.coordinator.select_backend().await?;

        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        let session = Session {
            id: id.clone(),
            tenant: tenant.to_string(),
            agent_name: agent_name.to_string(),
            sandbox_id: None,
            status: SessionStatus::Starting,
            runner_id: backend.runner_id(),
            created_at: now.clone(),
            last_active_at: now,
        };
        self.repo.create(&session).await?;
        self.log_event(tenant, &id, "created", None).await;

        let placement = NewSandbox {
            session_id: id.clone(),
            tenant: tenant.to_string(),
            agent_name: agent_name.to_string(),
            resume: false,
        };
        match backend.create_sandbox(&placement).await {
            Ok(_) => {
                self.repo.set_sandbox(&id, Some(&id)).await?;
                self.repo.update_status(&id, SessionStatus::Active).await?;
                info!(session_id = %id, agent = %agent_name, "session active");
                self.resolve(tenant, &id).await
            }
            Err(e) => {
                let _ = self.repo.update_status(&id, SessionStatus::Error).await;
                self.log_event(tenant, &id, "start_failed", Some(&e.to_string()))
                    .await;
                Err(e)
            }
        }
    }

    /// Run one message turn, returning the ordered event stream for the
    /// SSE writer. The sandbox is flipped to running before the first
    /// await on the bridge, so an eviction decision can never catch this
    /// session idle mid-turn.
    pub async fn send_message(
        &self,
        tenant: &str,
        id: &str,
        content: &str,
    ) -> CoreResult<ReceiverStream<BridgeEvent>> {
        let session = self.resolve(tenant, id).await?;
        if session.status != SessionStatus::Active {
            return Err(CoreError::bad_state(format!(
                "session is {}, not active",
                session.status
            )));
        }

        let backend = self.coordinator.backend_for_session(&session).await?;
        self.repo.append_message(tenant, id, "user", content).await?;

        backend.mark_running(id).await?;
        let events = match backend
            .send_command(
                id,
                BridgeCommand::Query {
                    prompt: content.to_string(),
                    session_id: id.to_string(),
                    include_partial_messages: None,
                },
            )
            .await
        {
            Ok(events) => events,
            Err(e) => {
                let _ = backend.mark_waiting(id).await;
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(drive_turn(TurnContext {
            repo: self.repo.clone(),
            backend,
            tenant: tenant.to_string(),
            session_id: id.to_string(),
            write_timeout: self.sse_write_timeout,
            events,
            tx,
        }));

        Ok(ReceiverStream::new(rx))
    }

    /// Pause an active session. The sandbox process stays alive so a warm
    /// resume is O(1).
    pub async fn pause(&self, tenant: &str, id: &str) -> CoreResult<Session> {
        let session = self.resolve(tenant, id).await?;
        if session.status != SessionStatus::Active {
            return Err(CoreError::bad_state(format!(
                "cannot pause a {} session",
                session.status
            )));
        }

        let backend = self.coordinator.backend_for_session(&session).await?;
        if let Err(e) = backend.persist_state(id).await {
            warn!(session_id = %id, error = ?e, "persist on pause failed");
        }
        self.repo.update_status(id, SessionStatus::Paused).await?;
        self.log_event(tenant, id, "paused", Some("explicit")).await;
        self.resolve(tenant, id).await
    }

    /// Resume a session: warm when the process is still there and its
    /// owner is healthy, cold otherwise.
    pub async fn resume(&self, tenant: &str, id: &str) -> CoreResult<Session> {
        let session = self.resolve(tenant, id).await?;
        match session.status {
            SessionStatus::Active => return Ok(session),
            SessionStatus::Ended => return Err(CoreError::Gone(id.to_string())),
            SessionStatus::Starting | SessionStatus::Paused | SessionStatus::Error => {}
        }

        if self.warm_resumable(&session).await? {
            self.repo.update_status(id, SessionStatus::Active).await?;
            self.pool.counters().record_warm();
            self.log_event(tenant, id, "resumed", Some("warm")).await;
            return self.resolve(tenant, id).await;
        }

        // Cold path: place on the previous runner when it is healthy, else
        // wherever the coordinator prefers, and restore the workspace.
        let backend = self
            .coordinator
            .backend_preferring(session.runner_id.as_deref())
            .await?;
        self.repo
            .set_runner(id, backend.runner_id().as_deref())
            .await?;

        let placement = NewSandbox {
            session_id: id.to_string(),
            tenant: tenant.to_string(),
            agent_name: session.agent_name.clone(),
            resume: true,
        };
        let source = backend.create_sandbox(&placement).await?;
        self.pool.counters().record_cold(source);

        // The SDK reattaches to its conversation log in the restored
        // workspace before the next query arrives.
        backend
            .send_control(
                id,
                BridgeCommand::Resume {
                    session_id: id.to_string(),
                },
            )
            .await?;

        self.repo.set_sandbox(id, Some(id)).await?;
        self.repo.update_status(id, SessionStatus::Active).await?;
        self.log_event(tenant, id, "resumed", Some(&source.to_string()))
            .await;
        self.resolve(tenant, id).await
    }

    async fn warm_resumable(&self, session: &Session) -> CoreResult<bool> {
        let Some(sandbox) = self.sandboxes.get(&session.id).await.map_err(CoreError::Internal)?
        else {
            return Ok(false);
        };
        if !matches!(
            sandbox.state,
            SandboxState::Warm | SandboxState::Waiting | SandboxState::Running
        ) {
            return Ok(false);
        }

        match &session.runner_id {
            None => match self.pool.get_live(&session.id) {
                Some(live) => Ok(live.bridge.is_alive().await),
                None => Ok(false),
            },
            Some(runner_id) => self.coordinator.is_runner_healthy(runner_id).await,
        }
    }

    /// End a session: persist, tear down the sandbox, mark terminal.
    pub async fn end(&self, tenant: &str, id: &str) -> CoreResult<()> {
        let session = self.resolve(tenant, id).await?;
        if session.is_terminal() {
            return Ok(());
        }

        match self.coordinator.backend_for_session(&session).await {
            Ok(backend) => {
                if let Err(e) = backend.persist_state(id).await {
                    warn!(session_id = %id, error = ?e, "persist on end failed");
                }
                if let Err(e) = backend.destroy_sandbox(id).await {
                    warn!(session_id = %id, error = ?e, "sandbox teardown failed");
                }
            }
            // The owning runner is gone; its sweep already reclaimed the
            // sandbox.
            Err(CoreError::NoRunners) => {}
            Err(e) => return Err(e),
        }

        self.repo.set_sandbox(id, None).await?;
        self.repo.update_status(id, SessionStatus::Ended).await?;
        self.log_event(tenant, id, "ended", None).await;
        Ok(())
    }

    async fn log_event(&self, tenant: &str, id: &str, kind: &str, detail: Option<&str>) {
        if let Err(e) = self.repo.append_event(tenant, id, kind, detail).await {
            warn!(session_id = %id, kind = %kind, error = ?e, "event append failed");
        }
    }
}

#[async_trait::async_trait]
impl EvictHook for SessionService {
    async fn on_before_evict(&self, sandbox: &Sandbox) {
        self.workspace.persist(&sandbox.id).await;
        if let Some(session_id) = &sandbox.session_id {
            if let Err(e) = self.repo.update_status(session_id, SessionStatus::Paused).await {
                warn!(session_id = %session_id, error = ?e, "pause on eviction failed");
            }
            self.log_event(&sandbox.tenant, session_id, "paused", Some("evicted"))
                .await;
        }
    }

    async fn on_disk_quota_exceeded(&self, sandbox: &Sandbox) {
        if let Some(session_id) = &sandbox.session_id {
            if let Err(e) = self.repo.update_status(session_id, SessionStatus::Error).await {
                warn!(session_id = %session_id, error = ?e, "error status on quota failed");
            }
            self.log_event(&sandbox.tenant, session_id, "disk_quota_exceeded", None)
                .await;
        }
    }
}

struct TurnContext {
    repo: SessionRepository,
    backend: Arc<dyn RunnerBackend>,
    tenant: String,
    session_id: String,
    write_timeout: Duration,
    events: crate::runner::EventStream,
    tx: mpsc::Sender<BridgeEvent>,
}

/// Drive one turn to completion. Keeps draining bridge events after the
/// client dies so the sandbox still reaches `waiting` and the workspace
/// still persists.
async fn drive_turn(ctx: TurnContext) {
    use futures::StreamExt;

    let TurnContext {
        repo,
        backend,
        tenant,
        session_id,
        write_timeout,
        mut events,
        tx,
    } = ctx;

    let mut client_alive = true;
    let mut completed = false;

    while let Some(event) = events.next().await {
        let is_done = matches!(event, BridgeEvent::Done { .. });

        if client_alive {
            match tokio::time::timeout(write_timeout, tx.send(event)).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => {
                    // Receiver dropped: the client disconnected.
                    client_alive = false;
                }
                Err(_) => {
                    info!(session_id = %session_id, "client stopped draining; closing its stream");
                    client_alive = false;
                }
            }
        }

        if is_done {
            completed = true;
            break;
        }
    }
    drop(tx);

    if completed {
        // Waiting strictly before persistence, so the next message cannot
        // race an in-flight snapshot read.
        if let Err(e) = backend.mark_waiting(&session_id).await {
            warn!(session_id = %session_id, error = ?e, "mark waiting failed");
        }
        if let Err(e) = backend.persist_state(&session_id).await {
            warn!(session_id = %session_id, error = ?e, "persist after turn failed");
        }
        let _ = repo.touch(&session_id).await;
        let _ = repo.append_event(&tenant, &session_id, "turn_completed", None).await;
        return;
    }

    // The stream broke without a done: the bridge died mid-turn.
    let oom = backend.crash_was_oom(&session_id).await.unwrap_or(false);
    let status = if oom {
        SessionStatus::Paused
    } else {
        SessionStatus::Error
    };
    warn!(session_id = %session_id, oom = oom, "bridge died mid-turn");
    let _ = repo.update_status(&session_id, status).await;
    let _ = repo
        .append_event(
            &tenant,
            &session_id,
            "bridge_crashed",
            Some(if oom { "oom" } else { "exit" }),
        )
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentRepository;
    use crate::bridge::ResourceLimits;
    use crate::db::Database;
    use crate::runner::LocalBackend;
    use crate::sandbox::PoolConfig;
    use crate::settings::Mode;

    async fn service() -> (SessionService, tempfile::TempDir) {
        let db = Database::in_memory().await.unwrap();
        let data = tempfile::tempdir().unwrap();
        let workspace = WorkspaceStore::new(data.path(), None, None);
        let sandboxes = SandboxRepository::new(db.pool().clone());
        let pool = Arc::new(SandboxPool::new(
            sandboxes.clone(),
            workspace.clone(),
            PoolConfig {
                max_capacity: 10,
                idle_timeout: Duration::from_secs(1800),
                cold_ttl: Duration::from_secs(7200),
                bridge_argv: vec!["/bin/false".to_string()],
                ready_timeout: Duration::from_millis(200),
                limits: ResourceLimits::default(),
                data_dir: data.path().to_path_buf(),
            },
        ));
        let agents = AgentService::new(AgentRepository::new(db.pool().clone()));
        let local = Arc::new(LocalBackend::new(
            Arc::clone(&pool),
            workspace.clone(),
            agents.clone(),
        ));
        let coordinator = Arc::new(Coordinator::new(
            crate::runner::RunnerRepository::new(db.pool().clone()),
            Mode::Standalone,
            local,
            Duration::from_secs(30),
            None,
        ));
        let service = SessionService::new(
            SessionRepository::new(db.pool().clone()),
            sandboxes,
            agents,
            pool,
            workspace,
            coordinator,
            Duration::from_secs(30),
        );
        (service, data)
    }

    #[tokio::test]
    async fn test_create_unknown_agent_is_not_found() {
        let (service, _data) = service().await;
        let err = service.create("default", "ghost").await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_create_with_failing_bridge_marks_error() {
        let (service, _data) = service().await;
        let agent_dir = tempfile::tempdir().unwrap();
        std::fs::write(agent_dir.path().join("CLAUDE.md"), "You are qa.").unwrap();
        service
            .agents
            .deploy("default", "qa", agent_dir.path().to_str().unwrap())
            .await
            .unwrap();

        let err = service.create("default", "qa").await.unwrap_err();
        assert!(matches!(err, CoreError::BridgeStartup { .. }));

        let sessions = service.list("default").await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].status, SessionStatus::Error);

        let events = service
            .repo
            .list_events("default", &sessions[0].id)
            .await
            .unwrap();
        assert_eq!(events[0].kind, "created");
        assert_eq!(events[1].kind, "start_failed");
    }

    #[tokio::test]
    async fn test_send_requires_active() {
        let (service, _data) = service().await;
        service
            .repo
            .create(&Session {
                id: "s1".to_string(),
                tenant: "default".to_string(),
                agent_name: "qa".to_string(),
                sandbox_id: None,
                status: SessionStatus::Paused,
                runner_id: None,
                created_at: now_rfc3339(),
                last_active_at: now_rfc3339(),
            })
            .await
            .unwrap();

        let err = service.send_message("default", "s1", "hi").await.unwrap_err();
        assert!(matches!(err, CoreError::BadState(_)));
    }

    #[tokio::test]
    async fn test_resume_ended_is_gone() {
        let (service, _data) = service().await;
        service
            .repo
            .create(&Session {
                id: "s1".to_string(),
                tenant: "default".to_string(),
                agent_name: "qa".to_string(),
                sandbox_id: None,
                status: SessionStatus::Ended,
                runner_id: None,
                created_at: now_rfc3339(),
                last_active_at: now_rfc3339(),
            })
            .await
            .unwrap();

        let err = service.resume("default", "s1").await.unwrap_err();
        assert!(matches!(err, CoreError::Gone(_)));
    }

    #[tokio::test]
    async fn test_resume_active_is_noop() {
        let (service, _data) = service().await;
        service
            .repo
            .create(&Session {
                id: "s1".to_string(),
                tenant: "default".to_string(),
                agent_name: "qa".to_string(),
                sandbox_id: Some("s1".to_string()),
                status: SessionStatus::Active,
                runner_id: None,
                created_at: now_rfc3339(),
                last_active_at: now_rfc3339(),
            })
            .await
            .unwrap();

        let session = service.resume("default", "s1").await.unwrap();
        assert_eq!(session.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn test_end_is_idempotent_and_terminal() {
        let (service, _data) = service().await;
        service
            .repo
            .create(&Session {
                id: "s1".to_string(),
                tenant: "default".to_string(),
                agent_name: "qa".to_string(),
                sandbox_id: Some("s1".to_string()),
                status: SessionStatus::Paused,
                runner_id: None,
                created_at: now_rfc3339(),
                last_active_at: now_rfc3339(),
            })
            .await
            .unwrap();

        service.end("default", "s1").await.unwrap();
        let session = service.get("default", "s1").await.unwrap();
        assert_eq!(session.status, SessionStatus::Ended);
        assert!(session.sandbox_id.is_none());

        // Second end is a no-op, and the status can never leave ended.
        service.end("default", "s1").await.unwrap();
        let err = service.resume("default", "s1").await.unwrap_err();
        assert!(matches!(err, CoreError::Gone(_)));
    }

    #[derive(Default)]
    struct MockBackend {
        waiting: std::sync::Mutex<Vec<String>>,
        persisted: std::sync::Mutex<Vec<String>>,
        oom: Option<bool>,
    }

    #[async_trait::async_trait]
    impl RunnerBackend for MockBackend {
        fn runner_id(&self) -> Option<String> {
            None
        }

        async fn create_sandbox(
            &self,
            _req: &NewSandbox,
        ) -> crate::error::CoreResult<crate::workspace::RestoreSource> {
            Err(CoreError::bad_state("not in this test"))
        }

        async fn destroy_sandbox(&self, _session_id: &str) -> crate::error::CoreResult<()> {
            Ok(())
        }

        async fn send_command(
            &self,
            _session_id: &str,
            _cmd: BridgeCommand,
        ) -> crate::error::CoreResult<crate::runner::EventStream> {
            Err(CoreError::bad_state("not in this test"))
        }

        async fn send_control(
            &self,
            _session_id: &str,
            _cmd: BridgeCommand,
        ) -> crate::error::CoreResult<()> {
            Ok(())
        }

        async fn mark_running(&self, _session_id: &str) -> crate::error::CoreResult<()> {
            Ok(())
        }

        async fn mark_waiting(&self, session_id: &str) -> crate::error::CoreResult<()> {
            self.waiting.lock().unwrap().push(session_id.to_string());
            Ok(())
        }

        async fn persist_state(&self, session_id: &str) -> crate::error::CoreResult<()> {
            self.persisted.lock().unwrap().push(session_id.to_string());
            Ok(())
        }

        async fn get_stats(&self) -> crate::error::CoreResult<crate::metrics::PoolStats> {
            Err(CoreError::bad_state("not in this test"))
        }

        async fn crash_was_oom(&self, _session_id: &str) -> Option<bool> {
            self.oom
        }
    }

    /// A dead client must not stop the turn: the bridge stream drains to
    /// done, the sandbox flips to waiting, and the workspace persists.
    #[tokio::test]
    async fn test_turn_completes_after_client_disconnect() {
        use futures::StreamExt;

        let db = Database::in_memory().await.unwrap();
        let repo = SessionRepository::new(db.pool().clone());
        let backend = Arc::new(MockBackend::default());

        let events = futures::stream::iter(vec![
            BridgeEvent::Message {
                data: serde_json::json!({"text": "partial"}),
            },
            BridgeEvent::Done {
                session_id: "s1".to_string(),
            },
        ])
        .boxed();

        let (tx, rx) = tokio::sync::mpsc::channel(1);
        drop(rx); // client gone before the first frame

        drive_turn(TurnContext {
            repo: repo.clone(),
            backend: backend.clone(),
            tenant: "default".to_string(),
            session_id: "s1".to_string(),
            write_timeout: Duration::from_millis(50),
            events,
            tx,
        })
        .await;

        assert_eq!(*backend.waiting.lock().unwrap(), vec!["s1".to_string()]);
        assert_eq!(*backend.persisted.lock().unwrap(), vec!["s1".to_string()]);
        let events = repo.list_events("default", "s1").await.unwrap();
        assert_eq!(events[0].kind, "turn_completed");
    }

    /// A stream that breaks without done is a mid-turn crash: OOM pauses
    /// the session, anything else marks it error. Both stay resumable.
    #[tokio::test]
    async fn test_turn_crash_classification() {
        use futures::StreamExt;

        for (oom, expected) in [
            (Some(true), SessionStatus::Paused),
            (Some(false), SessionStatus::Error),
            (None, SessionStatus::Error),
        ] {
            let db = Database::in_memory().await.unwrap();
            let repo = SessionRepository::new(db.pool().clone());
            repo.create(&Session {
                id: "s1".to_string(),
                tenant: "default".to_string(),
                agent_name: "qa".to_string(),
                sandbox_id: Some("s1".to_string()),
                status: SessionStatus::Active,
                runner_id: None,
                created_at: now_rfc3339(),
                last_active_at: now_rfc3339(),
            })
            .await
            .unwrap();

            let backend = Arc::new(MockBackend {
                oom,
                ..Default::default()
            });
            let events = futures::stream::iter(vec![BridgeEvent::Message {
                data: serde_json::json!({"text": "partial"}),
            }])
            .boxed();
            let (tx, mut rx) = tokio::sync::mpsc::channel(1);
            let driver = tokio::spawn(drive_turn(TurnContext {
                repo: repo.clone(),
                backend: backend.clone(),
                tenant: "default".to_string(),
                session_id: "s1".to_string(),
                write_timeout: Duration::from_millis(200),
                events,
                tx,
            }));

            // Consume the partial frame like a live client would.
            assert!(rx.recv().await.is_some());
            assert!(rx.recv().await.is_none());
            driver.await.unwrap();

            assert_eq!(
                repo.get("default", "s1").await.unwrap().unwrap().status,
                expected,
                "oom = {oom:?}"
            );
            assert!(backend.waiting.lock().unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn test_evict_hook_pauses_session() {
        let (service, _data) = service().await;
        service
            .repo
            .create(&Session {
                id: "s1".to_string(),
                tenant: "default".to_string(),
                agent_name: "qa".to_string(),
                sandbox_id: Some("s1".to_string()),
                status: SessionStatus::Active,
                runner_id: None,
                created_at: now_rfc3339(),
                last_active_at: now_rfc3339(),
            })
            .await
            .unwrap();

        let sandbox = Sandbox {
            id: "s1".to_string(),
            tenant: "default".to_string(),
            session_id: Some("s1".to_string()),
            agent_name: "qa".to_string(),
            state: SandboxState::Waiting,
            workspace_dir: String::new(),
            created_at: now_rfc3339(),
            last_used_at: now_rfc3339(),
        };
        service.on_before_evict(&sandbox).await;

        let session = service.get("default", "s1").await.unwrap();
        assert_eq!(session.status, SessionStatus::Paused);
        let events = service.repo.list_events("default", "s1").await.unwrap();
        assert_eq!(events[0].detail.as_deref(), Some("evicted"));
    }
}
