//! Runner backend abstraction.
//!
//! The session manager routes every sandbox operation through
//! [`RunnerBackend`]; whether the sandbox lives in this process or on a
//! remote node is invisible above this seam.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use std::sync::Arc;
use tracing::{debug, warn};

use ash_bridge_protocol::{BridgeCommand, BridgeEvent};

use crate::agent::AgentService;
use crate::error::{CoreError, CoreResult};
use crate::metrics::PoolStats;
use crate::sandbox::{CreateSandbox, SandboxPool};
use crate::workspace::{RestoreSource, WorkspaceStore};

use super::models::{CreateSandboxRequest, CreateSandboxResponse, OkResponse};

/// Ordered stream of bridge events for one command.
pub type EventStream = BoxStream<'static, BridgeEvent>;

/// Parameters for placing a sandbox on a backend.
#[derive(Debug, Clone)]
pub struct NewSandbox {
    pub session_id: String,
    pub tenant: String,
    pub agent_name: String,
    /// Cold resume vs first create; affects restore accounting only.
    pub resume: bool,
}

/// Operations every backend supports.
#[async_trait]
pub trait RunnerBackend: Send + Sync {
    /// Registry id, or `None` when the sandbox is hosted in this process.
    fn runner_id(&self) -> Option<String>;

    /// Create a sandbox, restoring or seeding its workspace first.
    /// Returns the restore source that produced the workspace.
    async fn create_sandbox(&self, req: &NewSandbox) -> CoreResult<RestoreSource>;

    /// Kill the sandbox process and drop its row and live workspace.
    async fn destroy_sandbox(&self, session_id: &str) -> CoreResult<()>;

    /// Send a query and stream its events until `done`.
    async fn send_command(&self, session_id: &str, cmd: BridgeCommand) -> CoreResult<EventStream>;

    /// Send a non-streaming command (`resume`, `interrupt`).
    async fn send_control(&self, session_id: &str, cmd: BridgeCommand) -> CoreResult<()>;

    /// Flip run/wait state around a turn.
    async fn mark_running(&self, session_id: &str) -> CoreResult<()>;
    async fn mark_waiting(&self, session_id: &str) -> CoreResult<()>;

    /// Persist the workspace snapshot.
    async fn persist_state(&self, session_id: &str) -> CoreResult<()>;

    /// Pool statistics of the hosting node.
    async fn get_stats(&self) -> CoreResult<PoolStats>;

    /// After an event stream broke: whether the bridge exit looked like an
    /// OOM kill. `None` when no verdict is available.
    async fn crash_was_oom(&self, session_id: &str) -> Option<bool>;
}

/// Backend for sandboxes owned by this process.
pub struct LocalBackend {
    pool: Arc<SandboxPool>,
    workspace: WorkspaceStore,
    agents: AgentService,
}

impl LocalBackend {
    pub fn new(pool: Arc<SandboxPool>, workspace: WorkspaceStore, agents: AgentService) -> Self {
        Self {
            pool,
            workspace,
            agents,
        }
    }
}

#[async_trait]
impl RunnerBackend for LocalBackend {
    fn runner_id(&self) -> Option<String> {
        None
    }

    async fn create_sandbox(&self, req: &NewSandbox) -> CoreResult<RestoreSource> {
        let agent_dir = self.agents.agent_dir(&req.tenant, &req.agent_name).await?;
        let source = self
            .workspace
            .restore(&req.session_id, &agent_dir)
            .await
            .map_err(CoreError::Internal)?;

        self.pool
            .create(CreateSandbox {
                session_id: req.session_id.clone(),
                tenant: req.tenant.clone(),
                agent_name: req.agent_name.clone(),
                agent_dir,
            })
            .await?;

        Ok(source)
    }

    async fn destroy_sandbox(&self, session_id: &str) -> CoreResult<()> {
        self.pool.destroy(session_id).await;
        Ok(())
    }

    async fn send_command(&self, session_id: &str, cmd: BridgeCommand) -> CoreResult<EventStream> {
        let live = self
            .pool
            .get_live(session_id)
            .ok_or_else(|| CoreError::bad_state("sandbox has no live bridge"))?;
        live.bridge.send(&cmd).await?;

        let bridge = Arc::clone(&live.bridge);
        let stream = futures::stream::unfold(bridge, |bridge| async move {
            match bridge.recv().await {
                Ok(Some(event)) => Some((event, bridge)),
                Ok(None) => None,
                Err(e) => {
                    debug!(error = ?e, "bridge event stream ended");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn send_control(&self, session_id: &str, cmd: BridgeCommand) -> CoreResult<()> {
        let live = self
            .pool
            .get_live(session_id)
            .ok_or_else(|| CoreError::bad_state("sandbox has no live bridge"))?;
        live.bridge.send(&cmd).await
    }

    async fn mark_running(&self, session_id: &str) -> CoreResult<()> {
        if !self.pool.mark_running(session_id) {
            return Err(CoreError::bad_state("sandbox has no live bridge"));
        }
        Ok(())
    }

    async fn mark_waiting(&self, session_id: &str) -> CoreResult<()> {
        self.pool.mark_waiting(session_id);
        Ok(())
    }

    async fn persist_state(&self, session_id: &str) -> CoreResult<()> {
        self.workspace.persist(session_id).await;
        Ok(())
    }

    async fn get_stats(&self) -> CoreResult<PoolStats> {
        self.pool.stats().await
    }

    async fn crash_was_oom(&self, session_id: &str) -> Option<bool> {
        let live = self.pool.get_live(session_id)?;
        let status = live.bridge.exit_status().await?;
        Some(crate::bridge::classify_exit(&status) == crate::bridge::ExitClass::Oom)
    }
}

/// Backend proxying to another node over the runner-internal HTTP surface.
pub struct RemoteBackend {
    client: reqwest::Client,
    runner_id: String,
    base_url: String,
    secret: Option<String>,
}

impl RemoteBackend {
    pub fn new(
        client: reqwest::Client,
        runner_id: impl Into<String>,
        base_url: impl Into<String>,
        secret: Option<String>,
    ) -> Self {
        Self {
            client,
            runner_id: runner_id.into(),
            base_url: base_url.into(),
            secret,
        }
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.secret {
            Some(secret) => req.bearer_auth(secret),
            None => req,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn expect_ok(&self, req: reqwest::RequestBuilder) -> CoreResult<()> {
        let response = self
            .authorize(req)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("runner request failed: {e}"))?;
        if !response.status().is_success() {
            return Err(CoreError::Internal(anyhow::anyhow!(
                "runner returned {}",
                response.status()
            )));
        }
        let _: OkResponse = response
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("runner response malformed: {e}"))?;
        Ok(())
    }
}

#[async_trait]
impl RunnerBackend for RemoteBackend {
    fn runner_id(&self) -> Option<String> {
        Some(self.runner_id.clone())
    }

    async fn create_sandbox(&self, req: &NewSandbox) -> CoreResult<RestoreSource> {
        let body = CreateSandboxRequest {
            session_id: req.session_id.clone(),
            tenant: req.tenant.clone(),
            agent: req.agent_name.clone(),
            resume: req.resume,
        };
        let response = self
            .authorize(self.client.post(self.url("/runner/sandboxes")).json(&body))
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("runner create failed: {e}"))?;

        match response.status().as_u16() {
            503 => return Err(CoreError::CapacityFull),
            status if status >= 400 => {
                return Err(CoreError::Internal(anyhow::anyhow!(
                    "runner create returned {status}"
                )));
            }
            _ => {}
        }

        let body: CreateSandboxResponse = response
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("runner create response malformed: {e}"))?;
        Ok(match body.source.as_deref() {
            Some("live") => RestoreSource::Live,
            Some("local") => RestoreSource::Local,
            Some("cloud") => RestoreSource::Cloud,
            _ => RestoreSource::Fresh,
        })
    }

    async fn destroy_sandbox(&self, session_id: &str) -> CoreResult<()> {
        self.expect_ok(
            self.client
                .delete(self.url(&format!("/runner/sandboxes/{session_id}"))),
        )
        .await
    }

    async fn send_command(&self, session_id: &str, cmd: BridgeCommand) -> CoreResult<EventStream> {
        let request = self.authorize(
            self.client
                .post(self.url(&format!("/runner/sandboxes/{session_id}/cmd")))
                .json(&cmd),
        );
        let source = reqwest_eventsource::EventSource::new(request)
            .map_err(|e| anyhow::anyhow!("opening runner event stream: {e}"))?;

        let stream = source.filter_map(|item| async move {
            match item {
                Ok(reqwest_eventsource::Event::Open) => None,
                Ok(reqwest_eventsource::Event::Message(msg)) => {
                    match BridgeEvent::from_sse(&msg.event, &msg.data) {
                        Ok(event) => Some(event),
                        Err(e) => {
                            warn!(error = ?e, "unparseable runner event dropped");
                            None
                        }
                    }
                }
                Err(reqwest_eventsource::Error::StreamEnded) => None,
                Err(e) => {
                    warn!(error = ?e, "runner event stream error");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn send_control(&self, session_id: &str, cmd: BridgeCommand) -> CoreResult<()> {
        self.expect_ok(
            self.client
                .post(self.url(&format!("/runner/sandboxes/{session_id}/cmd")))
                .json(&cmd),
        )
        .await
    }

    // Run/wait flips and persistence happen on the owning runner around
    // the command it serves; the coordinator side has nothing to do.
    async fn mark_running(&self, _session_id: &str) -> CoreResult<()> {
        Ok(())
    }

    async fn mark_waiting(&self, _session_id: &str) -> CoreResult<()> {
        Ok(())
    }

    async fn persist_state(&self, _session_id: &str) -> CoreResult<()> {
        Ok(())
    }

    async fn get_stats(&self) -> CoreResult<PoolStats> {
        let response = self
            .client
            .get(self.url("/health"))
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("runner health failed: {e}"))?;
        Ok(response
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("runner health malformed: {e}"))?)
    }

    async fn crash_was_oom(&self, _session_id: &str) -> Option<bool> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_backend_urls() {
        let backend = RemoteBackend::new(
            reqwest::Client::new(),
            "r1",
            "http://node-a:7410",
            None,
        );
        assert_eq!(
            backend.url("/runner/sandboxes/s1/cmd"),
            "http://node-a:7410/runner/sandboxes/s1/cmd"
        );
        assert_eq!(backend.runner_id().as_deref(), Some("r1"));
    }
}
