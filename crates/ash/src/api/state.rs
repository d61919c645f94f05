//! Application state shared across handlers.

use std::sync::Arc;
use std::time::Duration;

use crate::agent::AgentService;
use crate::runner::{Coordinator, RunnerBackend};
use crate::sandbox::SandboxPool;
use crate::session::SessionService;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Session service for lifecycle orchestration.
    pub sessions: Arc<SessionService>,
    /// Agent service for deploy/resolve.
    pub agents: Arc<AgentService>,
    /// The pool hosted by this process.
    pub pool: Arc<SandboxPool>,
    /// Runner routing.
    pub coordinator: Arc<Coordinator>,
    /// Backend for sandboxes this process hosts; serves the /runner/*
    /// surface.
    pub local: Arc<dyn RunnerBackend>,
    /// Bearer token gating /internal/* and /runner/* when set.
    pub internal_secret: Option<String>,
    /// Dead-client cutoff for SSE writes.
    pub sse_write_timeout: Duration,
}
