//! Runner registry models and the runner-internal HTTP types.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A registered worker node.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Runner {
    pub id: String,
    pub host: String,
    pub port: i64,
    pub max_sandboxes: i64,
    pub active_count: i64,
    pub warming_count: i64,
    pub last_heartbeat_at: String,
    pub registered_at: String,
}

impl Runner {
    /// Base URL other nodes use to reach this runner.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// `POST /internal/runners/register`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub id: String,
    pub host: String,
    pub port: i64,
    #[serde(rename = "maxSandboxes")]
    pub max_sandboxes: i64,
}

/// `POST /internal/runners/heartbeat`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub id: String,
    pub active: i64,
    pub warming: i64,
}

/// `POST /internal/runners/deregister`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeregisterRequest {
    pub id: String,
}

/// Uniform `{ok:true}` acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OkResponse {
    pub ok: bool,
}

impl OkResponse {
    pub fn ok() -> Self {
        Self { ok: true }
    }
}

/// `POST /runner/sandboxes`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSandboxRequest {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub tenant: String,
    pub agent: String,
    /// Whether this create is a cold resume (controls restore accounting).
    #[serde(default)]
    pub resume: bool,
}

/// Response to a sandbox create, reporting the restore source used.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSandboxResponse {
    pub ok: bool,
    pub source: Option<String>,
}
