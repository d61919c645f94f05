//! Agent data models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A deployed agent: a named, versioned workspace template on disk.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Agent {
    pub tenant: String,
    pub name: String,
    /// Incremented on every redeploy.
    pub version: i64,
    /// Directory containing the agent files and its system prompt.
    pub path: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Request to deploy (or redeploy) an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployAgentRequest {
    pub name: String,
    pub path: String,
}
