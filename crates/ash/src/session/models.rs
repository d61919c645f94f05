//! Session data models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Sandbox is being created.
    Starting,
    /// Bridge is ready; messages are accepted.
    Active,
    /// Suspended; resumable warm or cold.
    Paused,
    /// Something broke; still resumable.
    Error,
    /// Terminal. Never transitions again.
    Ended,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Starting => write!(f, "starting"),
            SessionStatus::Active => write!(f, "active"),
            SessionStatus::Paused => write!(f, "paused"),
            SessionStatus::Error => write!(f, "error"),
            SessionStatus::Ended => write!(f, "ended"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "starting" => Ok(SessionStatus::Starting),
            "active" => Ok(SessionStatus::Active),
            "paused" => Ok(SessionStatus::Paused),
            "error" => Ok(SessionStatus::Error),
            "ended" => Ok(SessionStatus::Ended),
            _ => Err(format!("unknown session status: {}", s)),
        }
    }
}

impl TryFrom<String> for SessionStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        value.parse()
    }
}

/// A conversation pinned to one agent and one sandbox.
///
/// The id doubles as the sandbox id and the on-disk directory name, which
/// is what makes workspace paths deterministic across cold resumes.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Session {
    pub id: String,
    pub tenant: String,
    pub agent_name: String,
    pub sandbox_id: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: SessionStatus,
    /// Owning runner, or NULL when hosted by this process.
    pub runner_id: Option<String>,
    pub created_at: String,
    pub last_active_at: String,
}

impl Session {
    pub fn is_terminal(&self) -> bool {
        self.status == SessionStatus::Ended
    }
}

/// Append-only message row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Message {
    pub tenant: String,
    pub session_id: String,
    pub sequence: i64,
    pub role: String,
    pub content: String,
    pub created_at: String,
}

/// Append-only lifecycle event row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SessionEvent {
    pub tenant: String,
    pub session_id: String,
    pub sequence: i64,
    pub kind: String,
    pub detail: Option<String>,
    pub created_at: String,
}

/// Request to create a new session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    /// Name of a deployed agent.
    pub agent: String,
}

/// Request to send a message into a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
}
