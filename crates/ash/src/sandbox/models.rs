//! Sandbox data models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Sandbox lifecycle state.
///
/// Only `running` is protected from eviction; `cold` rows have no process,
/// only durable state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxState {
    /// No process; durable row (and possibly snapshots) only.
    Cold,
    /// Bridge child spawned, handshake in flight.
    Warming,
    /// Bridge ready, no session traffic yet.
    Warm,
    /// Between turns.
    Waiting,
    /// A turn is in flight.
    Running,
}

impl std::fmt::Display for SandboxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SandboxState::Cold => write!(f, "cold"),
            SandboxState::Warming => write!(f, "warming"),
            SandboxState::Warm => write!(f, "warm"),
            SandboxState::Waiting => write!(f, "waiting"),
            SandboxState::Running => write!(f, "running"),
        }
    }
}

impl std::str::FromStr for SandboxState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cold" => Ok(SandboxState::Cold),
            "warming" => Ok(SandboxState::Warming),
            "warm" => Ok(SandboxState::Warm),
            "waiting" => Ok(SandboxState::Waiting),
            "running" => Ok(SandboxState::Running),
            _ => Err(format!("unknown sandbox state: {}", s)),
        }
    }
}

impl TryFrom<String> for SandboxState {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A sandbox process-management record.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Sandbox {
    /// Equals the session id while bound.
    pub id: String,
    pub tenant: String,
    /// Cold sandboxes retain it so a resume can find its workspace.
    pub session_id: Option<String>,
    pub agent_name: String,
    #[sqlx(try_from = "String")]
    pub state: SandboxState,
    pub workspace_dir: String,
    pub created_at: String,
    pub last_used_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_roundtrip() {
        for state in [
            SandboxState::Cold,
            SandboxState::Warming,
            SandboxState::Warm,
            SandboxState::Waiting,
            SandboxState::Running,
        ] {
            let parsed: SandboxState = state.to_string().parse().unwrap();
            assert_eq!(parsed, state);
        }
        assert!("hot".parse::<SandboxState>().is_err());
    }
}
