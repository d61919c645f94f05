//! Core error taxonomy.
//!
//! Services return [`CoreError`]; the API layer maps each kind to an HTTP
//! status. Operational failures (workspace copies, cloud uploads, disk
//! sweeps) are logged at the call site and never travel through here.

use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Lookup miss: agent, session, sandbox, runner.
    #[error("not found: {0}")]
    NotFound(String),

    /// Resume attempted on an ended session.
    #[error("session has ended: {0}")]
    Gone(String),

    /// Operation not valid for the current status.
    #[error("bad state: {0}")]
    BadState(String),

    /// Every remaining sandbox is running; nothing can be evicted.
    #[error("sandbox capacity exhausted")]
    CapacityFull,

    /// No healthy runner to place the session on.
    #[error("no healthy runners available")]
    NoRunners,

    /// The bridge child never became ready.
    #[error("bridge startup failed (exit: {exit:?}): {stderr}")]
    BridgeStartup {
        exit: Option<i32>,
        stderr: String,
    },

    /// The bridge died mid-turn.
    #[error("bridge crashed: {reason}")]
    BridgeCrash { reason: String, oom: bool },

    /// SSE client stopped draining within the write timeout.
    #[error("client stopped reading the event stream")]
    ClientTimeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CoreError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn bad_state(msg: impl Into<String>) -> Self {
        Self::BadState(msg.into())
    }

    /// Whether the session should end up resumable after this error.
    pub fn is_resumable_crash(&self) -> bool {
        matches!(self, CoreError::BridgeCrash { .. })
    }
}
