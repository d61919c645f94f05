//! Bridge wire protocol types and codec.
//!
//! Defines the command/event types exchanged between the control plane and
//! the in-sandbox bridge process. The protocol uses JSON over a Unix domain
//! socket with newline-delimited frames: one JSON value per line, terminated
//! by LF.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Single byte the bridge writes to stdout once its socket listener is
/// bound and accepting. The supervisor must not dial before reading it.
pub const READY_BYTE: u8 = b'R';

/// Command sent from the control plane to the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum BridgeCommand {
    /// Run one agent turn for the given prompt.
    Query {
        prompt: String,
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(
            rename = "includePartialMessages",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        include_partial_messages: Option<bool>,
    },
    /// Reattach the SDK to the conversation log in the workspace.
    Resume {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    /// Abort an in-flight query.
    Interrupt,
    /// Ask the bridge to exit cleanly.
    Shutdown,
}

/// Event sent from the bridge to the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "ev", rename_all = "lowercase")]
pub enum BridgeEvent {
    /// Emitted once after the socket connection is accepted.
    Ready,
    /// A message object from the upstream AI SDK, forwarded verbatim.
    Message { data: serde_json::Value },
    /// The turn failed inside the bridge.
    Error { error: String },
    /// The turn completed.
    Done {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
}

impl BridgeEvent {
    /// SSE event name this event is forwarded under.
    pub fn name(&self) -> &'static str {
        match self {
            BridgeEvent::Ready => "ready",
            BridgeEvent::Message { .. } => "message",
            BridgeEvent::Error { .. } => "error",
            BridgeEvent::Done { .. } => "done",
        }
    }

    /// SSE data payload for this event. The `message` payload is the
    /// AI-SDK object forwarded verbatim.
    pub fn sse_payload(&self) -> serde_json::Value {
        match self {
            BridgeEvent::Ready => serde_json::json!({}),
            BridgeEvent::Message { data } => data.clone(),
            BridgeEvent::Error { error } => serde_json::json!({ "error": error }),
            BridgeEvent::Done { session_id } => serde_json::json!({ "sessionId": session_id }),
        }
    }

    /// Rebuild an event from an SSE frame's name and data line.
    pub fn from_sse(name: &str, data: &str) -> Result<Self, FrameError> {
        let value: serde_json::Value = serde_json::from_str(data)?;
        match name {
            "ready" => Ok(BridgeEvent::Ready),
            "message" => Ok(BridgeEvent::Message { data: value }),
            "error" => Ok(BridgeEvent::Error {
                error: value["error"].as_str().unwrap_or_default().to_string(),
            }),
            "done" => Ok(BridgeEvent::Done {
                session_id: value["sessionId"].as_str().unwrap_or_default().to_string(),
            }),
            other => Err(FrameError::UnknownEvent(other.to_string())),
        }
    }
}

/// Errors produced by the frame codec.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Stream ended in the middle of a frame (no trailing LF).
    #[error("partial frame at end of stream: {0:?}")]
    Partial(String),

    #[error("invalid frame: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("unknown event name: {0}")]
    UnknownEvent(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Encode a value as a newline-terminated JSON frame.
pub fn encode_frame<T: Serialize>(value: &T) -> Result<String, FrameError> {
    let mut frame = serde_json::to_string(value)?;
    frame.push('\n');
    Ok(frame)
}

/// Decode a single frame (with or without its trailing LF).
pub fn decode_frame<T: for<'de> Deserialize<'de>>(line: &str) -> Result<T, FrameError> {
    Ok(serde_json::from_str(line.trim_end_matches('\n'))?)
}

/// Buffering frame reader over any async byte stream.
///
/// Accumulates raw bytes until an LF, then decodes the line as one frame.
/// A clean EOF yields `Ok(None)`; bytes left without a terminating LF are
/// reported as [`FrameError::Partial`].
pub struct FrameReader<R> {
    inner: R,
}

impl<R: AsyncBufRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read the next frame, decoded as `T`.
    pub async fn next_frame<T: for<'de> Deserialize<'de>>(
        &mut self,
    ) -> Result<Option<T>, FrameError> {
        let mut line = String::new();
        let n = self.inner.read_line(&mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        if !line.ends_with('\n') {
            return Err(FrameError::Partial(line));
        }
        Ok(Some(decode_frame(&line)?))
    }

    /// Consume the reader, returning the underlying stream.
    pub fn into_inner(self) -> R {
        self.inner
    }
}
