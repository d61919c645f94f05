//! SSE framing for bridge event streams.

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use futures::StreamExt;
use std::convert::Infallible;

use ash_bridge_protocol::BridgeEvent;

/// Frame a bridge event for the wire: `event: <name>` with a single-line
/// JSON data payload.
pub fn to_sse_event(event: &BridgeEvent) -> Event {
    let data = serde_json::to_string(&event.sse_payload()).unwrap_or_else(|_| "{}".to_string());
    Event::default().event(event.name()).data(data)
}

/// Wrap an ordered bridge event stream as an SSE response.
pub fn sse_response(
    stream: impl Stream<Item = BridgeEvent> + Send + 'static,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = stream.map(|event| Ok(to_sse_event(&event)));
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_payload_forwarded_verbatim() {
        let event = BridgeEvent::Message {
            data: json!({"role": "assistant", "content": [{"type": "text", "text": "4"}]}),
        };
        assert_eq!(event.name(), "message");
        let data = serde_json::to_string(&event.sse_payload()).unwrap();
        // Single line, required by the SSE data field.
        assert!(!data.contains('\n'));
        assert!(data.contains("assistant"));
    }

    #[test]
    fn test_done_payload_carries_session_id() {
        let event = BridgeEvent::Done {
            session_id: "sess-1".to_string(),
        };
        assert_eq!(event.name(), "done");
        assert_eq!(event.sse_payload(), json!({"sessionId": "sess-1"}));
    }
}
