use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use lumen_core::errors::BackendError;
use lumen_core::protocol::BackendResponse;
use lumen_core::stream::{BackendStreamEvent, StreamingEvent};

/// Decode one SSE frame from the reasoning backend.
///
/// Returns `None` for frames that carry nothing for the caller: keep-alives,
/// unknown event names, and malformed payloads (logged and dropped).
pub fn parse_event(event_type: &str, data: &str) -> Option<BackendStreamEvent> {
    match event_type {
        name if StreamingEvent::NAMES.contains(&name) => parse_streaming(name, data),
        "done" => match serde_json::from_str::<BackendResponse>(data) {
            Ok(response) => Some(BackendStreamEvent::Done(response)),
            Err(e) => {
                warn!(error = %e, "dropping malformed done event");
                None
            }
        },
        "error" => {
            let message = serde_json::from_str::<ErrorEvent>(data)
                .map(|e| e.error)
                .unwrap_or_else(|_| data.to_string());
            Some(BackendStreamEvent::Failed(BackendError::Reported(message)))
        }
        other => {
            debug!(event = other, "ignoring SSE event");
            None
        }
    }
}

fn parse_streaming(name: &str, data: &str) -> Option<BackendStreamEvent> {
    let mut body = match serde_json::from_str::<Value>(data) {
        Ok(Value::Object(map)) => map,
        Ok(_) | Err(_) => {
            warn!(event = name, "dropping malformed streaming event");
            return None;
        }
    };
    body.insert("type".into(), Value::String(name.to_string()));
    match serde_json::from_value::<StreamingEvent>(Value::Object(body)) {
        Ok(event) => Some(BackendStreamEvent::Streaming(event)),
        Err(e) => {
            warn!(event = name, error = %e, "dropping malformed streaming event");
            None
        }
    }
}

/// Parse raw SSE text into `(event_type, data)` pairs. Frames without an
/// `event:` line are named `message`; multi-line data is joined with `\n`.
pub fn parse_sse_lines(raw: &str) -> Vec<(String, String)> {
    let mut events = Vec::new();
    let mut current_event = String::new();
    let mut data_lines: Vec<&str> = Vec::new();

    let mut flush = |event: &mut String, data: &mut Vec<&str>| {
        if !event.is_empty() || !data.is_empty() {
            let name = if event.is_empty() { "message" } else { event.as_str() };
            events.push((name.to_string(), data.join("\n")));
        }
        event.clear();
        data.clear();
    };

    for line in raw.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            flush(&mut current_event, &mut data_lines);
        } else if let Some(event) = line.strip_prefix("event:") {
            current_event = event.trim_start().to_string();
        } else if let Some(data) = line.strip_prefix("data:") {
            data_lines.push(data.strip_prefix(' ').unwrap_or(data));
        }
        // `:` comments and `id:`/`retry:` fields are ignored.
    }
    flush(&mut current_event, &mut data_lines);

    events
}

#[derive(Deserialize)]
struct ErrorEvent {
    error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_event() {
        let event = parse_event("content", r#"{"content":"Hel"}"#).unwrap();
        assert!(matches!(
            event,
            BackendStreamEvent::Streaming(StreamingEvent::Content { ref content }) if content == "Hel"
        ));
    }

    #[test]
    fn tool_created_event() {
        let event = parse_event(
            "tool_created",
            r#"{"tool_call":{"id":"t1","type":"function","function":{"name":"UserInputTool","arguments":{}}}}"#,
        )
        .unwrap();
        match event {
            BackendStreamEvent::Streaming(StreamingEvent::ToolCreated { tool_call }) => {
                assert_eq!(tool_call.name(), "UserInputTool");
            }
            other => panic!("expected ToolCreated, got {other:?}"),
        }
    }

    #[test]
    fn done_event_carries_response() {
        let event = parse_event("done", r#"{"logDiff":[],"pending_tool_calls":[]}"#).unwrap();
        assert!(matches!(event, BackendStreamEvent::Done(_)));
        assert!(event.is_terminal());
    }

    #[test]
    fn error_event_is_reported() {
        let event = parse_event("error", r#"{"error":"agent Foo not found"}"#).unwrap();
        match event {
            BackendStreamEvent::Failed(BackendError::Reported(msg)) => {
                assert_eq!(msg, "agent Foo not found")
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[test]
    fn malformed_chunks_are_dropped() {
        assert!(parse_event("content", "{not json").is_none());
        assert!(parse_event("content", "[1,2]").is_none());
        assert!(parse_event("tool_created", r#"{"tool_call": 5}"#).is_none());
        assert!(parse_event("done", "garbage").is_none());
        assert!(parse_event("ping", "{}").is_none());
    }

    #[test]
    fn parse_sse_lines_basic() {
        let raw = "event: content\ndata: {\"content\":\"a\"}\n\nevent: done\ndata: {}\n\n";
        let events = parse_sse_lines(raw);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].0, "content");
        assert_eq!(events[1], ("done".to_string(), "{}".to_string()));
    }

    #[test]
    fn parse_sse_lines_multiline_and_crlf() {
        let raw = ": keep-alive\r\nevent: content\r\ndata: {\"content\":\r\ndata: \"x\"}\r\n\r\ndata: bare\n";
        let events = parse_sse_lines(raw);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].1, "{\"content\":\n\"x\"}");
        assert_eq!(events[1], ("message".to_string(), "bare".to_string()));
    }
}
