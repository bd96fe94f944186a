use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::BackendError;
use crate::ids::{ConversationId, ToolCallId};
use crate::protocol::{BackendResponse, ChatResponse};
use crate::tool_call::ToolCall;

/// Incremental notification forwarded to the browser as it arrives.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamingEvent {
    Content { content: String },
    ToolCreated { tool_call: ToolCall },
    ToolCompleted { tool_call_id: ToolCallId, content: String },
}

impl StreamingEvent {
    /// Event names the backend uses for incremental events.
    pub const NAMES: [&'static str; 3] = ["content", "tool_created", "tool_completed"];
}

/// Events produced by a streaming backend call. Ordering contract:
/// `Streaming*` then exactly one of `Done` / `Failed`.
#[derive(Clone, Debug)]
pub enum BackendStreamEvent {
    Streaming(StreamingEvent),
    Done(BackendResponse),
    Failed(BackendError),
}

impl BackendStreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done(_) | Self::Failed(_))
    }
}

/// Events sent to the browser on the streaming chat endpoint.
#[derive(Clone, Debug, PartialEq)]
pub enum ChatStreamEvent {
    Streaming {
        conversation_id: Option<ConversationId>,
        event: StreamingEvent,
    },
    Error {
        error: String,
        timestamp: String,
    },
    Done {
        response: ChatResponse,
        timestamp: String,
    },
}

impl ChatStreamEvent {
    pub fn error(error: impl Into<String>) -> Self {
        Self::Error {
            error: error.into(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    pub fn done(response: ChatResponse) -> Self {
        Self::Done {
            response,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    /// SSE event name.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Streaming { .. } => "streaming_event",
            Self::Error { .. } => "error",
            Self::Done { .. } => "done",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Streaming { .. })
    }

    /// JSON body of the SSE event.
    pub fn payload(&self) -> Value {
        match self {
            Self::Streaming {
                conversation_id,
                event,
            } => {
                let mut body = serde_json::to_value(event).unwrap_or(Value::Null);
                if let Value::Object(map) = &mut body {
                    map.insert(
                        "conversationID".into(),
                        serde_json::to_value(conversation_id).unwrap_or(Value::Null),
                    );
                }
                body
            }
            Self::Error { error, timestamp } => {
                serde_json::json!({ "error": error, "timestamp": timestamp })
            }
            Self::Done {
                response,
                timestamp,
            } => {
                let mut body = serde_json::to_value(response).unwrap_or(Value::Null);
                if let Value::Object(map) = &mut body {
                    map.insert("timestamp".into(), Value::String(timestamp.clone()));
                }
                body
            }
        }
    }
}
