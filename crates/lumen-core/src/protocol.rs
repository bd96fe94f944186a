//! Request/response shapes for the browser-facing chat API and the
//! reasoning-backend API.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::ConversationId;
use crate::log::LogEntry;
use crate::tool_call::{CompletedToolCallPayload, ToolCall};

fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Inbound chat turn from the browser.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(rename = "conversationID", default)]
    pub conversation_id: Option<ConversationId>,
    #[serde(default)]
    pub log_index: Option<usize>,
    #[serde(default)]
    pub user_message: Option<String>,
    /// Results of calls the browser executed since the last turn.
    #[serde(default)]
    pub completed_tool_calls: Vec<(ToolCall, CompletedToolCallPayload)>,
    pub agent: String,
    #[serde(default = "empty_object")]
    pub agent_args: Value,
}

impl ChatRequest {
    pub fn new(agent: impl Into<String>) -> Self {
        Self {
            conversation_id: None,
            log_index: None,
            user_message: None,
            completed_tool_calls: Vec::new(),
            agent: agent.into(),
            agent_args: empty_object(),
        }
    }
}

/// Outcome of a chat turn. `error` is a field, never a transport failure.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    #[serde(rename = "conversationID")]
    pub conversation_id: Option<ConversationId>,
    pub log_index: usize,
    pub pending_tool_calls: Vec<ToolCall>,
    pub completed_tool_calls: Vec<CompletedToolCallPayload>,
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub interrupted: bool,
}

impl ChatResponse {
    /// Error envelope for requests rejected before any state was touched.
    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Request body sent to the reasoning backend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackendRequest {
    pub log: Vec<LogEntry>,
    pub user_message: Option<String>,
    pub completed_tool_calls: Vec<CompletedToolCallPayload>,
    pub agent: String,
    pub agent_args: Value,
}

/// One backend turn. The streaming variant ends with an event of this shape.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendResponse {
    #[serde(rename = "logDiff", default)]
    pub log_diff: Vec<LogEntry>,
    #[serde(default)]
    pub completed_tool_calls: Vec<CompletedToolCallPayload>,
    #[serde(default)]
    pub pending_tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub llm_calls: BTreeMap<String, UsageDetail>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Token/cost accounting for one LLM call made by the backend.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageDetail {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CloseRequest {
    pub log: Vec<LogEntry>,
}

/// Interruption markers for whatever tasks were outstanding.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CloseResponse {
    #[serde(rename = "logDiff", default)]
    pub log_diff: Vec<LogEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn minimal_chat_request() {
        let req: ChatRequest = serde_json::from_value(json!({
            "user_message": "Testing",
            "agent": "MultiToolAgent",
            "agent_args": {"goal": "Testing"}
        }))
        .unwrap();
        assert!(req.conversation_id.is_none());
        assert!(req.log_index.is_none());
        assert!(req.completed_tool_calls.is_empty());
        assert_eq!(req.agent_args["goal"], "Testing");
    }

    #[test]
    fn completed_tool_calls_are_pairs() {
        let req: ChatRequest = serde_json::from_value(json!({
            "conversationID": 7,
            "log_index": 3,
            "agent": "A",
            "completed_tool_calls": [[
                {"id": "t1", "type": "function", "function": {"name": "UserInputTool", "arguments": {}}},
                {"role": "tool", "tool_call_id": "t1", "content": "yes"}
            ]]
        }))
        .unwrap();
        assert_eq!(req.conversation_id, Some(ConversationId::new(7)));
        let (call, payload) = &req.completed_tool_calls[0];
        assert_eq!(call.name(), "UserInputTool");
        assert_eq!(payload.content, "yes");
        assert!(req.agent_args.is_object());
    }

    #[test]
    fn response_wire_names() {
        let resp = ChatResponse {
            conversation_id: Some(ConversationId::new(1)),
            log_index: 4,
            ..Default::default()
        };
        let wire = serde_json::to_value(&resp).unwrap();
        assert_eq!(wire["conversationID"], 1);
        assert_eq!(wire["log_index"], 4);
        assert_eq!(wire["pending_tool_calls"], json!([]));
        assert_eq!(wire["error"], Value::Null);
        assert!(wire.get("interrupted").is_none());
    }

    #[test]
    fn backend_response_defaults() {
        let resp: BackendResponse = serde_json::from_value(json!({
            "logDiff": [],
            "llm_calls": {"c1": {"model": "m", "input_tokens": 10, "output_tokens": 2, "cached": 4}}
        }))
        .unwrap();
        assert!(resp.pending_tool_calls.is_empty());
        let usage = &resp.llm_calls["c1"];
        assert_eq!(usage.input_tokens, 10);
        assert_eq!(usage.extra["cached"], 4);
    }
}
