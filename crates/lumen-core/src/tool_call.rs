use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::{RunId, ToolCallId};

/// A requested tool invocation. Immutable once created.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: ToolCallId,
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    pub function: ToolFunction,
    /// Set only on calls minted as children of a spawning parent.
    #[serde(
        rename = "_parent_unique_id",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub parent_unique_id: Option<ToolCallId>,
}

fn function_kind() -> String {
    "function".to_string()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolFunction {
    pub name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
    /// Present only when resuming a previously spawned call: one inner vec per
    /// child run, in run order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_tasks_batch: Option<Vec<Vec<ChildTask>>>,
}

impl ToolCall {
    pub fn new(id: ToolCallId, name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            id,
            kind: function_kind(),
            function: ToolFunction {
                name: name.into(),
                arguments,
                child_tasks_batch: None,
            },
            parent_unique_id: None,
        }
    }

    /// Mint a fresh child call of `parent` from a spawned spec.
    pub fn child_of(parent: &ToolCallId, spec: SpawnedToolSpec) -> Self {
        let mut call = Self::new(ToolCallId::new(), spec.tool, spec.arguments);
        call.parent_unique_id = Some(parent.clone());
        call
    }

    pub fn with_child_tasks(mut self, batches: Vec<Vec<ChildTask>>) -> Self {
        self.function.child_tasks_batch = Some(batches);
        self
    }

    pub fn name(&self) -> &str {
        &self.function.name
    }

    /// Child results delivered on resume; empty on a first invocation.
    pub fn child_tasks(&self) -> &[Vec<ChildTask>] {
        self.function.child_tasks_batch.as_deref().unwrap_or(&[])
    }

    pub fn is_resume(&self) -> bool {
        self.child_tasks().iter().any(|batch| !batch.is_empty())
    }
}

/// One completed child of a spawning parent, as delivered in `child_tasks_batch`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChildTask {
    pub unique_id: ToolCallId,
    pub agent: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub result: Value,
    #[serde(rename = "_run_id", default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
}

/// What a spawning handler asks to run before it can be resumed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpawnedToolSpec {
    pub tool: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

impl SpawnedToolSpec {
    pub fn new(tool: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            tool: tool.into(),
            arguments,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolRole {
    #[default]
    Tool,
}

/// Result of executing one tool call. Created exactly once per call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompletedToolCallPayload {
    #[serde(default)]
    pub role: ToolRole,
    pub tool_call_id: ToolCallId,
    pub content: String,
}

impl CompletedToolCallPayload {
    pub fn new(tool_call_id: ToolCallId, content: impl Into<String>) -> Self {
        Self {
            role: ToolRole::Tool,
            tool_call_id,
            content: content.into(),
        }
    }

    /// The `{success: false, error}` envelope recorded for a failed tool.
    pub fn failure(tool_call_id: ToolCallId, message: &str) -> Self {
        let content = serde_json::json!({ "success": false, "error": message }).to_string();
        Self::new(tool_call_id, content)
    }
}
