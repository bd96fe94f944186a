use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::errors::ToolError;
use crate::ids::{ConversationId, ToolCallId};
use crate::tool_call::{ChildTask, SpawnedToolSpec};
use crate::user::EffectiveUser;

/// Context available to tools during execution.
#[derive(Clone, Debug)]
pub struct ToolContext {
    pub user: EffectiveUser,
    pub conversation_id: ConversationId,
    pub cancel: CancellationToken,
}

/// One call as seen by a handler.
#[derive(Clone, Copy, Debug)]
pub struct ToolInvocation<'a> {
    pub call_id: &'a ToolCallId,
    pub arguments: &'a Map<String, Value>,
    /// Completed children grouped per run; empty on first invocation.
    pub child_tasks: &'a [Vec<ChildTask>],
}

impl<'a> ToolInvocation<'a> {
    pub fn is_resume(&self) -> bool {
        self.child_tasks.iter().any(|batch| !batch.is_empty())
    }

    /// Deserialize the arguments object into a typed struct.
    pub fn parse_args<T: DeserializeOwned>(&self) -> Result<T, ToolError> {
        serde_json::from_value(Value::Object(self.arguments.clone()))
            .map_err(|e| ToolError::InvalidArguments(e.to_string()))
    }

    /// Results of the most recent child run.
    pub fn latest_children(&self) -> &'a [ChildTask] {
        self.child_tasks
            .iter()
            .rev()
            .find(|batch| !batch.is_empty())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Tool output, rendered into the string `content` of a completed payload.
#[derive(Clone, Debug, PartialEq)]
pub enum ToolOutput {
    Text(String),
    Json(Value),
}

impl ToolOutput {
    pub fn into_content(self) -> String {
        match self {
            Self::Text(s) => s,
            Self::Json(v) => v.to_string(),
        }
    }
}

/// What a handler produced for one invocation.
#[derive(Clone, Debug, PartialEq)]
pub enum ToolOutcome {
    Completed(ToolOutput),
    /// Suspend until these children complete, then re-invoke with their results.
    NeedsChildren(Vec<SpawnedToolSpec>),
    /// The tool observed cancellation and stopped early.
    Interrupted,
}

impl ToolOutcome {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Completed(ToolOutput::Text(s.into()))
    }

    pub fn json(v: Value) -> Self {
        Self::Completed(ToolOutput::Json(v))
    }
}

/// Tool definition reported to the backend and on the health endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters_schema: Value,
    #[serde(default)]
    pub can_spawn: bool,
}

/// Trait implemented by each locally executed tool.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> Value;

    /// Whether this tool may answer with [`ToolOutcome::NeedsChildren`].
    fn can_spawn(&self) -> bool {
        false
    }

    async fn execute(
        &self,
        invocation: ToolInvocation<'_>,
        ctx: &ToolContext,
    ) -> Result<ToolOutcome, ToolError>;

    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters_schema: self.parameters_schema(),
            can_spawn: self.can_spawn(),
        }
    }
}
