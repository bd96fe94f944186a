use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use lumen_core::errors::ToolError;
use lumen_core::tool_call::SpawnedToolSpec;
use lumen_core::tools::{ToolContext, ToolHandler, ToolInvocation, ToolOutcome};

/// Browser-side tool that renders a question and returns the user's answer.
pub const USER_INPUT_TOOL: &str = "UserInputTool";

#[derive(Debug, Deserialize)]
struct ClarifyArgs {
    question: String,
    #[serde(default)]
    options: Vec<String>,
}

/// Asks the user a question through the browser and returns the answer to
/// the agent. Suspends on a `UserInputTool` child until the browser replies.
pub struct ClarifyTool;

#[async_trait]
impl ToolHandler for ClarifyTool {
    fn name(&self) -> &str {
        "Clarify"
    }

    fn description(&self) -> &str {
        "Ask the user a clarifying question, optionally with suggested answers"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["question"],
            "properties": {
                "question": {
                    "type": "string",
                    "description": "The question to put to the user"
                },
                "options": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Suggested answers shown as choices"
                }
            }
        })
    }

    fn can_spawn(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        invocation: ToolInvocation<'_>,
        _ctx: &ToolContext,
    ) -> Result<ToolOutcome, ToolError> {
        if invocation.is_resume() {
            let answer = invocation
                .latest_children()
                .first()
                .map(|child| child.result.clone())
                .unwrap_or(Value::Null);
            return Ok(ToolOutcome::json(json!({ "answer": answer })));
        }

        let args: ClarifyArgs = invocation.parse_args()?;
        if args.question.trim().is_empty() {
            return Err(ToolError::InvalidArguments("question must not be empty".into()));
        }

        let mut child_args = Map::new();
        child_args.insert("question".into(), Value::String(args.question));
        child_args.insert(
            "options".into(),
            Value::Array(args.options.into_iter().map(Value::String).collect()),
        );
        Ok(ToolOutcome::NeedsChildren(vec![SpawnedToolSpec::new(
            USER_INPUT_TOOL,
            child_args,
        )]))
    }
}
