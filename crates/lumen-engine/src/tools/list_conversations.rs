use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use lumen_core::errors::ToolError;
use lumen_core::tools::{ToolContext, ToolHandler, ToolInvocation, ToolOutcome};
use lumen_store::ConversationRepo;

const DEFAULT_LIMIT: u32 = 20;
const MAX_LIMIT: u32 = 100;

#[derive(Debug, Deserialize)]
struct ListArgs {
    limit: Option<u32>,
}

/// Lists the calling user's most recently updated conversations.
pub struct ListConversationsTool {
    conversations: Arc<ConversationRepo>,
}

impl ListConversationsTool {
    pub fn new(conversations: Arc<ConversationRepo>) -> Self {
        Self { conversations }
    }
}

#[async_trait]
impl ToolHandler for ListConversationsTool {
    fn name(&self) -> &str {
        "ListConversations"
    }

    fn description(&self) -> &str {
        "List the user's recent conversations, newest first"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of conversations (1-100, default 20)"
                }
            }
        })
    }

    async fn execute(
        &self,
        invocation: ToolInvocation<'_>,
        ctx: &ToolContext,
    ) -> Result<ToolOutcome, ToolError> {
        let args: ListArgs = invocation.parse_args()?;
        let limit = args.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);

        let rows = self
            .conversations
            .list_for_user(&ctx.user, limit)
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;

        let items: Vec<Value> = rows
            .into_iter()
            .map(|row| {
                json!({
                    "id": row.id,
                    "name": row.name,
                    "forkedFrom": row.forked_from,
                    "updatedAt": row.updated_at,
                })
            })
            .collect();
        Ok(ToolOutcome::json(Value::Array(items)))
    }
}
