use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde_json::{Map, Value};
use tracing::{debug, error, warn};

use lumen_core::errors::ToolError;
use lumen_core::tool_call::ToolCall;
use lumen_core::tools::{ToolContext, ToolDefinition, ToolHandler, ToolInvocation, ToolOutcome};

const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);

/// Why a registry invocation did not produce an outcome.
#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    /// Routing signal: the call belongs to someone else (the browser).
    #[error("tool {0} is not registered")]
    NotRegistered(String),

    #[error("invalid arguments for {tool}: {reason}")]
    InvalidArguments { tool: String, reason: String },

    #[error("{tool}: {source}")]
    Tool {
        tool: String,
        #[source]
        source: ToolError,
    },

    #[error("{0} asked for child calls but does not declare that capability")]
    UndeclaredSpawn(String),

    #[error("{0} asked for child calls but named none")]
    EmptySpawn(String),

    #[error("{0} crashed")]
    Crashed(String),
}

/// Process-wide table of locally executable tools. Built once at startup and
/// shared read-only afterwards.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn ToolHandler>>,
    tool_timeout: Duration,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    /// Register a handler under its name. A later registration replaces an
    /// earlier one with the same name.
    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) {
        let name = handler.name().to_string();
        if self.tools.insert(name.clone(), handler).is_some() {
            debug!(tool = %name, "replacing registered tool");
        }
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.tools.get(name).cloned()
    }

    /// All tool names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Definitions of every tool, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> =
            self.tools.values().map(|t| t.to_definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn count(&self) -> usize {
        self.tools.len()
    }

    /// Validate and dispatch one call to its handler.
    pub async fn invoke(&self, call: &ToolCall, ctx: &ToolContext) -> Result<ToolOutcome, InvokeError> {
        let name = call.name();
        let handler = self
            .get(name)
            .ok_or_else(|| InvokeError::NotRegistered(name.to_string()))?;

        validate_arguments(&handler.parameters_schema(), &call.function.arguments).map_err(
            |reason| InvokeError::InvalidArguments {
                tool: name.to_string(),
                reason,
            },
        )?;

        let invocation = ToolInvocation {
            call_id: &call.id,
            arguments: &call.function.arguments,
            child_tasks: call.child_tasks(),
        };
        let result = tokio::time::timeout(
            self.tool_timeout,
            std::panic::AssertUnwindSafe(handler.execute(invocation, ctx)).catch_unwind(),
        )
        .await;

        match result {
            Ok(Ok(Ok(ToolOutcome::NeedsChildren(_)))) if !handler.can_spawn() => {
                Err(InvokeError::UndeclaredSpawn(name.to_string()))
            }
            Ok(Ok(Ok(ToolOutcome::NeedsChildren(specs)))) if specs.is_empty() => {
                Err(InvokeError::EmptySpawn(name.to_string()))
            }
            Ok(Ok(Ok(outcome))) => Ok(outcome),
            Ok(Ok(Err(ToolError::InvalidArguments(reason)))) => Err(InvokeError::InvalidArguments {
                tool: name.to_string(),
                reason,
            }),
            Ok(Ok(Err(source))) => Err(InvokeError::Tool {
                tool: name.to_string(),
                source,
            }),
            Ok(Err(panic)) => {
                error!(tool = %name, panic = %panic_message(&panic), "tool panicked during execution");
                Err(InvokeError::Crashed(name.to_string()))
            }
            Err(_) => {
                warn!(tool = %name, timeout_secs = self.tool_timeout.as_secs(), "tool timed out");
                Err(InvokeError::Tool {
                    tool: name.to_string(),
                    source: ToolError::Timeout(self.tool_timeout),
                })
            }
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Check `arguments` against the parts of a JSON schema the registry enforces:
/// every `required` name is present and top-level `properties` with a simple
/// `type` hold a value of that type.
pub fn validate_arguments(schema: &Value, arguments: &Map<String, Value>) -> Result<(), String> {
    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        let missing: Vec<&str> = required
            .iter()
            .filter_map(Value::as_str)
            .filter(|name| !arguments.contains_key(*name))
            .collect();
        if !missing.is_empty() {
            return Err(format!("missing required field(s): {}", missing.join(", ")));
        }
    }

    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return Ok(());
    };
    for (name, value) in arguments {
        let expected = properties
            .get(name)
            .and_then(|p| p.get("type"))
            .and_then(Value::as_str);
        if let Some(expected) = expected {
            if !value.is_null() && !type_matches(expected, value) {
                return Err(format!("field {name} must be of type {expected}"));
            }
        }
    }
    Ok(())
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use lumen_core::ids::{ConversationId, ToolCallId};
    use lumen_core::tool_call::SpawnedToolSpec;
    use lumen_core::tools::ToolOutput;
    use lumen_core::user::EffectiveUser;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    struct Echo {
        name: &'static str,
        spawn: bool,
    }

    #[async_trait]
    impl ToolHandler for Echo {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "echoes its text"
        }
        fn parameters_schema(&self) -> Value {
            json!({
                "type": "object",
                "required": ["text"],
                "properties": {"text": {"type": "string"}, "count": {"type": "integer"}}
            })
        }
        async fn execute(
            &self,
            invocation: ToolInvocation<'_>,
            _ctx: &ToolContext,
        ) -> Result<ToolOutcome, ToolError> {
            let text = invocation.arguments["text"].as_str().unwrap_or_default();
            match text {
                "spawn" => Ok(ToolOutcome::NeedsChildren(vec![SpawnedToolSpec::new(
                    "Child",
                    Map::new(),
                )])),
                "spawn_none" => Ok(ToolOutcome::NeedsChildren(vec![])),
                "fail" => Err(ToolError::ExecutionFailed("no luck".into())),
                "panic" => panic!("boom"),
                "slow" => {
                    tokio::time::sleep(Duration::from_secs(600)).await;
                    Ok(ToolOutcome::text("late"))
                }
                other => Ok(ToolOutcome::text(other)),
            }
        }
        fn can_spawn(&self) -> bool {
            self.spawn
        }
    }

    fn ctx() -> ToolContext {
        ToolContext {
            user: EffectiveUser::new("u", "t"),
            conversation_id: ConversationId::new(1),
            cancel: CancellationToken::new(),
        }
    }

    fn call(name: &str, args: Value) -> ToolCall {
        ToolCall::new(
            ToolCallId::from_raw("c1"),
            name,
            args.as_object().cloned().unwrap_or_default(),
        )
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Echo { name: "Echo", spawn: false }));
        registry
    }

    #[test]
    fn register_has_and_sorted_names() {
        let mut registry = registry();
        registry.register(Arc::new(Echo { name: "Alpha", spawn: true }));
        assert!(registry.has("Echo"));
        assert!(!registry.has("UserInputTool"));
        assert_eq!(registry.names(), vec!["Alpha", "Echo"]);
        let defs = registry.definitions();
        assert_eq!(defs[0].name, "Alpha");
        assert!(defs[0].can_spawn);
        assert!(!defs[1].can_spawn);
    }

    #[test]
    fn last_registration_wins() {
        let mut registry = registry();
        registry.register(Arc::new(Echo { name: "Echo", spawn: true }));
        assert_eq!(registry.count(), 1);
        assert!(registry.get("Echo").unwrap().can_spawn());
    }

    #[tokio::test]
    async fn invoke_returns_handler_outcome() {
        let outcome = registry()
            .invoke(&call("Echo", json!({"text": "hi"})), &ctx())
            .await
            .unwrap();
        assert_eq!(outcome, ToolOutcome::Completed(ToolOutput::Text("hi".into())));
    }

    #[tokio::test]
    async fn unknown_tool_is_not_registered() {
        let err = registry()
            .invoke(&call("UserInputTool", json!({})), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::NotRegistered(ref n) if n == "UserInputTool"));
    }

    #[tokio::test]
    async fn schema_is_enforced_before_dispatch() {
        let err = registry().invoke(&call("Echo", json!({})), &ctx()).await.unwrap_err();
        assert!(matches!(err, InvokeError::InvalidArguments { ref reason, .. } if reason.contains("text")));

        let err = registry()
            .invoke(&call("Echo", json!({"text": "x", "count": "three"})), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::InvalidArguments { .. }));
    }

    #[tokio::test]
    async fn spawn_requires_declared_capability() {
        let err = registry()
            .invoke(&call("Echo", json!({"text": "spawn"})), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::UndeclaredSpawn(_)));

        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Echo { name: "Echo", spawn: true }));
        let outcome = registry
            .invoke(&call("Echo", json!({"text": "spawn"})), &ctx())
            .await
            .unwrap();
        assert!(matches!(outcome, ToolOutcome::NeedsChildren(ref specs) if specs.len() == 1));
    }

    #[tokio::test]
    async fn spawn_without_children_is_rejected() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Echo { name: "Echo", spawn: true }));
        let err = registry
            .invoke(&call("Echo", json!({"text": "spawn_none"})), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::EmptySpawn(ref n) if n == "Echo"));
    }

    #[tokio::test]
    async fn handler_failure_and_panic_are_errors() {
        let err = registry()
            .invoke(&call("Echo", json!({"text": "fail"})), &ctx())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Echo: execution failed: no luck");

        let err = registry()
            .invoke(&call("Echo", json!({"text": "panic"})), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::Crashed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_tool_times_out() {
        let registry = registry().with_tool_timeout(Duration::from_secs(5));
        let err = registry
            .invoke(&call("Echo", json!({"text": "slow"})), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            InvokeError::Tool { source: ToolError::Timeout(_), .. }
        ));
    }
}
