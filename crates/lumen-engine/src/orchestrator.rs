use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use lumen_core::ids::{ConversationId, RunId};
use lumen_core::log::LogEntry;
use lumen_core::tool_call::{CompletedToolCallPayload, ToolCall};
use lumen_core::tools::{ToolContext, ToolOutcome};
use lumen_core::user::EffectiveUser;
use lumen_store::ConversationRepo;

use crate::error::EngineError;
use crate::registry::{InvokeError, ToolRegistry};

/// Hooks fired while a batch is processed. All methods default to no-ops.
pub trait OrchestratorObserver: Send + Sync {
    fn on_tool_completed(&self, _call: &ToolCall, _payload: &CompletedToolCallPayload) {}
    fn on_tool_spawned(&self, _parent: &ToolCall, _child: &ToolCall) {}
    fn on_tool_failed(&self, _call: &ToolCall, _error: &InvokeError) {}
}

pub struct NoopObserver;

impl OrchestratorObserver for NoopObserver {}

/// Classification of one batch of pending calls.
#[derive(Clone, Debug)]
pub struct OrchestrationResult {
    /// Results of locally executed calls, in input order. Failures included.
    pub completed: Vec<CompletedToolCallPayload>,
    /// Calls with no local handler, unchanged.
    pub remaining_pending: Vec<ToolCall>,
    /// Children minted for calls that suspended.
    pub spawned: Vec<ToolCall>,
    pub conversation_id: ConversationId,
    pub log_index: usize,
    /// Entries appended to the log for the spawned children.
    pub log_entries: Vec<LogEntry>,
    /// Local calls whose handler stopped early because the turn was
    /// cancelled. Never handed to the browser.
    pub interrupted: Vec<ToolCall>,
}

impl OrchestrationResult {
    fn untouched(pending: Vec<ToolCall>, conversation_id: ConversationId, log_index: usize) -> Self {
        Self {
            completed: Vec::new(),
            remaining_pending: pending,
            spawned: Vec::new(),
            conversation_id,
            log_index,
            log_entries: Vec::new(),
            interrupted: Vec::new(),
        }
    }
}

/// Executes the server-side subset of a backend's pending tool calls.
#[derive(Clone)]
pub struct Orchestrator {
    registry: Arc<ToolRegistry>,
    conversations: Arc<ConversationRepo>,
}

impl Orchestrator {
    pub fn new(registry: Arc<ToolRegistry>, conversations: Arc<ConversationRepo>) -> Self {
        Self {
            registry,
            conversations,
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    #[instrument(
        skip_all,
        fields(conversation_id = %conversation_id, log_index = log_index, calls = pending.len())
    )]
    pub async fn orchestrate(
        &self,
        pending: Vec<ToolCall>,
        conversation_id: ConversationId,
        log_index: usize,
        user: &EffectiveUser,
        cancel: &CancellationToken,
        observer: &dyn OrchestratorObserver,
    ) -> Result<OrchestrationResult, EngineError> {
        if cancel.is_cancelled() {
            debug!("cancelled before orchestration, returning batch untouched");
            return Ok(OrchestrationResult::untouched(pending, conversation_id, log_index));
        }

        let ctx = ToolContext {
            user: user.clone(),
            conversation_id,
            cancel: cancel.clone(),
        };
        let mut result = OrchestrationResult::untouched(Vec::new(), conversation_id, log_index);

        for call in pending {
            if !self.registry.has(call.name()) {
                result.remaining_pending.push(call);
                continue;
            }

            match self.registry.invoke(&call, &ctx).await {
                Ok(ToolOutcome::Completed(output)) => {
                    let payload = CompletedToolCallPayload::new(call.id.clone(), output.into_content());
                    observer.on_tool_completed(&call, &payload);
                    result.completed.push(payload);
                }
                Ok(ToolOutcome::NeedsChildren(specs)) => {
                    debug!(tool = %call.name(), children = specs.len(), "tool suspended on children");
                    for spec in specs {
                        let child = ToolCall::child_of(&call.id, spec);
                        observer.on_tool_spawned(&call, &child);
                        result.spawned.push(child);
                    }
                }
                Ok(ToolOutcome::Interrupted) => {
                    info!(tool = %call.name(), "tool interrupted");
                    result.interrupted.push(call);
                }
                Err(InvokeError::NotRegistered(_)) => result.remaining_pending.push(call),
                Err(e) => {
                    warn!(tool = %call.name(), error = %e, "tool failed");
                    observer.on_tool_failed(&call, &e);
                    result
                        .completed
                        .push(CompletedToolCallPayload::failure(call.id.clone(), &e.to_string()));
                }
            }
        }

        if !result.spawned.is_empty() {
            let run_id = RunId::new();
            let entries: Vec<LogEntry> = result
                .spawned
                .iter()
                .map(|child| LogEntry::task(child, &run_id))
                .collect();
            let outcome = self
                .conversations
                .append_log(conversation_id, user, log_index, &entries)?;
            info!(
                run_id = %run_id,
                children = entries.len(),
                conversation_id = %outcome.conversation_id,
                "spawned child calls"
            );
            result.conversation_id = outcome.conversation_id;
            result.log_index = outcome.log_index;
            result.log_entries = entries;
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use lumen_core::errors::ToolError;
    use lumen_core::ids::ToolCallId;
    use lumen_core::log::child_task_batches;
    use lumen_core::tool_call::SpawnedToolSpec;
    use lumen_core::tools::{ToolHandler, ToolInvocation};
    use lumen_store::Database;
    use parking_lot::Mutex;
    use serde_json::{json, Map, Value};

    /// Spawns one `Confirm` child, then answers with a fixed string on resume.
    struct Delegating;

    #[async_trait]
    impl ToolHandler for Delegating {
        fn name(&self) -> &str {
            "Delegating"
        }
        fn description(&self) -> &str {
            "asks the browser first"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
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
                return Ok(ToolOutcome::text("resumed"));
            }
            Ok(ToolOutcome::NeedsChildren(vec![SpawnedToolSpec::new(
                "Confirm",
                json!({"prompt": "ok?"}).as_object().cloned().unwrap_or_default(),
            )]))
        }
    }

    struct Upper;

    #[async_trait]
    impl ToolHandler for Upper {
        fn name(&self) -> &str {
            "Upper"
        }
        fn description(&self) -> &str {
            "upper-cases text"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object", "required": ["text"]})
        }
        async fn execute(
            &self,
            invocation: ToolInvocation<'_>,
            _ctx: &ToolContext,
        ) -> Result<ToolOutcome, ToolError> {
            let text = invocation.arguments["text"].as_str().unwrap_or_default();
            if text == "explode" {
                return Err(ToolError::ExecutionFailed("warehouse unreachable".into()));
            }
            Ok(ToolOutcome::json(json!({"text": text.to_uppercase()})))
        }
    }

    /// Declares the spawn capability but sometimes names no children, and
    /// gives up when asked to stop.
    struct Erratic;

    #[async_trait]
    impl ToolHandler for Erratic {
        fn name(&self) -> &str {
            "Erratic"
        }
        fn description(&self) -> &str {
            "misbehaves on request"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object", "required": ["mode"]})
        }
        fn can_spawn(&self) -> bool {
            true
        }
        async fn execute(
            &self,
            invocation: ToolInvocation<'_>,
            _ctx: &ToolContext,
        ) -> Result<ToolOutcome, ToolError> {
            match invocation.arguments["mode"].as_str() {
                Some("hollow") => Ok(ToolOutcome::NeedsChildren(Vec::new())),
                _ => Ok(ToolOutcome::Interrupted),
            }
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl OrchestratorObserver for Recorder {
        fn on_tool_completed(&self, call: &ToolCall, _payload: &CompletedToolCallPayload) {
            self.events.lock().push(format!("completed:{}", call.name()));
        }
        fn on_tool_spawned(&self, _parent: &ToolCall, child: &ToolCall) {
            self.events.lock().push(format!("spawned:{}", child.name()));
        }
        fn on_tool_failed(&self, call: &ToolCall, _error: &InvokeError) {
            self.events.lock().push(format!("failed:{}", call.name()));
        }
    }

    struct Fixture {
        orchestrator: Orchestrator,
        conversations: Arc<ConversationRepo>,
        user: EffectiveUser,
        conversation_id: ConversationId,
    }

    fn fixture() -> Fixture {
        let db = Database::in_memory().unwrap();
        let conversations = Arc::new(ConversationRepo::new(db));
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Delegating));
        registry.register(Arc::new(Upper));
        registry.register(Arc::new(Erratic));
        let user = EffectiveUser::new("ana", "acme");
        let conversation_id = conversations.get_or_create(None, &user, Some("hi")).unwrap().id;
        Fixture {
            orchestrator: Orchestrator::new(Arc::new(registry), conversations.clone()),
            conversations,
            user,
            conversation_id,
        }
    }

    fn call(id: &str, name: &str, args: Value) -> ToolCall {
        ToolCall::new(
            ToolCallId::from_raw(id),
            name,
            args.as_object().cloned().unwrap_or_else(Map::new),
        )
    }

    impl Fixture {
        async fn run(&self, pending: Vec<ToolCall>, cancel: &CancellationToken) -> OrchestrationResult {
            self.orchestrator
                .orchestrate(pending, self.conversation_id, 0, &self.user, cancel, &NoopObserver)
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn spawn_then_resume() {
        let f = fixture();
        let parent = call("p1", "Delegating", json!({}));
        let result = f.run(vec![parent.clone()], &CancellationToken::new()).await;

        assert!(result.completed.is_empty());
        assert!(result.remaining_pending.is_empty());
        assert_eq!(result.spawned.len(), 1);
        let child = &result.spawned[0];
        assert_eq!(child.name(), "Confirm");
        assert_eq!(child.parent_unique_id.as_ref(), Some(&parent.id));
        assert_eq!(result.log_index, 1);
        assert_eq!(result.conversation_id, f.conversation_id);

        // The browser answers the child; the backend logs the result and resumes the parent.
        let mut log = f.conversations.load_log(f.conversation_id, &f.user, None).unwrap();
        log.push(LogEntry::task_result(child.id.clone(), json!("yes")));
        let resumed = parent.clone().with_child_tasks(child_task_batches(&log, &parent.id));

        let result = f.run(vec![resumed], &CancellationToken::new()).await;
        assert!(result.spawned.is_empty());
        assert_eq!(result.completed.len(), 1);
        assert_eq!(result.completed[0].content, "resumed");
        assert_eq!(result.completed[0].tool_call_id, parent.id);
    }

    #[tokio::test]
    async fn spawned_children_share_one_run() {
        let f = fixture();
        let result = f
            .run(
                vec![call("a", "Delegating", json!({})), call("b", "Delegating", json!({}))],
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(result.spawned.len(), 2);
        let runs: Vec<_> = result
            .log_entries
            .iter()
            .map(|e| match e {
                LogEntry::Task(t) => t.run_id.clone(),
                other => panic!("unexpected entry {other:?}"),
            })
            .collect();
        assert!(runs[0].is_some());
        assert_eq!(runs[0], runs[1]);
    }

    #[tokio::test]
    async fn unregistered_calls_pass_through() {
        let f = fixture();
        let browser = call("u1", "UserInputTool", json!({"question": "which region?"}));
        let result = f.run(vec![browser.clone()], &CancellationToken::new()).await;
        assert_eq!(result.remaining_pending, vec![browser]);
        assert!(result.completed.is_empty());
        assert!(result.spawned.is_empty());
        assert_eq!(result.log_index, 0);
    }

    #[tokio::test]
    async fn pre_cancelled_batch_is_untouched() {
        let f = fixture();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let batch = vec![
            call("a", "Upper", json!({"text": "x"})),
            call("b", "Delegating", json!({})),
            call("c", "UserInputTool", json!({})),
        ];
        let result = f.run(batch.clone(), &cancel).await;
        assert_eq!(result.remaining_pending, batch);
        assert!(result.completed.is_empty());
        assert!(result.spawned.is_empty());
        assert_eq!(f.conversations.log_len(f.conversation_id, &f.user).unwrap(), 0);
    }

    #[tokio::test]
    async fn failures_become_payloads() {
        let f = fixture();
        let result = f
            .run(
                vec![
                    call("bad", "Upper", json!({"text": "explode"})),
                    call("missing", "Upper", json!({})),
                ],
                &CancellationToken::new(),
            )
            .await;
        assert!(result.remaining_pending.is_empty());
        assert!(result.spawned.is_empty());
        assert_eq!(result.completed.len(), 2);

        let first: Value = serde_json::from_str(&result.completed[0].content).unwrap();
        assert_eq!(first["success"], false);
        assert!(first["error"].as_str().unwrap().contains("warehouse unreachable"));
        let second: Value = serde_json::from_str(&result.completed[1].content).unwrap();
        assert!(second["error"].as_str().unwrap().contains("text"));
    }

    #[tokio::test]
    async fn spawn_with_no_children_fails_instead_of_vanishing() {
        let f = fixture();
        let result = f
            .run(vec![call("h1", "Erratic", json!({"mode": "hollow"}))], &CancellationToken::new())
            .await;
        assert!(result.remaining_pending.is_empty());
        assert!(result.spawned.is_empty());
        assert_eq!(result.completed.len(), 1);
        assert_eq!(result.completed[0].tool_call_id, ToolCallId::from_raw("h1"));
        let content: Value = serde_json::from_str(&result.completed[0].content).unwrap();
        assert_eq!(content["success"], false);
        assert!(content["error"].as_str().unwrap().contains("named none"));
        assert_eq!(f.conversations.log_len(f.conversation_id, &f.user).unwrap(), 0);
    }

    #[tokio::test]
    async fn interrupted_calls_are_kept_apart_from_browser_calls() {
        let f = fixture();
        let browser = call("u1", "UserInputTool", json!({}));
        let stopped = call("s1", "Erratic", json!({"mode": "stop"}));
        let result = f
            .run(vec![stopped.clone(), browser.clone()], &CancellationToken::new())
            .await;
        assert_eq!(result.interrupted, vec![stopped]);
        assert_eq!(result.remaining_pending, vec![browser]);
        assert!(result.completed.is_empty());
    }

    #[tokio::test]
    async fn completed_order_matches_input() {
        let f = fixture();
        let batch: Vec<ToolCall> = (0..5)
            .map(|i| call(&format!("c{i}"), "Upper", json!({"text": format!("t{i}")})))
            .collect();
        let result = f.run(batch.clone(), &CancellationToken::new()).await;
        let ids: Vec<_> = result.completed.iter().map(|p| p.tool_call_id.clone()).collect();
        let expected: Vec<_> = batch.iter().map(|c| c.id.clone()).collect();
        assert_eq!(ids, expected);
        assert_eq!(result.completed[2].content, r#"{"text":"T2"}"#);
    }

    #[tokio::test]
    async fn observer_sees_each_classification() {
        let f = fixture();
        let recorder = Recorder::default();
        f.orchestrator
            .orchestrate(
                vec![
                    call("a", "Upper", json!({"text": "x"})),
                    call("b", "Delegating", json!({})),
                    call("c", "Upper", json!({"text": "explode"})),
                    call("d", "UserInputTool", json!({})),
                ],
                f.conversation_id,
                0,
                &f.user,
                &CancellationToken::new(),
                &recorder,
            )
            .await
            .unwrap();
        assert_eq!(
            *recorder.events.lock(),
            vec!["completed:Upper", "spawned:Confirm", "failed:Upper"]
        );
    }

    #[tokio::test]
    async fn stale_index_forks_spawn_append() {
        let f = fixture();
        f.conversations
            .append_log(
                f.conversation_id,
                &f.user,
                0,
                &[LogEntry::task(&call("x", "Other", json!({})), &RunId::new())],
            )
            .unwrap();
        let result = f.run(vec![call("p", "Delegating", json!({}))], &CancellationToken::new()).await;
        assert_ne!(result.conversation_id, f.conversation_id);
        assert_eq!(result.log_index, 1);
    }
}
