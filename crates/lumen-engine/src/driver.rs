use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use lumen_backend::ReasoningBackend;
use lumen_core::errors::BackendError;
use lumen_core::ids::ConversationId;
use lumen_core::log::{child_task_batches, children_complete, LogEntry};
use lumen_core::protocol::{BackendRequest, BackendResponse, ChatRequest, ChatResponse, CloseRequest};
use lumen_core::stream::{BackendStreamEvent, ChatStreamEvent, StreamingEvent};
use lumen_core::tool_call::{CompletedToolCallPayload, ToolCall};
use lumen_core::user::EffectiveUser;
use lumen_store::{ConversationRepo, UsageRepo};

use crate::error::EngineError;
use crate::orchestrator::{NoopObserver, Orchestrator, OrchestratorObserver};
use crate::registry::ToolRegistry;

const DEFAULT_MAX_ITERATIONS: usize = 50;

/// Sink for browser-facing stream events.
pub type ChatEventSink = mpsc::UnboundedSender<ChatStreamEvent>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TurnStatus {
    /// The backend has nothing left to do.
    Done,
    /// Calls are waiting on the browser.
    AwaitingUser,
    /// The caller went away; outstanding tasks were closed.
    Interrupted,
}

/// Working state of one turn, once its conversation is known.
struct Turn {
    conversation_id: ConversationId,
    log: Vec<LogEntry>,
    log_index: usize,
    completed: Vec<CompletedToolCallPayload>,
    pending: Vec<ToolCall>,
    status: TurnStatus,
}

impl Turn {
    /// Add results to the running total, once per call id.
    fn absorb(&mut self, payloads: &[CompletedToolCallPayload]) {
        for payload in payloads {
            if !self.completed.iter().any(|p| p.tool_call_id == payload.tool_call_id) {
                self.completed.push(payload.clone());
            }
        }
    }

    fn into_response(self) -> ChatResponse {
        ChatResponse {
            conversation_id: Some(self.conversation_id),
            // A caller may claim more entries than exist.
            log_index: self.log_index.min(self.log.len()),
            pending_tool_calls: self.pending,
            completed_tool_calls: self.completed,
            error: None,
            interrupted: self.status == TurnStatus::Interrupted,
        }
    }
}

enum Transport<'a> {
    Sync,
    Streaming(&'a ChatEventSink),
}

/// Forwards incremental events to the browser unless it has gone away.
struct StreamForwarder<'a> {
    sink: &'a ChatEventSink,
    conversation_id: ConversationId,
    cancel: &'a CancellationToken,
}

impl StreamForwarder<'_> {
    fn forward(&self, event: StreamingEvent) {
        if self.cancel.is_cancelled() || self.sink.is_closed() {
            return;
        }
        let _ = self.sink.send(ChatStreamEvent::Streaming {
            conversation_id: Some(self.conversation_id),
            event,
        });
    }
}

impl OrchestratorObserver for StreamForwarder<'_> {
    fn on_tool_completed(&self, _call: &ToolCall, payload: &CompletedToolCallPayload) {
        self.forward(StreamingEvent::ToolCompleted {
            tool_call_id: payload.tool_call_id.clone(),
            content: payload.content.clone(),
        });
    }

    fn on_tool_spawned(&self, _parent: &ToolCall, child: &ToolCall) {
        self.forward(StreamingEvent::ToolCreated {
            tool_call: child.clone(),
        });
    }
}

/// Runs chat turns: backend round-trips, local tool execution, and log
/// persistence, until the backend is done or the browser has to act.
pub struct TurnDriver {
    backend: Arc<dyn ReasoningBackend>,
    orchestrator: Orchestrator,
    conversations: Arc<ConversationRepo>,
    usage: Arc<UsageRepo>,
    max_iterations: usize,
}

impl TurnDriver {
    pub fn new(
        backend: Arc<dyn ReasoningBackend>,
        orchestrator: Orchestrator,
        conversations: Arc<ConversationRepo>,
        usage: Arc<UsageRepo>,
    ) -> Self {
        Self {
            backend,
            orchestrator,
            conversations,
            usage,
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }

    pub fn with_max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = max;
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        self.orchestrator.registry()
    }

    /// Run one turn against the synchronous backend endpoint.
    pub async fn run_turn(
        &self,
        request: ChatRequest,
        user: &EffectiveUser,
        cancel: &CancellationToken,
    ) -> ChatResponse {
        self.drive(request, user, cancel, Transport::Sync).await
    }

    /// Run one turn against the streaming backend endpoint, forwarding
    /// incremental events into `sink`. Always finishes with a `done` event,
    /// preceded by `error` when the turn failed.
    pub async fn run_turn_streaming(
        &self,
        request: ChatRequest,
        user: &EffectiveUser,
        cancel: &CancellationToken,
        sink: &ChatEventSink,
    ) -> ChatResponse {
        let response = self.drive(request, user, cancel, Transport::Streaming(sink)).await;
        if let Some(error) = &response.error {
            let _ = sink.send(ChatStreamEvent::error(error.clone()));
        }
        let _ = sink.send(ChatStreamEvent::done(response.clone()));
        response
    }

    #[instrument(
        skip_all,
        fields(
            agent = %request.agent,
            tenant = %user.tenant_id,
            conversation_id = tracing::field::Empty,
        )
    )]
    async fn drive(
        &self,
        request: ChatRequest,
        user: &EffectiveUser,
        cancel: &CancellationToken,
        transport: Transport<'_>,
    ) -> ChatResponse {
        let mut slot = None;
        let result = self.drive_loop(request, user, cancel, &transport, &mut slot).await;
        let status = slot.as_ref().map(|turn| turn.status);
        let mut response = slot.map(Turn::into_response).unwrap_or_default();

        match result {
            Ok(()) => {
                info!(
                    status = ?status,
                    conversation_id = ?response.conversation_id,
                    log_index = response.log_index,
                    pending = response.pending_tool_calls.len(),
                    completed = response.completed_tool_calls.len(),
                    "turn finished"
                );
            }
            Err(e) => {
                warn!(
                    kind = e.kind(),
                    error = %e,
                    conversation_id = ?response.conversation_id,
                    log_index = response.log_index,
                    "turn failed"
                );
                response.pending_tool_calls.clear();
                response.interrupted = false;
                response.error = Some(e.to_string());
            }
        }
        response
    }

    async fn drive_loop(
        &self,
        request: ChatRequest,
        user: &EffectiveUser,
        cancel: &CancellationToken,
        transport: &Transport<'_>,
        slot: &mut Option<Turn>,
    ) -> Result<(), EngineError> {
        let conversation = self.conversations.get_or_create(
            request.conversation_id,
            user,
            request.user_message.as_deref(),
        )?;
        tracing::Span::current().record("conversation_id", tracing::field::display(conversation.id));

        let log = self.conversations.load_log(conversation.id, user, request.log_index)?;
        let log_index = request.log_index.unwrap_or(log.len());
        let turn = slot.insert(Turn {
            conversation_id: conversation.id,
            log,
            log_index,
            completed: Vec::new(),
            pending: Vec::new(),
            status: TurnStatus::Done,
        });

        let mut user_message = request.user_message;
        let mut completed_inputs: Vec<CompletedToolCallPayload> = request
            .completed_tool_calls
            .into_iter()
            .map(|(_, payload)| payload)
            .collect();

        for iteration in 0..self.max_iterations {
            debug!(iteration, log_index = turn.log_index, "calling backend");
            let backend_request = BackendRequest {
                log: turn.log.clone(),
                user_message: user_message.take(),
                completed_tool_calls: std::mem::take(&mut completed_inputs),
                agent: request.agent.clone(),
                agent_args: request.agent_args.clone(),
            };
            let response = self
                .call_backend(&backend_request, transport, turn.conversation_id, cancel)
                .await?;
            if let Some(message) = response.error {
                return Err(BackendError::Reported(message).into());
            }
            turn.absorb(&response.completed_tool_calls);

            if cancel.is_cancelled() {
                return self.interrupt(turn, response.log_diff, user).await;
            }

            self.append(turn, user, response.log_diff)?;
            if let Err(e) = self.usage.record(turn.conversation_id, &response.llm_calls) {
                warn!(conversation_id = %turn.conversation_id, error = %e, "failed to record llm usage");
            }

            if response.pending_tool_calls.is_empty() {
                turn.status = TurnStatus::Done;
                return Ok(());
            }

            let calls = hydrate_resumes(&turn.log, response.pending_tool_calls);
            let forwarder = match transport {
                Transport::Streaming(sink) => Some(StreamForwarder {
                    sink,
                    conversation_id: turn.conversation_id,
                    cancel,
                }),
                Transport::Sync => None,
            };
            let observer: &dyn OrchestratorObserver = match &forwarder {
                Some(f) => f,
                None => &NoopObserver,
            };
            let result = self
                .orchestrator
                .orchestrate(calls, turn.conversation_id, turn.log_index, user, cancel, observer)
                .await?;

            turn.conversation_id = result.conversation_id;
            if !result.log_entries.is_empty() {
                let kept = result.log_index.saturating_sub(result.log_entries.len());
                turn.log.truncate(kept);
                turn.log.extend(result.log_entries);
                turn.log_index = result.log_index;
            }
            turn.absorb(&result.completed);

            if cancel.is_cancelled() || !result.interrupted.is_empty() {
                return self.interrupt(turn, Vec::new(), user).await;
            }

            let mut all_pending = result.remaining_pending;
            all_pending.extend(result.spawned);
            if !result.completed.is_empty() {
                completed_inputs = result.completed;
            } else if !all_pending.is_empty() {
                turn.pending = all_pending;
                turn.status = TurnStatus::AwaitingUser;
                return Ok(());
            } else {
                turn.status = TurnStatus::Done;
                return Ok(());
            }
        }

        Err(EngineError::IterationLimit(self.max_iterations))
    }

    async fn call_backend(
        &self,
        request: &BackendRequest,
        transport: &Transport<'_>,
        conversation_id: ConversationId,
        cancel: &CancellationToken,
    ) -> Result<BackendResponse, EngineError> {
        let sink = match transport {
            Transport::Sync => return Ok(self.backend.chat(request).await?),
            Transport::Streaming(sink) => sink,
        };

        let forwarder = StreamForwarder {
            sink,
            conversation_id,
            cancel,
        };
        let mut stream = self.backend.chat_stream(request).await?;
        let mut terminal: Option<Result<BackendResponse, BackendError>> = None;
        // Drain fully even when the browser is gone.
        while let Some(event) = stream.next().await {
            match event {
                BackendStreamEvent::Streaming(event) => forwarder.forward(event),
                BackendStreamEvent::Done(response) => {
                    terminal.get_or_insert(Ok(response));
                }
                BackendStreamEvent::Failed(e) => {
                    terminal.get_or_insert(Err(e));
                }
            }
        }
        Ok(terminal.unwrap_or(Err(BackendError::StreamIncomplete))?)
    }

    /// Persist `entries` and move the turn onto wherever they landed.
    fn append(&self, turn: &mut Turn, user: &EffectiveUser, entries: Vec<LogEntry>) -> Result<(), EngineError> {
        if entries.is_empty() {
            return Ok(());
        }
        let outcome = self
            .conversations
            .append_log(turn.conversation_id, user, turn.log_index, &entries)?;
        if outcome.forked() {
            info!(
                from = %turn.conversation_id,
                to = %outcome.conversation_id,
                "turn continues on forked conversation"
            );
        }
        turn.log.truncate(outcome.log_index.saturating_sub(entries.len()));
        turn.log.extend(entries);
        turn.conversation_id = outcome.conversation_id;
        turn.log_index = outcome.log_index;
        Ok(())
    }

    /// Close outstanding tasks and persist what the turn produced so far.
    async fn interrupt(
        &self,
        turn: &mut Turn,
        mut diff: Vec<LogEntry>,
        user: &EffectiveUser,
    ) -> Result<(), EngineError> {
        let mut log = turn.log.clone();
        log.extend(diff.iter().cloned());
        let closed = self.backend.close(&CloseRequest { log }).await?;
        info!(
            conversation_id = %turn.conversation_id,
            markers = closed.log_diff.len(),
            "turn interrupted"
        );
        diff.extend(closed.log_diff);
        self.append(turn, user, diff)?;
        turn.pending.clear();
        turn.status = TurnStatus::Interrupted;
        Ok(())
    }
}

/// Attach completed child results to parents the backend re-reports without
/// them.
fn hydrate_resumes(log: &[LogEntry], calls: Vec<ToolCall>) -> Vec<ToolCall> {
    calls
        .into_iter()
        .map(|call| {
            if call.is_resume() || !children_complete(log, &call.id) {
                return call;
            }
            let batches = child_task_batches(log, &call.id);
            call.with_child_tasks(batches)
        })
        .collect()
}
