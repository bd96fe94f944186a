use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;
use serde_json::json;

use lumen_core::errors::BackendError;
use lumen_core::log::{pending_tasks, LogEntry};
use lumen_core::protocol::{BackendRequest, BackendResponse, CloseRequest, CloseResponse};
use lumen_core::stream::{BackendStreamEvent, StreamingEvent};

use crate::{BackendEventStream, ReasoningBackend};

/// Pre-programmed backend turns for deterministic tests.
#[derive(Clone, Debug)]
pub enum MockReply {
    /// A complete turn. Streamed as a single `Done`.
    Respond(BackendResponse),
    /// Streamed as-is. `chat` answers with the first `Done`/`Failed` in it.
    Stream(Vec<BackendStreamEvent>),
    /// Fail the call itself.
    Fail(BackendError),
    /// Wait, then resolve the inner reply.
    Delay(Duration, Box<MockReply>),
}

impl MockReply {
    /// A reply whose stream carries `chunks` as content events before `Done`.
    pub fn streamed(chunks: &[&str], response: BackendResponse) -> Self {
        let mut events: Vec<_> = chunks
            .iter()
            .map(|c| {
                BackendStreamEvent::Streaming(StreamingEvent::Content {
                    content: c.to_string(),
                })
            })
            .collect();
        events.push(BackendStreamEvent::Done(response));
        Self::Stream(events)
    }

    pub fn delayed(delay: Duration, inner: MockReply) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Backend that replays scripted replies in order and records what it was sent.
pub struct MockBackend {
    replies: Mutex<VecDeque<MockReply>>,
    requests: Mutex<Vec<BackendRequest>>,
    close_requests: Mutex<Vec<CloseRequest>>,
    call_count: AtomicUsize,
}

impl MockBackend {
    pub fn new(replies: Vec<MockReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
            close_requests: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
        }
    }

    /// Queue more replies after construction.
    pub fn push(&self, reply: MockReply) {
        self.replies.lock().push_back(reply);
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Every chat request received, in order.
    pub fn requests(&self) -> Vec<BackendRequest> {
        self.requests.lock().clone()
    }

    pub fn close_requests(&self) -> Vec<CloseRequest> {
        self.close_requests.lock().clone()
    }

    async fn next_reply(&self, request: &BackendRequest) -> Result<MockReply, BackendError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.requests.lock().push(request.clone());
        let reply = self.replies.lock().pop_front().ok_or_else(|| {
            BackendError::InvalidResponse(format!("MockBackend: no reply configured for call {idx}"))
        })?;
        resolve(reply).await
    }
}

/// Unwrap delays, sleeping for each. Iterative to avoid recursive async.
async fn resolve(mut reply: MockReply) -> Result<MockReply, BackendError> {
    loop {
        match reply {
            MockReply::Delay(duration, inner) => {
                tokio::time::sleep(duration).await;
                reply = *inner;
            }
            MockReply::Fail(e) => return Err(e),
            other => return Ok(other),
        }
    }
}

#[async_trait]
impl ReasoningBackend for MockBackend {
    async fn chat(&self, request: &BackendRequest) -> Result<BackendResponse, BackendError> {
        match self.next_reply(request).await? {
            MockReply::Respond(response) => Ok(response),
            MockReply::Stream(events) => events
                .into_iter()
                .find_map(|e| match e {
                    BackendStreamEvent::Done(response) => Some(Ok(response)),
                    BackendStreamEvent::Failed(err) => Some(Err(err)),
                    BackendStreamEvent::Streaming(_) => None,
                })
                .unwrap_or(Err(BackendError::StreamIncomplete)),
            MockReply::Fail(e) => Err(e),
            MockReply::Delay(..) => Err(BackendError::InvalidResponse("unresolved delay".into())),
        }
    }

    async fn chat_stream(
        &self,
        request: &BackendRequest,
    ) -> Result<BackendEventStream, BackendError> {
        let events = match self.next_reply(request).await? {
            MockReply::Respond(response) => vec![BackendStreamEvent::Done(response)],
            MockReply::Stream(events) => events,
            MockReply::Fail(e) => return Err(e),
            MockReply::Delay(..) => {
                return Err(BackendError::InvalidResponse("unresolved delay".into()))
            }
        };
        Ok(Box::pin(stream::iter(events)))
    }

    /// Marks every pending task in the log as interrupted.
    async fn close(&self, request: &CloseRequest) -> Result<CloseResponse, BackendError> {
        self.close_requests.lock().push(request.clone());
        let log_diff = pending_tasks(&request.log)
            .into_iter()
            .map(|task| {
                LogEntry::task_result(
                    task.unique_id.clone(),
                    json!({"success": false, "error": "interrupted"}),
                )
            })
            .collect();
        Ok(CloseResponse { log_diff })
    }
}
