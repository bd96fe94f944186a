//! Client side of the reasoning-backend protocol.

pub mod client;
pub mod mock;
pub mod sse;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use lumen_core::errors::BackendError;
use lumen_core::protocol::{BackendRequest, BackendResponse, CloseRequest, CloseResponse};
use lumen_core::stream::BackendStreamEvent;

pub use client::{HttpBackend, HttpBackendConfig};
pub use mock::{MockBackend, MockReply};

/// Incremental events ending in exactly one `Done` or `Failed`.
pub type BackendEventStream = Pin<Box<dyn Stream<Item = BackendStreamEvent> + Send>>;

/// The external agent that decides what happens next in a conversation.
#[async_trait]
pub trait ReasoningBackend: Send + Sync {
    /// One synchronous turn.
    async fn chat(&self, request: &BackendRequest) -> Result<BackendResponse, BackendError>;

    /// One streaming turn. Errors before the first byte are returned directly;
    /// later failures arrive as a `Failed` event.
    async fn chat_stream(&self, request: &BackendRequest)
        -> Result<BackendEventStream, BackendError>;

    /// Interruption markers for every task still outstanding in `request.log`.
    async fn close(&self, request: &CloseRequest) -> Result<CloseResponse, BackendError>;
}
