//! HTTP handlers for the chat API.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use lumen_core::protocol::{ChatRequest, ChatResponse};
use lumen_core::stream::ChatStreamEvent;
use lumen_engine::TurnDriver;
use lumen_store::Database;

use crate::auth::{Authenticator, UNAUTHORIZED};

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Shared state available to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub driver: Arc<TurnDriver>,
    pub db: Database,
    pub auth: Arc<dyn Authenticator>,
}

impl AppState {
    pub fn new(driver: Arc<TurnDriver>, db: Database, auth: Arc<dyn Authenticator>) -> Self {
        Self { driver, db, auth }
    }
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, Json(ChatResponse::rejected(UNAUTHORIZED))).into_response()
}

/// `POST /api/chat`
pub async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Response {
    let Some(user) = state.auth.authenticate(&headers) else {
        warn!(route = "chat", "rejected unauthenticated request");
        return unauthorized();
    };

    // The turn runs detached so persistence finishes even if the client hangs
    // up; the guard turns the hang-up into cancellation.
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let driver = state.driver.clone();
    let turn = tokio::spawn(async move { driver.run_turn(request, &user, &cancel).await });
    let result = turn.await;
    guard.disarm();

    match result {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => {
            error!(error = %e, "chat turn task failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ChatResponse::rejected("internal error")),
            )
                .into_response()
        }
    }
}

/// `POST /api/chat/stream`
pub async fn chat_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Response {
    let Some(user) = state.auth.authenticate(&headers) else {
        warn!(route = "chat_stream", "rejected unauthenticated request");
        return unauthorized();
    };

    let (tx, rx) = mpsc::unbounded_channel();
    let driver = state.driver.clone();
    tokio::spawn(async move {
        let cancel = CancellationToken::new();
        let turn = driver.run_turn_streaming(request, &user, &cancel, &tx);
        tokio::pin!(turn);
        tokio::select! {
            _ = &mut turn => {}
            _ = tx.closed() => {
                debug!("stream client disconnected, cancelling turn");
                cancel.cancel();
                turn.await;
            }
        }
    });

    let events = UnboundedReceiverStream::new(rx).map(|event| Ok::<_, Infallible>(sse_event(&event)));
    Sse::new(events)
        .keep_alive(
            KeepAlive::new()
                .interval(KEEP_ALIVE_INTERVAL)
                .text("keepalive"),
        )
        .into_response()
}

fn sse_event(event: &ChatStreamEvent) -> Event {
    let data = serde_json::to_string(&event.payload()).unwrap_or_else(|_| "{}".to_string());
    Event::default().event(event.event_name()).data(data)
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Response {
    let tools = state.driver.registry().names();
    match state.db.ping() {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "healthy", "tools": tools }))).into_response(),
        Err(e) => {
            warn!(error = %e, "health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unhealthy", "tools": tools })),
            )
                .into_response()
        }
    }
}
