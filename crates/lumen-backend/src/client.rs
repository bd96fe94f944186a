use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::{Future, Stream};
use reqwest::{Client, RequestBuilder, Response};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use tracing::{instrument, warn};

use lumen_core::errors::BackendError;
use lumen_core::protocol::{BackendRequest, BackendResponse, CloseRequest, CloseResponse};
use lumen_core::stream::BackendStreamEvent;

use crate::sse;
use crate::{BackendEventStream, ReasoningBackend};

/// Connection parameters for [`HttpBackend`].
#[derive(Debug)]
pub struct HttpBackendConfig {
    pub base_url: String,
    pub api_key: Option<SecretString>,
    /// Whole-request timeout for `chat` and `close`.
    pub timeout: Duration,
    pub connect_timeout: Duration,
    /// Maximum silence on a streaming response.
    pub idle_timeout: Duration,
}

impl HttpBackendConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(90),
        }
    }

    /// Send `key` as a bearer token on every request.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(SecretString::from(key.into()));
        self
    }
}

/// Talks to the reasoning backend over HTTP: `POST /chat`, `POST /chat/stream`
/// (SSE), `POST /close`. Failures are returned as-is; nothing is retried.
pub struct HttpBackend {
    client: Client,
    config: HttpBackendConfig,
}

impl HttpBackend {
    pub fn new(mut config: HttpBackendConfig) -> Result<Self, BackendError> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| BackendError::Network(format!("failed to build HTTP client: {e}")))?;
        config.base_url = config.base_url.trim_end_matches('/').to_string();
        Ok(Self { client, config })
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    fn post(&self, path: &str) -> RequestBuilder {
        let mut req = self
            .client
            .post(format!("{}{path}", self.config.base_url))
            .header("content-type", "application/json");
        if let Some(key) = &self.config.api_key {
            req = req.bearer_auth(key.expose_secret());
        }
        req
    }

    async fn send(&self, req: RequestBuilder, timeout: Option<Duration>) -> Result<Response, BackendError> {
        let req = match timeout {
            Some(t) => req.timeout(t),
            None => req,
        };
        let resp = req.send().await.map_err(|e| self.classify(e))?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(BackendError::from_status(status, body));
        }
        Ok(resp)
    }

    async fn send_json<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, BackendError> {
        let resp = self.send(req, Some(self.config.timeout)).await?;
        let bytes = resp.bytes().await.map_err(|e| self.classify(e))?;
        serde_json::from_slice(&bytes).map_err(|e| BackendError::InvalidResponse(e.to_string()))
    }

    fn classify(&self, e: reqwest::Error) -> BackendError {
        if e.is_timeout() {
            BackendError::Timeout(self.config.timeout)
        } else {
            BackendError::Network(e.to_string())
        }
    }
}

#[async_trait]
impl ReasoningBackend for HttpBackend {
    #[instrument(skip_all, fields(agent = %request.agent, log_len = request.log.len()))]
    async fn chat(&self, request: &BackendRequest) -> Result<BackendResponse, BackendError> {
        self.send_json(self.post("/chat").json(request)).await
    }

    #[instrument(skip_all, fields(agent = %request.agent, log_len = request.log.len()))]
    async fn chat_stream(
        &self,
        request: &BackendRequest,
    ) -> Result<BackendEventStream, BackendError> {
        let req = self
            .post("/chat/stream")
            .header("accept", "text/event-stream")
            .json(request);
        // No whole-request timeout: a stream may legitimately run long. The
        // idle timeout bounds silence instead.
        let resp = self.send(req, None).await?;
        Ok(Box::pin(SseStream::new(
            resp.bytes_stream(),
            self.config.idle_timeout,
        )))
    }

    #[instrument(skip_all, fields(log_len = request.log.len()))]
    async fn close(&self, request: &CloseRequest) -> Result<CloseResponse, BackendError> {
        self.send_json(self.post("/close").json(request)).await
    }
}

type ByteStream = Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>;

/// Turns an SSE byte stream into [`BackendStreamEvent`]s.
///
/// Ends after the first terminal event. If the bytes run out first, or
/// nothing arrives within the idle timeout, yields one `Failed` and ends.
pub(crate) struct SseStream {
    inner: ByteStream,
    /// Raw bytes of the frame in progress. Decoded only once a frame is
    /// complete so multi-byte characters split across chunks survive.
    buffer: Vec<u8>,
    pending: VecDeque<BackendStreamEvent>,
    idle_deadline: Pin<Box<tokio::time::Sleep>>,
    idle_duration: Duration,
    finished: bool,
}

impl SseStream {
    pub(crate) fn new(
        byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            buffer: Vec::new(),
            pending: VecDeque::new(),
            idle_deadline: Box::pin(tokio::time::sleep(idle_timeout)),
            idle_duration: idle_timeout,
            finished: false,
        }
    }

    fn push_bytes(&mut self, bytes: &[u8]) {
        // `\r` never occurs inside a multi-byte sequence.
        self.buffer.extend(bytes.iter().copied().filter(|&b| b != b'\r'));
        while let Some(pos) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let frame: Vec<u8> = self.buffer.drain(..pos + 2).collect();
            self.push_frames(&String::from_utf8_lossy(&frame));
        }
    }

    fn push_frames(&mut self, chunk: &str) {
        for (event_type, data) in sse::parse_sse_lines(chunk) {
            self.pending.extend(sse::parse_event(&event_type, &data));
        }
    }

    fn next_pending(&mut self) -> Option<BackendStreamEvent> {
        let event = self.pending.pop_front()?;
        if event.is_terminal() {
            self.finished = true;
            self.pending.clear();
        }
        Some(event)
    }

    fn fail(&mut self, error: BackendError) -> Poll<Option<BackendStreamEvent>> {
        warn!(error = %error, "backend stream failed");
        self.finished = true;
        Poll::Ready(Some(BackendStreamEvent::Failed(error)))
    }
}

impl Stream for SseStream {
    type Item = BackendStreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        if let Some(event) = self.next_pending() {
            return Poll::Ready(Some(event));
        }

        loop {
            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    let deadline = tokio::time::Instant::now() + self.idle_duration;
                    self.idle_deadline.as_mut().reset(deadline);

                    self.push_bytes(&bytes);

                    if let Some(event) = self.next_pending() {
                        return Poll::Ready(Some(event));
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    return self.fail(BackendError::StreamInterrupted(e.to_string()));
                }
                Poll::Ready(None) => {
                    if !self.buffer.is_empty() {
                        let remaining = std::mem::take(&mut self.buffer);
                        self.push_frames(&String::from_utf8_lossy(&remaining));
                    }
                    if let Some(event) = self.next_pending() {
                        return Poll::Ready(Some(event));
                    }
                    return self.fail(BackendError::StreamIncomplete);
                }
                Poll::Pending => {
                    if self.idle_deadline.as_mut().poll(cx).is_ready() {
                        let secs = self.idle_duration.as_secs();
                        return self.fail(BackendError::StreamInterrupted(format!(
                            "idle timeout after {secs}s"
                        )));
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use lumen_core::stream::StreamingEvent;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> BackendRequest {
        BackendRequest {
            log: vec![],
            user_message: Some("Testing".into()),
            completed_tool_calls: vec![],
            agent: "MultiToolAgent".into(),
            agent_args: json!({"goal": "Testing"}),
        }
    }

    fn backend(server: &MockServer) -> HttpBackend {
        let mut config = HttpBackendConfig::new(format!("{}/", server.uri()));
        config.api_key = Some(SecretString::from("test-key"));
        config.timeout = Duration::from_secs(5);
        config.idle_timeout = Duration::from_secs(5);
        HttpBackend::new(config).unwrap()
    }

    fn byte_stream(chunks: Vec<&'static str>) -> impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send {
        futures::stream::iter(chunks.into_iter().map(|c| Ok(bytes::Bytes::from(c))))
    }

    #[tokio::test]
    async fn chat_posts_request_with_bearer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat"))
            .and(header("authorization", "Bearer test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "logDiff": [],
                "completed_tool_calls": [],
                "pending_tool_calls": [
                    {"id": "t1", "type": "function", "function": {"name": "UserInputTool", "arguments": {}}}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let resp = backend(&server).chat(&request()).await.unwrap();
        assert_eq!(resp.pending_tool_calls.len(), 1);
        assert_eq!(resp.pending_tool_calls[0].name(), "UserInputTool");
    }

    #[tokio::test]
    async fn error_status_with_message_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat"))
            .respond_with(
                ResponseTemplate::new(404).set_body_json(json!({"error": "NonExistentAgent not found"})),
            )
            .mount(&server)
            .await;

        let err = backend(&server).chat(&request()).await.unwrap_err();
        assert!(matches!(err, BackendError::Reported(ref m) if m.contains("not found")));
    }

    #[tokio::test]
    async fn plain_error_status_is_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let err = backend(&server).chat(&request()).await.unwrap_err();
        assert!(matches!(err, BackendError::Status { status: 502, .. }));
    }

    #[tokio::test]
    async fn invalid_json_is_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/close"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let err = backend(&server)
            .close(&CloseRequest { log: vec![] })
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn slow_backend_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"logDiff": []}))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let mut config = HttpBackendConfig::new(server.uri());
        config.timeout = Duration::from_millis(50);
        let err = HttpBackend::new(config)
            .unwrap()
            .chat(&request())
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Timeout(_)));
    }

    #[tokio::test]
    async fn chat_stream_yields_events_then_done() {
        let server = MockServer::start().await;
        let body = "event: content\ndata: {\"content\":\"Hel\"}\n\n\
                    event: content\ndata: not-json\n\n\
                    event: content\ndata: {\"content\":\"lo\"}\n\n\
                    event: done\ndata: {\"logDiff\":[],\"pending_tool_calls\":[]}\n\n";
        Mock::given(method("POST"))
            .and(path("/chat/stream"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;

        let events: Vec<_> = backend(&server)
            .chat_stream(&request())
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(events.len(), 3);
        assert!(matches!(
            &events[0],
            BackendStreamEvent::Streaming(StreamingEvent::Content { content }) if content == "Hel"
        ));
        assert!(matches!(events[2], BackendStreamEvent::Done(_)));
    }

    #[tokio::test]
    async fn frames_split_across_chunks() {
        let stream = SseStream::new(
            byte_stream(vec![
                "event: cont",
                "ent\ndata: {\"content\":\"a\"}\n",
                "\nevent: done\r\ndata: {}\r\n\r\n",
            ]),
            Duration::from_secs(5),
        );
        let events: Vec<_> = stream.collect().await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], BackendStreamEvent::Done(_)));
    }

    #[tokio::test]
    async fn multibyte_character_split_across_chunks() {
        let frame = "event: content\ndata: {\"content\":\"café\"}\n\nevent: done\ndata: {}\n\n".as_bytes();
        let split = frame.iter().position(|&b| b == 0xC3).unwrap() + 1;
        let chunks = vec![
            bytes::Bytes::copy_from_slice(&frame[..split]),
            bytes::Bytes::copy_from_slice(&frame[split..]),
        ];
        let stream = SseStream::new(
            futures::stream::iter(chunks.into_iter().map(Ok::<_, reqwest::Error>)),
            Duration::from_secs(5),
        );
        let events: Vec<_> = stream.collect().await;
        assert_eq!(events.len(), 2);
        match &events[0] {
            BackendStreamEvent::Streaming(StreamingEvent::Content { content }) => {
                assert_eq!(content, "café");
            }
            other => panic!("expected content, got {other:?}"),
        }
        assert!(matches!(events[1], BackendStreamEvent::Done(_)));
    }

    #[tokio::test]
    async fn stream_without_done_fails_incomplete() {
        let stream = SseStream::new(
            byte_stream(vec!["event: content\ndata: {\"content\":\"a\"}\n\n"]),
            Duration::from_secs(5),
        );
        let events: Vec<_> = stream.collect().await;
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[1],
            BackendStreamEvent::Failed(BackendError::StreamIncomplete)
        ));
    }

    #[tokio::test]
    async fn events_after_terminal_are_discarded() {
        let stream = SseStream::new(
            byte_stream(vec![
                "event: error\ndata: {\"error\":\"boom\"}\n\nevent: done\ndata: {}\n\n",
            ]),
            Duration::from_secs(5),
        );
        let events: Vec<_> = stream.collect().await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], BackendStreamEvent::Failed(BackendError::Reported(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_stream_times_out() {
        let stream = SseStream::new(futures::stream::pending(), Duration::from_secs(90));
        let events: Vec<_> = stream.collect().await;
        assert_eq!(events.len(), 1);
        match &events[0] {
            BackendStreamEvent::Failed(BackendError::StreamInterrupted(msg)) => {
                assert!(msg.contains("idle timeout"));
            }
            other => panic!("expected idle timeout, got {other:?}"),
        }
    }
}
