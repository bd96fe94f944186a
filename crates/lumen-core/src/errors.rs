use std::time::Duration;

/// Failures talking to the external reasoning backend.
///
/// Every variant aborts the current turn. Nothing is retried.
#[derive(Clone, Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("backend error: {0}")]
    Reported(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("backend timeout after {0:?}")]
    Timeout(Duration),
    #[error("invalid backend response: {0}")]
    InvalidResponse(String),
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),
    #[error("stream ended without a done event")]
    StreamIncomplete,
}

impl BackendError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Status { .. } => "status",
            Self::Reported(_) => "reported",
            Self::Network(_) => "network",
            Self::Timeout(_) => "timeout",
            Self::InvalidResponse(_) => "invalid_response",
            Self::StreamInterrupted(_) => "stream_interrupted",
            Self::StreamIncomplete => "stream_incomplete",
        }
    }

    /// Classify a non-success HTTP status.
    ///
    /// A JSON body carrying an `error` string is unwrapped so callers see the
    /// backend's own message (e.g. "agent Foo not found").
    pub fn from_status(status: u16, body: String) -> Self {
        let reported = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_owned));
        match reported {
            Some(message) => Self::Reported(message),
            None => Self::Status { status, body },
        }
    }
}

/// Failure raised by a tool handler. Converted into a failed-result payload
/// by the orchestrator; never aborts a turn.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
}
