use lumen_core::errors::BackendError;
use lumen_store::StoreError;

/// Failures that abort a turn. Tool failures never reach this type; the
/// orchestrator turns them into result payloads.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("turn exceeded {0} backend iterations")]
    IterationLimit(usize),
}

impl EngineError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Backend(e) => e.error_kind(),
            Self::Store(_) => "store",
            Self::IterationLimit(_) => "iteration_limit",
        }
    }
}
