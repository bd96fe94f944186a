//! Tool execution and the chat turn loop.
//!
//! [`ToolRegistry`] holds the server-side tools, [`Orchestrator`] runs the
//! subset of a backend turn's pending calls that it knows, and [`TurnDriver`]
//! alternates between the reasoning backend and the orchestrator until the
//! backend is done or the browser has to act.

pub mod driver;
pub mod error;
pub mod orchestrator;
pub mod registry;
pub mod tools;

pub use driver::{ChatEventSink, TurnDriver, TurnStatus};
pub use error::EngineError;
pub use orchestrator::{NoopObserver, OrchestrationResult, Orchestrator, OrchestratorObserver};
pub use registry::{InvokeError, ToolRegistry};
