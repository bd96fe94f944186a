//! Shared types for the lumen chat orchestration engine: branded ids,
//! tool calls and payloads, the conversation log, wire protocols, and the
//! tool capability contract.

pub mod errors;
pub mod ids;
pub mod log;
pub mod protocol;
pub mod stream;
pub mod tool_call;
pub mod tools;
pub mod user;
