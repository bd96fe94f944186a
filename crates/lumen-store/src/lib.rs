//! SQLite persistence for conversations, their logs, and LLM usage.

pub mod conversations;
pub mod database;
pub mod error;
pub mod row_helpers;
pub mod schema;
pub mod usage;

pub use conversations::{AppendOutcome, ConversationRepo, ConversationRow};
pub use database::Database;
pub use error::StoreError;
pub use usage::{UsageRepo, UsageRow, UsageTotals};
