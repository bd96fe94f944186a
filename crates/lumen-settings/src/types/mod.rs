//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]`. Each type implements
//! [`Default`] with production values, and `#[serde(default)]` lets a settings
//! file name only the fields it changes.

mod backend;
mod server;
mod storage;

pub use backend::*;
pub use server::*;
pub use storage::*;

use serde::{Deserialize, Serialize};

/// Root settings type.
///
/// ```json
/// {
///   "server": { "port": 9300 },
///   "backend": { "baseUrl": "http://reasoning:8001" }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LumenSettings {
    /// HTTP surface.
    pub server: ServerSettings,
    /// Reasoning backend connection.
    pub backend: BackendSettings,
    /// Conversation store.
    pub database: DatabaseSettings,
    pub logging: LoggingSettings,
}

/// Expand a leading `~/` against `$HOME`.
pub fn expand_home(path: &str) -> std::path::PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            std::path::PathBuf::from(home).join(rest)
        }
        None => std::path::PathBuf::from(path),
    }
}
