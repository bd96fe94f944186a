//! Database and logging settings.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseSettings {
    /// SQLite file holding conversations, logs and usage. `~/` is expanded.
    pub path: String,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: "~/.lumen/lumen.db".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive; `RUST_LOG` wins when set.
    pub level: String,
    /// JSON lines on stdout instead of human-readable output.
    pub json: bool,
    /// Persist WARN and above to `log_db_path`.
    pub persist_warnings: bool,
    pub log_db_path: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
            persist_warnings: true,
            log_db_path: "~/.lumen/logs.db".to_string(),
        }
    }
}
