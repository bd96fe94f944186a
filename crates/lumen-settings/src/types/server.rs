use serde::{Deserialize, Serialize};

/// HTTP surface settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    pub port: u16,
    /// Upper bound on a synchronous chat turn.
    pub request_timeout_secs: u64,
    /// Header carrying the authenticated user id (set by the fronting proxy).
    pub user_header: String,
    /// Header carrying the tenant id.
    pub tenant_header: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9200,
            request_timeout_secs: 600,
            user_header: "x-lumen-user".to_string(),
            tenant_header: "x-lumen-tenant".to_string(),
        }
    }
}
