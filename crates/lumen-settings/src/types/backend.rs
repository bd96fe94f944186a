use std::fmt;

use serde::{Deserialize, Serialize};

/// Reasoning backend connection settings.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackendSettings {
    pub base_url: String,
    /// Whole-request timeout for non-streaming calls.
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Maximum gap between bytes on a streaming response.
    pub idle_timeout_secs: u64,
    /// Bearer token. Never written back out.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8001".to_string(),
            timeout_secs: 300,
            connect_timeout_secs: 30,
            idle_timeout_secs: 90,
            api_key: None,
        }
    }
}

impl fmt::Debug for BackendSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendSettings")
            .field("base_url", &self.base_url)
            .field("timeout_secs", &self.timeout_secs)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("idle_timeout_secs", &self.idle_timeout_secs)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_api_key() {
        let settings = BackendSettings {
            api_key: Some("sk-live-123".into()),
            ..Default::default()
        };
        let rendered = format!("{settings:?}");
        assert!(!rendered.contains("sk-live-123"));
        assert!(rendered.contains("REDACTED"));
    }

    #[test]
    fn api_key_is_read_from_json() {
        let settings: BackendSettings = serde_json::from_str(r#"{"apiKey": "k"}"#).unwrap();
        assert_eq!(settings.api_key.as_deref(), Some("k"));
    }
}
