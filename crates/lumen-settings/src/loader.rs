//! Layered settings loading.
//!
//! 1. Compiled [`LumenSettings::default()`]
//! 2. The settings file, deep-merged over the defaults (missing file is fine)
//! 3. `LUMEN_*` environment overrides
//!
//! Merge rules: objects merge per key, arrays and primitives are replaced,
//! nulls in the file are skipped.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::LumenSettings;

/// Default settings file location (`~/.lumen/settings.json`).
pub fn settings_path() -> PathBuf {
    crate::types::expand_home("~/.lumen/settings.json")
}

/// Load from the default path with env overrides.
pub fn load_settings() -> Result<LumenSettings> {
    load_settings_from_path(&settings_path())
}

/// Load from `path` with env overrides. A missing file yields defaults; a
/// malformed one is an error.
pub fn load_settings_from_path(path: &Path) -> Result<LumenSettings> {
    let mut settings = load_file_layer(path)?;
    apply_overrides(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

fn load_file_layer(path: &Path) -> Result<LumenSettings> {
    let defaults = serde_json::to_value(LumenSettings::default())?;
    if !path.exists() {
        debug!(?path, "no settings file, using defaults");
        return Ok(serde_json::from_value(defaults)?);
    }
    debug!(?path, "loading settings file");
    let raw = std::fs::read_to_string(path)?;
    let file: Value = serde_json::from_str(&raw)?;
    Ok(serde_json::from_value(deep_merge(defaults, file))?)
}

/// Recursive deep merge of `source` over `target`.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut merged), Value::Object(source)) => {
            for (key, value) in source.into_iter().filter(|(_, v)| !v.is_null()) {
                let next = match merged.remove(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                merged.insert(key, next);
            }
            Value::Object(merged)
        }
        (_, source) => source,
    }
}

/// Apply `LUMEN_*` overrides using `lookup` to read variables.
///
/// Empty values are treated as unset. Values that fail to parse are ignored
/// with a warning and the file/default value stays in place.
pub fn apply_overrides(settings: &mut LumenSettings, lookup: impl Fn(&str) -> Option<String>) {
    let read = |key: &str| lookup(key).filter(|v| !v.is_empty());

    if let Some(v) = read("LUMEN_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read("LUMEN_PORT") {
        match parse_port(&v) {
            Some(port) => settings.server.port = port,
            None => warn!(key = "LUMEN_PORT", value = %v, "invalid port env var, ignoring"),
        }
    }
    if let Some(v) = read("LUMEN_BACKEND_URL") {
        settings.backend.base_url = v.trim_end_matches('/').to_string();
    }
    if let Some(v) = read("LUMEN_BACKEND_API_KEY") {
        settings.backend.api_key = Some(v);
    }
    if let Some(v) = read("LUMEN_BACKEND_TIMEOUT_SECS") {
        match parse_u64_range(&v, 1, 3600) {
            Some(secs) => settings.backend.timeout_secs = secs,
            None => warn!(
                key = "LUMEN_BACKEND_TIMEOUT_SECS",
                value = %v,
                "invalid timeout env var, ignoring"
            ),
        }
    }
    if let Some(v) = read("LUMEN_DB_PATH") {
        settings.database.path = v;
    }
    if let Some(v) = read("LUMEN_LOG_LEVEL") {
        settings.logging.level = v;
    }
}

/// Parse a TCP port. Zero is accepted (bind to any free port).
pub fn parse_port(val: &str) -> Option<u16> {
    val.trim().parse().ok()
}

/// Parse a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}
