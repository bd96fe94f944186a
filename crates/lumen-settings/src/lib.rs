//! # lumen-settings
//!
//! Layered configuration: compiled defaults, a JSON settings file
//! (`~/.lumen/settings.json` unless another path is given) deep-merged over
//! them, then `LUMEN_*` environment overrides.
//!
//! ```no_run
//! use lumen_settings::load_settings;
//!
//! let settings = load_settings().unwrap_or_default();
//! println!("listening on {}:{}", settings.server.host, settings.server.port);
//! ```

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{apply_overrides, deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
