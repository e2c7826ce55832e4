//! # loom-settings
//!
//! Layered configuration for the loom engine and CLI.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults** ([`LoomSettings::default()`])
//! 2. **User file** `~/.loom/settings.json`, deep-merged over defaults
//! 3. **Environment variables** `LOOM_*` overrides

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, parse_level, settings_path};
pub use types::*;
