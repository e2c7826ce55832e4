//! Settings type definitions.
//!
//! Field names are camelCase on disk. Every section is `#[serde(default)]`
//! so a partial `settings.json` fills the rest from compiled defaults.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};
use crate::loader::parse_level;

/// Root settings for the loom engine and CLI.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct LoomSettings {
    pub stream: StreamSettings,
    pub store: StoreSettings,
    pub transport: TransportSettings,
    pub telemetry: TelemetrySettings,
}

impl LoomSettings {
    /// Reject values that parse but make no sense at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.stream.inactivity_timeout_secs == 0 {
            return Err(SettingsError::InvalidValue(
                "stream.inactivityTimeoutSecs must be > 0".into(),
            ));
        }
        if self.stream.max_thinking_nodes == 0 {
            return Err(SettingsError::InvalidValue(
                "stream.maxThinkingNodes must be > 0".into(),
            ));
        }
        if self.stream.max_content_bytes == 0 {
            return Err(SettingsError::InvalidValue(
                "stream.maxContentBytes must be > 0".into(),
            ));
        }
        if self.transport.connect_timeout_secs == 0 {
            return Err(SettingsError::InvalidValue(
                "transport.connectTimeoutSecs must be > 0".into(),
            ));
        }
        for (target, level) in &self.telemetry.module_levels {
            if target.trim().is_empty() || parse_level(level).is_none() {
                return Err(SettingsError::InvalidValue(format!(
                    "telemetry.moduleLevels: invalid entry {target:?} = {level:?}"
                )));
            }
        }
        Ok(())
    }
}

/// Per-stream limits applied by the session coordinator.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamSettings {
    /// Seconds without any element before the stream is failed.
    pub inactivity_timeout_secs: u64,
    pub max_thinking_nodes: usize,
    pub max_content_bytes: usize,
}

impl StreamSettings {
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            inactivity_timeout_secs: 60,
            max_thinking_nodes: 10_000,
            max_content_bytes: 4 * 1024 * 1024,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    pub db_path: PathBuf,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            db_path: loom_home().join("database").join("loom.db"),
        }
    }
}

/// Live element source settings.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TransportSettings {
    /// Answer endpoint; `None` until configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub connect_timeout_secs: u64,
}

impl TransportSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            connect_timeout_secs: 30,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TelemetrySettings {
    /// One of trace, debug, info, warn, error.
    pub log_level: String,
    /// Per-target overrides, e.g. `{"loom_transport": "debug"}`.
    pub module_levels: BTreeMap<String, String>,
    pub log_to_sqlite: bool,
    pub log_db_path: PathBuf,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            module_levels: BTreeMap::new(),
            log_to_sqlite: true,
            log_db_path: loom_home().join("database").join("logs.db"),
        }
    }
}

/// `~/.loom`, or `/tmp/.loom` when HOME is unset.
pub fn loom_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".loom")
}
