//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`LoomSettings::default()`]
//! 2. If `~/.loom/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `LOOM_*` environment overrides (highest priority)
//! 4. Validate

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::{loom_home, LoomSettings};

/// `~/.loom/settings.json`.
pub fn settings_path() -> PathBuf {
    loom_home().join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<LoomSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from `path` with env var overrides.
///
/// A missing file yields defaults. Invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<LoomSettings> {
    load_with_env(path, |name| std::env::var(name).ok())
}

/// Same as [`load_settings_from_path`] with a caller-supplied env lookup.
pub fn load_with_env<F>(path: &Path, env: F) -> Result<LoomSettings>
where
    F: Fn(&str) -> Option<String>,
{
    let defaults = serde_json::to_value(LoomSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: LoomSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings, env);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
///
/// Objects merge per key; arrays and scalars are replaced by `source`;
/// nulls in `source` leave `target` untouched.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `LOOM_*` overrides. Unparseable or out-of-range values are
/// logged and ignored.
pub fn apply_env_overrides<F>(settings: &mut LoomSettings, env: F)
where
    F: Fn(&str) -> Option<String>,
{
    let reader = EnvReader { env };

    if let Some(v) = reader.u64("LOOM_INACTIVITY_TIMEOUT_SECS", 1, 86_400) {
        settings.stream.inactivity_timeout_secs = v;
    }
    if let Some(v) = reader.usize("LOOM_MAX_THINKING_NODES", 1, 1_000_000) {
        settings.stream.max_thinking_nodes = v;
    }
    if let Some(v) = reader.usize("LOOM_MAX_CONTENT_BYTES", 1024, 1 << 30) {
        settings.stream.max_content_bytes = v;
    }

    if let Some(v) = reader.string("LOOM_DB_PATH") {
        settings.store.db_path = PathBuf::from(v);
    }

    if let Some(v) = reader.string("LOOM_ENDPOINT") {
        settings.transport.endpoint = Some(v);
    }
    if let Some(v) = reader.u64("LOOM_CONNECT_TIMEOUT_SECS", 1, 600) {
        settings.transport.connect_timeout_secs = v;
    }

    if let Some(v) = reader.string("LOOM_LOG_LEVEL") {
        match parse_level(&v) {
            Some(level) => settings.telemetry.log_level = level.to_string(),
            None => warn!(key = "LOOM_LOG_LEVEL", value = %v, "invalid log level env var, ignoring"),
        }
    }
    if let Some(v) = reader.string("LOOM_LOG_MODULES") {
        match parse_module_levels(&v) {
            Some(levels) => settings.telemetry.module_levels = levels,
            None => warn!(key = "LOOM_LOG_MODULES", value = %v, "invalid module levels env var, ignoring"),
        }
    }
    if let Some(v) = reader.bool("LOOM_LOG_TO_SQLITE") {
        settings.telemetry.log_to_sqlite = v;
    }
    if let Some(v) = reader.string("LOOM_LOG_DB") {
        settings.telemetry.log_db_path = PathBuf::from(v);
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Accepts (case-insensitive) `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Normalizes a tracing level name.
pub fn parse_level(val: &str) -> Option<&'static str> {
    match val.to_lowercase().as_str() {
        "trace" => Some("trace"),
        "debug" => Some("debug"),
        "info" => Some("info"),
        "warn" | "warning" => Some("warn"),
        "error" => Some("error"),
        _ => None,
    }
}

/// `target=level` pairs separated by commas. Any bad pair rejects the whole value.
pub fn parse_module_levels(val: &str) -> Option<BTreeMap<String, String>> {
    val.split(',')
        .filter(|pair| !pair.trim().is_empty())
        .map(|pair| {
            let (target, level) = pair.split_once('=')?;
            let target = target.trim();
            if target.is_empty() {
                return None;
            }
            Some((target.to_string(), parse_level(level.trim())?.to_string()))
        })
        .collect()
}

// ── Env readers ─────────────────────────────────────────────────────────────

struct EnvReader<F> {
    env: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.env)(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = (self.env)(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.env)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid u64 env var, ignoring");
        }
        result
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        let val = (self.env)(name)?;
        let result = parse_usize_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid usize env var, ignoring");
        }
        result
    }
}
