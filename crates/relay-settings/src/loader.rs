//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`RelaySettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `RELAY_*` environment overrides
//! 4. Validate cross-field constraints
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::{OverflowPolicy, RelaySettings};

/// Resolve the default settings path (`~/.relay/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".relay").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<RelaySettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or a value that fails
/// validation is an error.
pub fn load_settings_from_path(path: &Path) -> Result<RelaySettings> {
    let mut settings = read_settings_file(path)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Read and merge the settings file without touching the environment.
pub fn read_settings_file(path: &Path) -> Result<RelaySettings> {
    let defaults = serde_json::to_value(RelaySettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment variable overrides to loaded settings.
///
/// Invalid values are ignored with a warning and the file/default value stays.
pub fn apply_env_overrides(settings: &mut RelaySettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides from an arbitrary lookup. `apply_env_overrides` passes the
/// process environment; tests pass a map.
pub fn apply_overrides<F>(settings: &mut RelaySettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = read("RELAY_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read("RELAY_PORT").and_then(|v| checked(&v, "RELAY_PORT", parse_port)) {
        settings.server.port = v;
    }
    if let Some(v) = read("RELAY_SERVER_ID") {
        settings.server.server_id = v;
    }

    // ── Session ─────────────────────────────────────────────────────
    if let Some(v) = read("RELAY_READ_TIMEOUT_MS")
        .and_then(|v| checked(&v, "RELAY_READ_TIMEOUT_MS", |s| parse_u64_range(s, 100, 3_600_000)))
    {
        settings.session.read_timeout_ms = v;
    }
    if let Some(v) = read("RELAY_PING_INTERVAL_MS").and_then(|v| {
        checked(&v, "RELAY_PING_INTERVAL_MS", |s| parse_u64_range(s, 50, 3_600_000))
    }) {
        settings.session.ping_interval_ms = v;
    }
    if let Some(v) = read("RELAY_QUEUE_CAPACITY")
        .and_then(|v| checked(&v, "RELAY_QUEUE_CAPACITY", |s| parse_usize_range(s, 1, 1_000_000)))
    {
        settings.session.queue_capacity = v;
    }
    if let Some(v) = read("RELAY_OVERFLOW_POLICY").and_then(|v| {
        checked(&v, "RELAY_OVERFLOW_POLICY", |s| s.parse::<OverflowPolicy>().ok())
    }) {
        settings.session.overflow_policy = v;
    }

    // ── Cluster ─────────────────────────────────────────────────────
    if let Some(v) = read("RELAY_CALL_TIMEOUT_MS")
        .and_then(|v| checked(&v, "RELAY_CALL_TIMEOUT_MS", |s| parse_u64_range(s, 1, 600_000)))
    {
        settings.cluster.call_timeout_ms = v;
    }
    if let Some(v) = read("RELAY_REDIS_URL") {
        settings.cluster.redis_url = Some(v);
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = read("RELAY_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read("RELAY_LOG_JSON").and_then(|v| checked(&v, "RELAY_LOG_JSON", parse_bool))
    {
        settings.logging.json = v;
    }
}

fn checked<T>(val: &str, key: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
    let result = parse(val);
    if result.is_none() {
        tracing::warn!(key, value = %val, "invalid env var, ignoring");
    }
    result
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a TCP port. `0` is allowed (auto-assign).
pub fn parse_port(val: &str) -> Option<u16> {
    val.parse().ok()
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
