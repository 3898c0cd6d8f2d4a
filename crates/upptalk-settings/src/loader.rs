//! Layered settings loading.
//!
//! Compiled defaults, then an optional JSON file merged over them, then
//! `UPPTALK_*` environment variables. The result is validated before it is
//! returned.

use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::ClientSettings;

/// Env var naming an optional settings file.
pub const SETTINGS_PATH_ENV: &str = "UPPTALK_SETTINGS";

const PORTS: RangeInclusive<u16> = 1..=u16::MAX;
const PING_INTERVALS_MS: RangeInclusive<u64> = 100..=3_600_000;
const PONG_TIMEOUTS_MS: RangeInclusive<u64> = 100..=600_000;
const HTTP_TIMEOUTS_MS: RangeInclusive<u64> = 1_000..=3_600_000;

/// Load settings, reading the file named by `$UPPTALK_SETTINGS` when set.
pub fn load_settings() -> Result<ClientSettings> {
    match env_text(SETTINGS_PATH_ENV) {
        Some(path) => load_settings_from_path(&PathBuf::from(path)),
        None => finish(ClientSettings::default()),
    }
}

/// Load settings from `path`. A missing file means defaults; an unreadable
/// or malformed one is an error.
pub fn load_settings_from_path(path: &Path) -> Result<ClientSettings> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(?path, "no settings file, using defaults");
            return finish(ClientSettings::default());
        }
        Err(source) => {
            return Err(SettingsError::Read {
                path: path.to_owned(),
                source,
            });
        }
    };

    debug!(?path, "merging settings file");
    let overlay: Value = serde_json::from_str(&text)?;
    let merged = deep_merge(serde_json::to_value(ClientSettings::default())?, overlay);
    finish(serde_json::from_value(merged)?)
}

fn finish(mut settings: ClientSettings) -> Result<ClientSettings> {
    apply_env_overrides(&mut settings);
    validate(&settings)?;
    Ok(settings)
}

/// Merge `source` into `target`. Objects merge key by key, `null` leaves the
/// target untouched, anything else replaces it.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut base), Value::Object(overlay)) => {
            for (key, value) in overlay.into_iter().filter(|(_, v)| !v.is_null()) {
                let merged = match base.remove(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                let _ = base.insert(key, merged);
            }
            Value::Object(base)
        }
        (_, source) => source,
    }
}

/// Overlay `UPPTALK_*` environment variables. Unparseable or out-of-range
/// values are logged and skipped.
pub fn apply_env_overrides(settings: &mut ClientSettings) {
    let server = &mut settings.server;
    if let Some(host) = env_text("UPPTALK_HOST") {
        server.host = host;
    }
    if let Some(port) = env_parsed("UPPTALK_PORT", &PORTS) {
        server.port = port;
    }
    if let Some(secure) = env_flag("UPPTALK_SECURE") {
        server.secure = secure;
    }
    if let Some(path) = env_text("UPPTALK_PATH") {
        server.path = path;
    }
    if let Some(apikey) = env_text("UPPTALK_APIKEY") {
        server.apikey = Some(apikey);
    }

    let keepalive = &mut settings.keepalive;
    if let Some(enabled) = env_flag("UPPTALK_KEEPALIVE") {
        keepalive.enabled = enabled;
    }
    if let Some(ms) = env_parsed("UPPTALK_PING_INTERVAL_MS", &PING_INTERVALS_MS) {
        keepalive.ping_interval_ms = ms;
    }
    if let Some(ms) = env_parsed("UPPTALK_PONG_TIMEOUT_MS", &PONG_TIMEOUTS_MS) {
        keepalive.pong_timeout_ms = ms;
    }

    if let Some(ms) = env_parsed("UPPTALK_HTTP_TIMEOUT_MS", &HTTP_TIMEOUTS_MS) {
        settings.http.timeout_ms = ms;
    }
}

fn validate(settings: &ClientSettings) -> Result<()> {
    let invalid = |field: &'static str, reason: &'static str| -> Result<()> {
        Err(SettingsError::Invalid { field, reason })
    };
    if settings.server.host.trim().is_empty() {
        return invalid("server.host", "must not be empty");
    }
    if settings.server.port == 0 {
        return invalid("server.port", "must be non-zero");
    }
    if settings.keepalive.enabled {
        if settings.keepalive.ping_interval_ms == 0 {
            return invalid("keepalive.pingIntervalMs", "must be non-zero");
        }
        if settings.keepalive.pong_timeout_ms == 0 {
            return invalid("keepalive.pongTimeoutMs", "must be non-zero");
        }
    }
    Ok(())
}

// ── Value parsing ───────────────────────────────────────────────────

fn parse_flag(text: &str) -> Option<bool> {
    match text.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_in<T: FromStr + PartialOrd>(text: &str, range: &RangeInclusive<T>) -> Option<T> {
    text.trim()
        .parse()
        .ok()
        .filter(|value| range.contains(value))
}

fn env_text(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_flag(name: &str) -> Option<bool> {
    let raw = env_text(name)?;
    let flag = parse_flag(&raw);
    if flag.is_none() {
        warn!(key = name, value = %raw, "ignoring non-boolean env var");
    }
    flag
}

fn env_parsed<T: FromStr + PartialOrd>(name: &str, range: &RangeInclusive<T>) -> Option<T> {
    let raw = env_text(name)?;
    let value = parse_in(&raw, range);
    if value.is_none() {
        warn!(key = name, value = %raw, "ignoring out-of-range env var");
    }
    value
}
