//! Settings loading: defaults, deep-merged file, environment overrides.

use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::errors::{Result, SettingsError};
use crate::types::{keel_home, KeelSettings};

/// Default settings file location: `~/.keel/settings.json`.
pub fn settings_path() -> PathBuf {
    keel_home().join("settings.json")
}

/// Load settings from the default path. A missing file yields defaults.
pub fn load_settings() -> Result<KeelSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from `path`, deep-merged over defaults, then apply `KEEL_*`
/// environment overrides and validate.
pub fn load_settings_from_path(path: &Path) -> Result<KeelSettings> {
    let mut merged = serde_json::to_value(KeelSettings::default())?;

    match std::fs::read_to_string(path) {
        Ok(raw) => {
            let overlay: Value = serde_json::from_str(&raw).map_err(|source| SettingsError::Parse {
                path: path.to_owned(),
                source,
            })?;
            deep_merge(&mut merged, overlay);
            tracing::debug!(path = %path.display(), "settings file merged");
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no settings file, using defaults");
        }
        Err(source) => {
            return Err(SettingsError::Read {
                path: path.to_owned(),
                source,
            });
        }
    }

    let mut settings: KeelSettings =
        serde_json::from_value(merged).map_err(|source| SettingsError::Parse {
            path: path.to_owned(),
            source,
        })?;
    apply_env_overrides(&mut settings, |var| std::env::var(var).ok())?;
    settings.validate();
    Ok(settings)
}

/// Recursively merge `overlay` into `base`. Objects merge key by key; any
/// other value in `overlay` replaces the one in `base`. Explicit `null`
/// leaves the base value alone.
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        if !value.is_null() {
                            let _ = base_map.insert(key, value);
                        }
                    }
                }
            }
        }
        (_, Value::Null) => {}
        (base, overlay) => *base = overlay,
    }
}

/// Apply `KEEL_*` overrides using `lookup` to read variables.
pub fn apply_env_overrides<F>(settings: &mut KeelSettings, lookup: F) -> Result<()>
where
    F: Fn(&'static str) -> Option<String>,
{
    if let Some(url) = lookup("KEEL_DATABASE_URL") {
        settings.database.url = url;
    }
    if let Some(url) = lookup("KEEL_REDIS_URL") {
        settings.cache.url = if url.is_empty() { None } else { Some(url) };
    }
    if let Some(raw) = lookup("KEEL_CACHE_REQUIRED") {
        settings.cache.required = parse_bool("KEEL_CACHE_REQUIRED", &raw)?;
    }
    if let Some(level) = lookup("KEEL_LOG_LEVEL") {
        settings.logging.level = level;
    }
    if let Some(raw) = lookup("KEEL_LOG_JSON") {
        settings.logging.json = parse_bool("KEEL_LOG_JSON", &raw)?;
    }
    if let Some(raw) = lookup("KEEL_LOCK_TIMEOUT_MS") {
        settings.lock.timeout_ms = raw.parse().map_err(|_| SettingsError::InvalidEnv {
            var: "KEEL_LOCK_TIMEOUT_MS",
            value: raw.clone(),
        })?;
    }
    Ok(())
}

fn parse_bool(var: &'static str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(SettingsError::InvalidEnv {
            var,
            value: raw.to_string(),
        }),
    }
}
