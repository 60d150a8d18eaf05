//! Reads `settings.json` over the compiled defaults, then applies `SIDECAR_*`
//! environment overrides.
//!
//! The file is merged into the defaults key by key. Nested objects merge, any
//! other value (arrays included) replaces the default, and `null` keeps it.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::SidecarSettings;

/// `~/.sidecar`, or `/tmp/.sidecar` without a home directory.
pub fn sidecar_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map_or_else(|| PathBuf::from("/tmp"), PathBuf::from)
        .join(".sidecar")
}

pub fn settings_path() -> PathBuf {
    sidecar_dir().join("settings.json")
}

pub fn load_settings() -> Result<SidecarSettings> {
    load_settings_from_path(&settings_path())
}

/// A missing file means defaults. Malformed JSON and invalid add-on lists are errors.
pub fn load_settings_from_path(path: &Path) -> Result<SidecarSettings> {
    let mut value = serde_json::to_value(SidecarSettings::default())?;
    match std::fs::read_to_string(path) {
        Ok(text) => {
            debug!(path = %path.display(), "merging settings file");
            merge_into(&mut value, serde_json::from_str(&text)?);
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no settings file, using defaults");
        }
        Err(e) => return Err(e.into()),
    }

    let mut settings: SidecarSettings = serde_json::from_value(value)?;
    for var in ENV_OVERRIDES {
        if let Ok(raw) = std::env::var(var.name) {
            apply_override(&mut settings, var, &raw);
        }
    }
    validate(&settings)?;
    Ok(settings)
}

/// Add-on ids must be non-blank and unique.
pub fn validate(settings: &SidecarSettings) -> Result<()> {
    let mut seen = HashSet::with_capacity(settings.addons.len());
    for addon in &settings.addons {
        let id = addon.id.as_str();
        if id.trim().is_empty() {
            return Err(SettingsError::InvalidValue(format!("add-on '{}' has an empty id", addon.name)));
        }
        if !seen.insert(id) {
            return Err(SettingsError::InvalidValue(format!("duplicate add-on id: {id}")));
        }
    }
    Ok(())
}

/// Merge `overlay` into `base` in place.
pub fn merge_into(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (_, Value::Null) => {}
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(slot) => merge_into(slot, value),
                    None if !value.is_null() => {
                        base_map.insert(key, value);
                    }
                    None => {}
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

#[derive(Clone, Copy)]
enum Kind {
    Text,
    Flag,
    Millis { min: u64, max: u64 },
}

struct EnvOverride {
    name: &'static str,
    kind: Kind,
}

const ENV_OVERRIDES: &[EnvOverride] = &[
    EnvOverride { name: "SIDECAR_DB_PATH", kind: Kind::Text },
    EnvOverride { name: "SIDECAR_LOG_LEVEL", kind: Kind::Text },
    EnvOverride { name: "SIDECAR_LOG_JSON", kind: Kind::Flag },
    EnvOverride { name: "SIDECAR_PERSIST_DEBOUNCE_MS", kind: Kind::Millis { min: 0, max: 600_000 } },
    EnvOverride { name: "SIDECAR_LLM_TIMEOUT_MS", kind: Kind::Millis { min: 1_000, max: 3_600_000 } },
];

/// Invalid values are logged and ignored.
fn apply_override(settings: &mut SidecarSettings, var: &EnvOverride, raw: &str) {
    let raw = raw.trim();
    let applied = match var.kind {
        Kind::Text if raw.is_empty() => false,
        Kind::Text => {
            let value = raw.to_string();
            match var.name {
                "SIDECAR_DB_PATH" => settings.storage.database_path = value,
                _ => settings.logging.level = value,
            }
            true
        }
        Kind::Flag => flag(raw).map(|on| settings.logging.json = on).is_some(),
        Kind::Millis { min, max } => millis(raw, min, max)
            .map(|ms| match var.name {
                "SIDECAR_PERSIST_DEBOUNCE_MS" => settings.dispatch.persist_debounce_ms = ms,
                _ => settings.llm.request_timeout_ms = ms,
            })
            .is_some(),
    };
    if !applied && !raw.is_empty() {
        warn!(var = var.name, value = raw, "ignoring invalid environment override");
    }
}

fn flag(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn millis(raw: &str, min: u64, max: u64) -> Option<u64> {
    raw.parse().ok().filter(|ms| (min..=max).contains(ms))
}
