//! Settings type definitions.
//!
//! Field names are camelCase on the wire. Every section implements [`Default`]
//! and is marked `#[serde(default)]`, so partial JSON fills in the rest.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sidecar_core::Addon;

/// Root settings type.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SidecarSettings {
    /// Configured add-ons, in display order.
    pub addons: Vec<Addon>,
    pub dispatch: DispatchSettings,
    pub llm: LlmSettings,
    pub storage: StorageSettings,
    pub logging: LoggingSettings,
}

/// Dispatch engine tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DispatchSettings {
    /// Quiet period before the host save callback runs.
    pub persist_debounce_ms: u64,
    /// Marker placed between prompts of a batch group.
    pub batch_separator: String,
    /// Preceding turns included in prompt context when an add-on does not say.
    pub context_turns: usize,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            persist_debounce_ms: 1_000,
            batch_separator: "<<<SIDECAR_SPLIT>>>".to_string(),
            context_turns: 4,
        }
    }
}

/// Model invocation settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LlmSettings {
    /// Provider name to OpenAI-compatible base URL.
    pub endpoints: BTreeMap<String, String>,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    pub request_timeout_ms: u64,
    pub max_tokens: u32,
}

impl Default for LlmSettings {
    fn default() -> Self {
        let mut endpoints = BTreeMap::new();
        endpoints.insert("openai".to_string(), "https://api.openai.com/v1".to_string());
        endpoints.insert("openrouter".to_string(), "https://openrouter.ai/api/v1".to_string());
        endpoints.insert("ollama".to_string(), "http://localhost:11434/v1".to_string());
        Self {
            endpoints,
            api_key_env: "SIDECAR_API_KEY".to_string(),
            request_timeout_ms: 60_000,
            max_tokens: 1_024,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageSettings {
    /// SQLite file for stored results. Relative paths resolve under `~/.sidecar`.
    pub database_path: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            database_path: "results.db".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_fills_defaults() {
        let json = serde_json::json!({"dispatch": {"contextTurns": 8}});
        let settings: SidecarSettings = serde_json::from_value(json).unwrap();
        assert_eq!(settings.dispatch.context_turns, 8);
        assert_eq!(settings.dispatch.persist_debounce_ms, 1_000);
        assert_eq!(settings.logging.level, "info");
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(SidecarSettings::default()).unwrap();
        assert!(json["dispatch"].get("batchSeparator").is_some());
        assert!(json["llm"].get("requestTimeoutMs").is_some());
        assert!(json["storage"].get("databasePath").is_some());
    }
}
