use serde::{Deserialize, Serialize};

use crate::ids::AddonId;

/// A configured behavior unit that may run a model call for a conversation turn.
///
/// Add-ons are owned by configuration management. The dispatch engine treats
/// them as read-only snapshots for the duration of a cycle.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Addon {
    pub id: AddonId,
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub trigger_mode: TriggerMode,
    #[serde(default)]
    pub trigger_config: Option<TriggerConfig>,
    #[serde(default)]
    pub request_mode: RequestMode,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub response_location: ResponseLocation,
    #[serde(default)]
    pub format_style: FormatStyle,
    /// Prompt template rendered by the engine's prompt assembler.
    #[serde(default)]
    pub prompt: String,
    /// Number of preceding turns included as context. `None` uses the engine default.
    #[serde(default)]
    pub context_turns: Option<usize>,
}

fn default_enabled() -> bool {
    true
}

impl Addon {
    /// Minimal enabled auto add-on, mostly useful for tests and fixtures.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: AddonId::from_raw(id),
            name: name.into(),
            enabled: true,
            trigger_mode: TriggerMode::Auto,
            trigger_config: None,
            request_mode: RequestMode::Standalone,
            provider: String::new(),
            model: String::new(),
            response_location: ResponseLocation::OutsideChatlog,
            format_style: FormatStyle::Markdown,
            prompt: String::new(),
            context_turns: None,
        }
    }

    pub fn with_trigger(mut self, trigger_type: TriggerType, triggers: &[&str]) -> Self {
        self.trigger_mode = TriggerMode::Trigger;
        self.trigger_config = Some(TriggerConfig {
            trigger_type,
            triggers: triggers.iter().map(|t| (*t).to_string()).collect(),
        });
        self
    }

    pub fn with_mode(mut self, mode: TriggerMode) -> Self {
        self.trigger_mode = mode;
        self
    }

    pub fn batched(mut self, provider: &str, model: &str) -> Self {
        self.request_mode = RequestMode::Batch;
        self.provider = provider.to_string();
        self.model = model.to_string();
        self
    }

    pub fn standalone(mut self, provider: &str, model: &str) -> Self {
        self.request_mode = RequestMode::Standalone;
        self.provider = provider.to_string();
        self.model = model.to_string();
        self
    }

    pub fn with_prompt(mut self, prompt: &str) -> Self {
        self.prompt = prompt.to_string();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// When an add-on runs.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// Every AI turn.
    #[default]
    Auto,
    /// The AI turn following a user turn whose text matches a pattern.
    Trigger,
    /// Explicit user action only.
    Manual,
    /// A mode string this build does not know. Classified as `Auto`.
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    #[default]
    Keyword,
    Regex,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TriggerConfig {
    #[serde(default)]
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub triggers: Vec<String>,
}

/// Whether an add-on is sent on its own or combined with others sharing provider and model.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RequestMode {
    #[default]
    Standalone,
    Batch,
}

/// Which rendering sink receives the result.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum ResponseLocation {
    #[default]
    OutsideChatlog,
    ChatHistory,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FormatStyle {
    #[default]
    Markdown,
    Html,
    Plain,
}

impl std::fmt::Display for FormatStyle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Markdown => write!(f, "markdown"),
            Self::Html => write!(f, "html"),
            Self::Plain => write!(f, "plain"),
        }
    }
}

impl std::str::FromStr for FormatStyle {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "markdown" => Ok(Self::Markdown),
            "html" => Ok(Self::Html),
            "plain" => Ok(Self::Plain),
            other => Err(format!("unknown format style: {other}")),
        }
    }
}
