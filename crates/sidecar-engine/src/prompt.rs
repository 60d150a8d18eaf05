use std::collections::HashMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use tracing::debug;

use sidecar_core::{Addon, Turn};

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{(addon|message|context)\}\}").unwrap());

const DEFAULT_TEMPLATE: &str = "{{addon}}\n\nRecent conversation:\n{{context}}\n\nLatest message:\n{{message}}";

/// Memo for context lookups within one dispatch cycle.
///
/// Several add-ons in a cycle usually ask for the same history slice. The
/// cache is opened when a cycle starts and cleared when it ends, so nothing
/// leaks into the next cycle.
#[derive(Debug, Default)]
pub struct CycleCache {
    contexts: HashMap<(usize, usize), String>,
    hits: usize,
}

impl CycleCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hits(&self) -> usize {
        self.hits
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn clear(&mut self) {
        if !self.contexts.is_empty() {
            debug!(entries = self.contexts.len(), hits = self.hits, "cycle cache cleared");
        }
        self.contexts.clear();
        self.hits = 0;
    }
}

/// Renders add-on prompt templates.
///
/// Placeholders: `{{message}}` (active variant of the target turn),
/// `{{context}}` (preceding turns, oldest first), `{{addon}}` (add-on name).
/// An empty template falls back to a default layout.
#[derive(Clone, Debug)]
pub struct PromptAssembler {
    default_context_turns: usize,
}

impl PromptAssembler {
    pub fn new(default_context_turns: usize) -> Self {
        Self {
            default_context_turns,
        }
    }

    /// `history` holds the turns before `turn`.
    pub fn render(&self, addon: &Addon, history: &[Turn], turn: &Turn, cache: &mut CycleCache) -> String {
        let depth = addon.context_turns.unwrap_or(self.default_context_turns);
        let template = if addon.prompt.trim().is_empty() {
            DEFAULT_TEMPLATE
        } else {
            addon.prompt.as_str()
        };

        let context = template
            .contains("{{context}}")
            .then(|| context_for(history, depth, cache))
            .unwrap_or_default();

        // One pass, so placeholder text inside substituted values stays literal.
        PLACEHOLDER
            .replace_all(template, |caps: &Captures| match &caps[1] {
                "addon" => addon.name.clone(),
                "message" => turn.text().to_string(),
                _ => context.clone(),
            })
            .into_owned()
    }
}

fn context_for(history: &[Turn], depth: usize, cache: &mut CycleCache) -> String {
    let key = (history.len(), depth);
    if let Some(hit) = cache.contexts.get(&key) {
        cache.hits += 1;
        return hit.clone();
    }
    let start = history.len().saturating_sub(depth);
    let rendered = history[start..]
        .iter()
        .map(|t| {
            let speaker = if t.is_user_turn() { "User" } else { "Assistant" };
            format!("{speaker}: {}", t.text())
        })
        .collect::<Vec<_>>()
        .join("\n");
    cache.contexts.insert(key, rendered.clone());
    rendered
}
