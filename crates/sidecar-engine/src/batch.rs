//! Combined prompts for batch groups and the decoder that splits the single
//! response back into per-add-on parts.
//!
//! Decoding is a three-tier ladder. Each tier is a standalone function so it
//! can be exercised on its own:
//! 1. split on the separator placed between prompts,
//! 2. split on `[[ADDON n]]` marker lines,
//! 3. give the whole response to the first add-on and empty strings to the rest.

use std::sync::LazyLock;

use regex::Regex;

use sidecar_core::Addon;

static MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?mi)^[ \t]*\[\[ADDON[ \t]+\d+\]\][ \t]*").unwrap());

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SplitTier {
    Separator,
    Marker,
    Whole,
}

impl SplitTier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Separator => "separator",
            Self::Marker => "marker",
            Self::Whole => "whole",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Decoded {
    /// One entry per group member, in group order.
    pub parts: Vec<String>,
    pub tier: SplitTier,
}

fn marker(position: usize) -> String {
    format!("[[ADDON {position}]]")
}

/// Build the single prompt sent for a batch group. `prompts[i]` belongs to `addons[i]`.
pub fn encode(addons: &[Addon], prompts: &[String], separator: &str) -> String {
    let mut out = format!(
        "You will answer {n} independent requests. Answer every request, in order.\n\
         Start each answer with its marker ({first}, {second}, ...) and put a line \
         containing only {separator} between answers.\n\n",
        n = addons.len(),
        first = marker(1),
        second = marker(2),
    );
    let sections: Vec<String> = addons
        .iter()
        .zip(prompts)
        .enumerate()
        .map(|(i, (addon, prompt))| format!("{} {}\n{}", marker(i + 1), addon.name, prompt.trim()))
        .collect();
    out.push_str(&sections.join(&format!("\n{separator}\n")));
    out
}

/// Split a combined response into `expected` parts, falling down the ladder as needed.
pub fn decode(response: &str, expected: usize, separator: &str) -> Decoded {
    if expected == 0 {
        return Decoded {
            parts: Vec::new(),
            tier: SplitTier::Whole,
        };
    }
    if let Some(parts) = split_on_separator(response, separator, expected) {
        return Decoded {
            parts,
            tier: SplitTier::Separator,
        };
    }
    if let Some(parts) = split_on_markers(response, expected) {
        return Decoded {
            parts,
            tier: SplitTier::Marker,
        };
    }
    Decoded {
        parts: whole_to_first(response, expected),
        tier: SplitTier::Whole,
    }
}

/// Tier 1. Empty segments at either end (a leading or trailing separator) are ignored.
pub fn split_on_separator(response: &str, separator: &str, expected: usize) -> Option<Vec<String>> {
    if separator.is_empty() {
        return None;
    }
    let mut parts: Vec<&str> = response.split(separator).map(str::trim).collect();
    while parts.first().is_some_and(|p| p.is_empty()) && parts.len() > expected {
        parts.remove(0);
    }
    while parts.last().is_some_and(|p| p.is_empty()) && parts.len() > expected {
        parts.pop();
    }
    (parts.len() == expected).then(|| parts.into_iter().map(strip_marker).collect())
}

/// Tier 2. Text before the first marker is treated as preamble and dropped.
pub fn split_on_markers(response: &str, expected: usize) -> Option<Vec<String>> {
    let found: Vec<(usize, usize)> = MARKER.find_iter(response).map(|m| (m.start(), m.end())).collect();
    if found.len() != expected {
        return None;
    }
    let parts = found
        .iter()
        .enumerate()
        .map(|(i, &(_, body_start))| {
            let body_end = found.get(i + 1).map_or(response.len(), |&(next, _)| next);
            response[body_start..body_end].trim().to_string()
        })
        .collect();
    Some(parts)
}

/// Tier 3. Never fails.
pub fn whole_to_first(response: &str, expected: usize) -> Vec<String> {
    let mut parts = vec![String::new(); expected];
    if let Some(first) = parts.first_mut() {
        *first = response.trim().to_string();
    }
    parts
}

fn strip_marker(part: &str) -> String {
    MARKER.replace(part, "").trim().to_string()
}
