//! Normalizes host event payloads into a turn reference.
//!
//! Hosts emit different shapes depending on the code path (send, regenerate,
//! legacy events). Resolution degrades step by step and never fails; callers
//! decide what to do with an unresolved event.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use sidecar_core::{Turn, TurnId};

/// Attribute names that carry a turn index on element-style payloads.
const INDEX_ATTRS: [&str; 5] = ["mesid", "data-mesid", "index", "data-index", "turnIndex"];

/// Raw payload as delivered by the host.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum HostPayload {
    /// Canonical turn index.
    Index(i64),
    /// Attributes of a UI element that was acted on.
    Element(HashMap<String, String>),
    /// A turn object.
    Turn(Turn),
    /// Anything else; inspected best-effort.
    Raw(Value),
    Empty,
}

/// Canonical result of resolution. Either field may be missing.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResolvedEvent {
    pub turn_index: Option<usize>,
    pub turn: Option<Turn>,
}

impl ResolvedEvent {
    fn at(index: usize, turns: &[Turn]) -> Self {
        match turns.get(index) {
            Some(turn) => Self {
                turn_index: Some(index),
                turn: Some(turn.clone()),
            },
            None => Self::default(),
        }
    }

    fn by_identity(id: &TurnId, turns: &[Turn]) -> Option<Self> {
        turns.iter().position(|t| &t.id == id).map(|i| Self::at(i, turns))
    }

    pub fn is_resolved(&self) -> bool {
        self.turn.is_some()
    }
}

pub fn resolve(payload: &HostPayload, turns: &[Turn]) -> ResolvedEvent {
    let resolved = match payload {
        HostPayload::Index(i) => index_from_i64(*i).map(|i| ResolvedEvent::at(i, turns)),
        HostPayload::Element(attrs) => index_from_attrs(attrs).map(|i| ResolvedEvent::at(i, turns)),
        HostPayload::Turn(turn) => Some(from_turn(turn, turns)),
        HostPayload::Raw(value) => from_value(value, turns),
        HostPayload::Empty => None,
    };
    let resolved = resolved.unwrap_or_default();
    if !resolved.is_resolved() {
        debug!(payload = payload_kind(payload), "host event did not resolve to a turn");
    }
    resolved
}

fn payload_kind(payload: &HostPayload) -> &'static str {
    match payload {
        HostPayload::Index(_) => "index",
        HostPayload::Element(_) => "element",
        HostPayload::Turn(_) => "turn",
        HostPayload::Raw(_) => "raw",
        HostPayload::Empty => "empty",
    }
}

fn index_from_i64(i: i64) -> Option<usize> {
    usize::try_from(i).ok()
}

fn index_from_attrs(attrs: &HashMap<String, String>) -> Option<usize> {
    INDEX_ATTRS
        .iter()
        .filter_map(|name| attrs.get(*name))
        .find_map(|v| v.trim().parse::<usize>().ok())
}

/// A turn the host handed over directly. If it is not in the log the turn is
/// still usable, just without an index.
fn from_turn(turn: &Turn, turns: &[Turn]) -> ResolvedEvent {
    ResolvedEvent::by_identity(&turn.id, turns).unwrap_or_else(|| ResolvedEvent {
        turn_index: None,
        turn: Some(turn.clone()),
    })
}

fn from_value(value: &Value, turns: &[Turn]) -> Option<ResolvedEvent> {
    match value {
        Value::Number(n) => n.as_i64().and_then(index_from_i64).map(|i| ResolvedEvent::at(i, turns)),
        Value::String(s) => s.trim().parse::<usize>().ok().map(|i| ResolvedEvent::at(i, turns)),
        Value::Object(map) => {
            let index = INDEX_ATTRS.iter().filter_map(|k| map.get(*k)).find_map(|v| match v {
                Value::Number(n) => n.as_u64().and_then(|n| usize::try_from(n).ok()),
                Value::String(s) => s.trim().parse().ok(),
                _ => None,
            });
            if let Some(i) = index {
                return Some(ResolvedEvent::at(i, turns));
            }
            if let Some(id) = map.get("id").and_then(Value::as_str) {
                if let Some(found) = ResolvedEvent::by_identity(&TurnId::from_raw(id), turns) {
                    return Some(found);
                }
            }
            serde_json::from_value::<Turn>(value.clone())
                .ok()
                .map(|turn| from_turn(&turn, turns))
        }
        _ => None,
    }
}
