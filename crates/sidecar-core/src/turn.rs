use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::host::TurnSource;
use crate::ids::TurnId;

/// One message in the host conversation.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Turn {
    pub id: TurnId,
    /// `None` when the host did not say who wrote the turn.
    #[serde(default)]
    pub is_user: Option<bool>,
    /// Alternate regenerations of this turn. Index 0 is the original.
    #[serde(default)]
    pub variants: Vec<String>,
    #[serde(default)]
    pub current_variant_index: usize,
}

impl Turn {
    pub fn user(text: &str) -> Self {
        Self {
            id: TurnId::new(),
            is_user: Some(true),
            variants: vec![text.to_string()],
            current_variant_index: 0,
        }
    }

    pub fn assistant(text: &str) -> Self {
        Self {
            id: TurnId::new(),
            is_user: Some(false),
            variants: vec![text.to_string()],
            current_variant_index: 0,
        }
    }

    /// Text of the active variant, empty if the variant list is empty.
    pub fn text(&self) -> &str {
        self.variants
            .get(self.current_variant_index)
            .map(String::as_str)
            .unwrap_or("")
    }

    /// Whether the turn is a user turn. Undecidable turns count as AI turns.
    pub fn is_user_turn(&self) -> bool {
        self.is_user.unwrap_or(false)
    }

    pub fn role_known(&self) -> bool {
        self.is_user.is_some()
    }
}

/// Stable pointer to one variant of one turn.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRef {
    pub turn_id: TurnId,
    pub turn_index: usize,
    pub variant_index: usize,
}

impl TurnRef {
    pub fn of(turn: &Turn, turn_index: usize) -> Self {
        Self {
            turn_id: turn.id.clone(),
            turn_index,
            variant_index: turn.current_variant_index,
        }
    }
}

impl std::fmt::Display for TurnRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}@{}", self.turn_id, self.turn_index, self.variant_index)
    }
}

/// In-memory conversation log that can stand in for a host.
#[derive(Debug, Default)]
pub struct Transcript {
    turns: RwLock<Vec<Turn>>,
}

impl Transcript {
    pub fn new(turns: Vec<Turn>) -> Self {
        Self {
            turns: RwLock::new(turns),
        }
    }

    /// Append a turn and return its index.
    pub fn push(&self, turn: Turn) -> usize {
        let mut turns = self.turns.write();
        turns.push(turn);
        turns.len() - 1
    }

    /// Add a regenerated variant to a turn and make it active.
    /// Returns the new variant index, or `None` if the turn does not exist.
    pub fn regenerate(&self, index: usize, text: &str) -> Option<usize> {
        let mut turns = self.turns.write();
        let turn = turns.get_mut(index)?;
        turn.variants.push(text.to_string());
        turn.current_variant_index = turn.variants.len() - 1;
        Some(turn.current_variant_index)
    }

    /// Switch the active variant of a turn. Returns false when out of range.
    pub fn swipe(&self, index: usize, variant: usize) -> bool {
        let mut turns = self.turns.write();
        match turns.get_mut(index) {
            Some(turn) if variant < turn.variants.len() => {
                turn.current_variant_index = variant;
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, index: usize) -> Option<Turn> {
        self.turns.read().get(index).cloned()
    }

    pub fn len(&self) -> usize {
        self.turns.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.read().is_empty()
    }
}

impl TurnSource for Transcript {
    fn turns(&self) -> Vec<Turn> {
        self.turns.read().clone()
    }
}
