//! Materialized view of the results currently exposed for each turn.
//!
//! The view only ever holds results for a turn's active variant. Restoring a
//! turn diffs the stored rows for that variant against what is already
//! materialized, so a second restore of the same turn is a no-op.

use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use sidecar_core::{AddonId, StoredResult, Turn, TurnId};

use crate::error::StoreError;
use crate::results::ResultRepo;

#[derive(Debug)]
struct Materialized {
    variant_index: usize,
    results: BTreeMap<AddonId, StoredResult>,
}

/// What a restore pass changed.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RestoreOutcome {
    /// Results newly exposed (or replaced with newer content).
    pub shown: Vec<StoredResult>,
    /// Results withdrawn because they belong to another variant or no longer exist.
    pub hidden: Vec<(TurnId, AddonId)>,
    /// Results that were already materialized as stored.
    pub unchanged: usize,
}

impl RestoreOutcome {
    pub fn is_noop(&self) -> bool {
        self.shown.is_empty() && self.hidden.is_empty()
    }

    pub fn merge(&mut self, other: RestoreOutcome) {
        self.shown.extend(other.shown);
        self.hidden.extend(other.hidden);
        self.unchanged += other.unchanged;
    }
}

#[derive(Debug, Default)]
pub struct ResultView {
    turns: HashMap<TurnId, Materialized>,
}

impl ResultView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bring the view for `turn` in line with the stored results of its active variant.
    pub fn restore_turn(&mut self, repo: &ResultRepo, turn: &Turn) -> Result<RestoreOutcome, StoreError> {
        let variant = turn.current_variant_index;
        let stored = repo.list_for_turn(&turn.id, variant)?;
        let mut outcome = RestoreOutcome::default();

        let entry = self.turns.entry(turn.id.clone()).or_insert_with(|| Materialized {
            variant_index: variant,
            results: BTreeMap::new(),
        });

        if entry.variant_index != variant {
            for addon_id in std::mem::take(&mut entry.results).into_keys() {
                outcome.hidden.push((turn.id.clone(), addon_id));
            }
            entry.variant_index = variant;
        }

        let live: Vec<AddonId> = stored.iter().map(|r| r.addon_id.clone()).collect();
        let stale: Vec<AddonId> = entry
            .results
            .keys()
            .filter(|id| !live.contains(id))
            .cloned()
            .collect();
        for addon_id in stale {
            entry.results.remove(&addon_id);
            outcome.hidden.push((turn.id.clone(), addon_id));
        }

        for result in stored {
            match entry.results.get(&result.addon_id) {
                Some(existing) if existing.revision == result.revision => outcome.unchanged += 1,
                _ => {
                    entry.results.insert(result.addon_id.clone(), result.clone());
                    outcome.shown.push(result);
                }
            }
        }

        if entry.results.is_empty() {
            self.turns.remove(&turn.id);
        }

        debug!(
            turn_id = %turn.id,
            variant,
            shown = outcome.shown.len(),
            hidden = outcome.hidden.len(),
            unchanged = outcome.unchanged,
            "turn restored"
        );
        Ok(outcome)
    }

    /// Record a result that was just written and rendered live.
    /// Results of any other variant of the same turn are dropped from the view.
    pub fn materialize(&mut self, result: StoredResult) {
        let entry = self
            .turns
            .entry(result.turn_id.clone())
            .or_insert_with(|| Materialized {
                variant_index: result.variant_index,
                results: BTreeMap::new(),
            });
        if entry.variant_index != result.variant_index {
            entry.results.clear();
            entry.variant_index = result.variant_index;
        }
        entry.results.insert(result.addon_id.clone(), result);
    }

    /// Hide one result. A no-op unless `variant_index` is the exposed variant.
    pub fn forget(&mut self, turn_id: &TurnId, variant_index: usize, addon_id: &AddonId) -> bool {
        let Some(entry) = self.turns.get_mut(turn_id).filter(|m| m.variant_index == variant_index) else {
            return false;
        };
        let removed = entry.results.remove(addon_id).is_some();
        if entry.results.is_empty() {
            self.turns.remove(turn_id);
        }
        removed
    }

    /// Results currently exposed for a turn.
    pub fn visible(&self, turn_id: &TurnId) -> Vec<StoredResult> {
        self.turns
            .get(turn_id)
            .map(|m| m.results.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Variant whose results are currently exposed for a turn.
    pub fn visible_variant(&self, turn_id: &TurnId) -> Option<usize> {
        self.turns.get(turn_id).map(|m| m.variant_index)
    }

    /// Drop every turn the predicate rejects and report what was hidden.
    pub fn retain(&mut self, mut keep: impl FnMut(&TurnId) -> bool) -> Vec<(TurnId, AddonId)> {
        let mut hidden = Vec::new();
        self.turns.retain(|turn_id, materialized| {
            if keep(turn_id) {
                return true;
            }
            hidden.extend(
                materialized
                    .results
                    .keys()
                    .map(|addon_id| (turn_id.clone(), addon_id.clone())),
            );
            false
        });
        hidden
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    pub fn len(&self) -> usize {
        self.turns.values().map(|m| m.results.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}
