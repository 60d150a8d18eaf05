use sidecar_core::{AddonId, TurnId};
use sidecar_store::StoreError;

/// An add-on whose configuration cannot be scheduled.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("batch add-on {addon_id} has no provider or model")]
    MissingModel { addon_id: AddonId },

    #[error("add-on {addon_id} uses {found} but its batch group is keyed {expected}")]
    MismatchedGroup {
        addon_id: AddonId,
        expected: String,
        found: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("event could not be resolved to a turn")]
    Unresolved,

    #[error("no AI turn available")]
    NoTurn,

    #[error("turn not found: {0}")]
    TurnNotFound(TurnId),

    #[error("turn {turn_id} has no variant {variant_index}")]
    VariantOutOfRange { turn_id: TurnId, variant_index: usize },

    #[error("unknown add-on: {0}")]
    UnknownAddon(AddonId),

    #[error("no stored result for {addon_id} on {turn_id}@{variant_index}")]
    ResultNotFound {
        addon_id: AddonId,
        turn_id: TurnId,
        variant_index: usize,
    },
}
