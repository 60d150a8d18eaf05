use serde::{Deserialize, Serialize};

use crate::addon::ResponseLocation;
use crate::ids::AddonId;
use crate::turn::TurnRef;

/// Signals for the presentation layer. Rendering is entirely the subscriber's concern.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SidecarEvent {
    #[serde(rename = "unit_started")]
    UnitStarted { addon_id: AddonId, turn: TurnRef },

    #[serde(rename = "unit_succeeded")]
    UnitSucceeded {
        addon_id: AddonId,
        turn: TurnRef,
        content: String,
        location: ResponseLocation,
    },

    /// Carries enough to offer a retry keyed by `(addon_id, turn)`.
    #[serde(rename = "unit_failed")]
    UnitFailed {
        addon_id: AddonId,
        turn: TurnRef,
        error: String,
        error_kind: String,
    },
}

impl SidecarEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::UnitStarted { .. } => "unit_started",
            Self::UnitSucceeded { .. } => "unit_succeeded",
            Self::UnitFailed { .. } => "unit_failed",
        }
    }

    pub fn addon_id(&self) -> &AddonId {
        match self {
            Self::UnitStarted { addon_id, .. }
            | Self::UnitSucceeded { addon_id, .. }
            | Self::UnitFailed { addon_id, .. } => addon_id,
        }
    }
}
