use serde::{Deserialize, Serialize};

use crate::addon::{Addon, FormatStyle, ResponseLocation};
use crate::ids::{AddonId, TurnId};

/// Persisted output of one add-on for one turn variant.
/// Keyed by `(turn_id, variant_index, addon_id)`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoredResult {
    pub addon_id: AddonId,
    pub turn_id: TurnId,
    pub variant_index: usize,
    pub content: String,
    pub addon_name: String,
    /// RFC 3339 write time.
    pub timestamp: String,
    pub format_style: FormatStyle,
    pub response_location: ResponseLocation,
    /// Set only when the content came from a user edit.
    pub edited: bool,
    /// Monotonic write counter used for most-recent-first ordering.
    pub revision: i64,
}

/// Descriptive fields written alongside result content.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResultMeta {
    pub addon_name: String,
    pub format_style: FormatStyle,
    pub response_location: ResponseLocation,
}

impl ResultMeta {
    pub fn for_addon(addon: &Addon) -> Self {
        Self {
            addon_name: addon.name.clone(),
            format_style: addon.format_style,
            response_location: addon.response_location,
        }
    }
}
