//! # sidecar-settings
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`SidecarSettings::default()`]
//! 2. **User file**: `~/.sidecar/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `SIDECAR_*` overrides (highest priority)
//!
//! Settings are passed explicitly to the components that need them; there is
//! no process-wide singleton.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{load_settings, load_settings_from_path, merge_into, settings_path, sidecar_dir, validate};
pub use types::*;
