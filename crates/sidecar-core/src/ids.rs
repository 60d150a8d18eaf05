//! Opaque string identifiers. Hosts and settings supply their own ids; the
//! engine only mints turn ids for in-process transcripts.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an id exactly as given.
            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self::from_raw(s)
            }
        }
    };
}

string_id!(
    /// Add-on identifier from configuration, unique within one settings file.
    AddonId
);
string_id!(
    /// Host message identifier, stable across variant switches.
    TurnId
);

impl TurnId {
    /// Fresh time-ordered id.
    pub fn new() -> Self {
        Self(format!("turn_{}", Uuid::now_v7().simple()))
    }
}

impl Default for TurnId {
    fn default() -> Self {
        Self::new()
    }
}
