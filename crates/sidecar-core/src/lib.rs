pub mod addon;
pub mod errors;
pub mod events;
pub mod host;
pub mod ids;
pub mod result;
pub mod turn;

pub use addon::{Addon, FormatStyle, RequestMode, ResponseLocation, TriggerConfig, TriggerMode, TriggerType};
pub use errors::InvokeError;
pub use events::SidecarEvent;
pub use host::{ModelInvoker, PersistError, Persister, TurnSource};
pub use ids::{AddonId, TurnId};
pub use result::{ResultMeta, StoredResult};
pub use turn::{Transcript, Turn, TurnRef};
