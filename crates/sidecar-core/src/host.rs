//! Interfaces the engine consumes from its surroundings.

use async_trait::async_trait;

use crate::addon::Addon;
use crate::errors::InvokeError;
use crate::turn::Turn;

/// Read access to the host conversation.
pub trait TurnSource: Send + Sync {
    /// Snapshot of all turns in display order.
    fn turns(&self) -> Vec<Turn>;
}

/// The model invocation service. Retries and timeouts are the implementor's concern.
#[async_trait]
pub trait ModelInvoker: Send + Sync {
    /// Run one add-on's prompt and return the raw response text.
    async fn invoke(&self, addon: &Addon, prompt: &str) -> Result<String, InvokeError>;

    /// Run a combined prompt for a batch group that shares provider and model.
    /// Returns the raw combined response; splitting it is the caller's job.
    async fn invoke_batch(&self, addons: &[Addon], prompt: &str) -> Result<String, InvokeError>;
}

#[derive(Debug, thiserror::Error)]
#[error("persistence failed: {0}")]
pub struct PersistError(pub String);

/// Host save primitive, called after result writes.
#[async_trait]
pub trait Persister: Send + Sync {
    async fn persist(&self) -> Result<(), PersistError>;
}
