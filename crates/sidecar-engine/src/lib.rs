//! Orchestration for chat add-ons: deciding which add-ons run for a turn,
//! running them concurrently, and keeping their stored results consistent
//! with the host's turn variants.

pub mod batch;
pub mod classify;
pub mod debounce;
pub mod dispatcher;
pub mod error;
pub mod grouping;
pub mod prompt;
pub mod resolve;
pub mod sanitize;

pub use batch::{Decoded, SplitTier};
pub use classify::{classify, matches, Classified};
pub use debounce::Debouncer;
pub use dispatcher::{CycleReport, DispatchOutcome, DispatchPhase, Dispatcher, DispatcherConfig, UnitFailure};
pub use error::{ConfigError, EngineError};
pub use grouping::{plan, BatchGroup, ExecutionPlan};
pub use prompt::{CycleCache, PromptAssembler};
pub use resolve::{resolve, HostPayload, ResolvedEvent};
pub use sanitize::sanitize;
