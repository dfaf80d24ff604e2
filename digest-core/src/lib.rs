//! Weekly digest core library: domain types, settings, the run ledger and
//! their errors.
//!
//! - [`types`]: newtypes, status enums and domain structs
//! - [`config`]: [`Settings`] load / save / env overrides
//! - [`ledger`]: SQLite-backed [`Ledger`] of batch runs and episodes
//! - [`paths`]: on-disk layout under `~/.weekly-digest/`
//! - [`error`]: [`LedgerError`], [`ConfigError`]

pub mod config;
pub mod error;
pub mod ledger;
pub mod paths;
pub mod types;

pub use config::{LogFormat, Settings};
pub use error::{ConfigError, LedgerError};
pub use ledger::Ledger;
pub use types::{
    BatchRun, Episode, GenerationJob, GenerationKind, GenerationState, ItemOutcome, ItemState,
    JobId, OutcomeCounts, RunId, RunStage, RunStatus, SourceItem, SourceRef,
};
