//! # digest-sync
//!
//! The weekly batch engine: a generic remote-job poller, batch submission,
//! the ingestion barrier plus synthesis stages, and the orchestrator that
//! composes them into one single-flight run.
//!
//! Call [`WeeklySyncOrchestrator::run_weekly_sync`] to execute one run.

pub mod batch;
pub mod error;
pub mod generation;
pub mod options;
pub mod orchestrator;
pub mod poller;
pub mod staleness;

pub use error::SyncError;
pub use options::SyncOptions;
pub use orchestrator::{RunSummary, WeeklySyncOrchestrator};
pub use poller::{PollConfig, PollOutcome, PollReport, RemoteJobPoller, StatusFetcher};
