//! Error types for digest-sync.

use thiserror::Error;

use digest_core::{LedgerError, RunId};
use digest_remote::RemoteError;

/// Errors that escape a weekly sync. Every other failure is recorded on the
/// run itself and reported through its terminal status.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Another run holds the single running slot; nothing was written.
    #[error("batch run {run_id} is already running")]
    AlreadyRunning { run_id: RunId },

    /// Cooperative cancellation interrupted the run. Its ledger row stays
    /// `running` until an operator or the stale-run sweep fails it.
    #[error("batch run {run_id} was cancelled and left running")]
    Cancelled { run_id: RunId },

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// An HTTP adapter could not be constructed.
    #[error("remote client setup failed: {0}")]
    Setup(#[from] RemoteError),
}

impl SyncError {
    /// Map a ledger error, lifting the single-flight rejection.
    pub(crate) fn from_begin(err: LedgerError) -> Self {
        match err {
            LedgerError::AlreadyRunning { run_id } => SyncError::AlreadyRunning { run_id },
            other => SyncError::Ledger(other),
        }
    }
}
