//! Error types for digest-core.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::{RunId, RunStatus};

/// All errors that can arise from ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Another run still holds the single `running` slot.
    #[error("batch run {run_id} is already running")]
    AlreadyRunning { run_id: RunId },

    #[error("batch run {run_id} not found")]
    RunNotFound { run_id: RunId },

    /// The run reached a terminal status and can no longer be mutated.
    #[error("batch run {run_id} is already {status}; terminal runs are immutable")]
    RunFinalized { run_id: RunId, status: RunStatus },

    /// `complete_run` was asked to move a run back to `running`.
    #[error("cannot complete batch run {run_id} with non-terminal status {status}")]
    NonTerminalStatus { run_id: RunId, status: RunStatus },

    /// Includes rows whose status columns hold unknown values.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// All errors that can arise while loading or writing settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML serialization error (write path).
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// YAML parse error on load, with file path context.
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// An environment override held a value of the wrong shape.
    #[error("invalid value for {var}: {reason}")]
    InvalidEnv { var: &'static str, reason: String },

    /// A setting holds a value the engine cannot run with.
    #[error("invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    /// `dirs::home_dir()` returned `None`.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,
}

pub(crate) fn ledger_io_err(path: impl Into<PathBuf>, source: std::io::Error) -> LedgerError {
    LedgerError::Io {
        path: path.into(),
        source,
    }
}

pub(crate) fn config_io_err(path: impl Into<PathBuf>, source: std::io::Error) -> ConfigError {
    ConfigError::Io {
        path: path.into(),
        source,
    }
}
