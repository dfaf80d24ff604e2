//! Error type shared by every remote boundary.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    /// Connection failure, request timeout, HTTP 5xx or 429. Worth retrying.
    #[error("transient remote failure: {0}")]
    Transient(String),

    /// The service refused the request (HTTP 4xx or an explicit refusal).
    #[error("remote rejected request (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    /// The response body did not have the expected shape.
    #[error("malformed remote response: {0}")]
    Decode(String),

    #[error("invalid HTTP client configuration: {0}")]
    Config(String),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient(_))
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        RemoteError::Rejected {
            status: 0,
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return RemoteError::Decode(err.to_string());
        }
        if err.is_builder() {
            return RemoteError::Config(err.to_string());
        }
        match err.status() {
            Some(status) if status.is_client_error() => RemoteError::Rejected {
                status: status.as_u16(),
                message: err.to_string(),
            },
            _ => RemoteError::Transient(err.to_string()),
        }
    }
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> RemoteError {
    RemoteError::Io {
        path: path.into(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(RemoteError::Transient("reset".into()).is_transient());
        assert!(!RemoteError::rejected("quota").is_transient());
        assert!(!RemoteError::Decode("eof".into()).is_transient());
    }

    #[test]
    fn rejected_message_includes_status() {
        let err = RemoteError::Rejected {
            status: 422,
            message: "bad url".into(),
        };
        assert_eq!(err.to_string(), "remote rejected request (HTTP 422): bad url");
    }
}
