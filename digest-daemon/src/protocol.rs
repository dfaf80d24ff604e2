//! Client side of the daemon's JSON-lines control socket.
//!
//! One request per line, one response per line:
//!
//! ```text
//! {"cmd":"run"}                  -> {"ok":true,"data":<RunSummary>}
//! {"cmd":"history","limit":5}    -> {"ok":true,"data":[<BatchRun>...]}
//! {"cmd":"episodes","limit":5}   -> {"ok":true,"data":[<Episode>...]}
//! {"cmd":"status"}               -> {"ok":true,"data":{...}}
//! {"cmd":"stop"}                 -> {"ok":true,"data":{"stopping":true}}
//! ```

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use digest_core::paths::socket_path;
use digest_core::{BatchRun, Episode};
use digest_sync::RunSummary;

use crate::error::{io_err, DaemonError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonRequest {
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl DaemonRequest {
    pub fn new(cmd: &str) -> Self {
        Self {
            cmd: cmd.to_string(),
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DaemonResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Send one request to the daemon socket and wait for its response.
///
/// A `run` request blocks until the run reaches a terminal status.
pub fn send_request(home: &Path, request: &DaemonRequest) -> Result<DaemonResponse, DaemonError> {
    let socket = socket_path(home);
    if !socket.exists() {
        return Err(DaemonError::DaemonNotRunning { socket });
    }

    let mut stream = UnixStream::connect(&socket).map_err(|err| {
        if matches!(
            err.kind(),
            std::io::ErrorKind::NotFound
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
        ) {
            DaemonError::DaemonNotRunning {
                socket: socket.clone(),
            }
        } else {
            io_err(&socket, err)
        }
    })?;

    let mut payload = serde_json::to_string(request)?;
    payload.push('\n');
    stream
        .write_all(payload.as_bytes())
        .and_then(|()| stream.flush())
        .map_err(|e| io_err(&socket, e))?;

    let mut line = String::new();
    let read = BufReader::new(stream)
        .read_line(&mut line)
        .map_err(|e| io_err(&socket, e))?;
    if read == 0 {
        return Err(DaemonError::Protocol(
            "daemon closed connection before responding".to_string(),
        ));
    }
    Ok(serde_json::from_str(line.trim_end())?)
}

/// Query daemon status, retrying briefly while the socket comes up.
pub fn request_status(home: &Path) -> Result<Value, DaemonError> {
    let request = DaemonRequest::new("status");
    let mut attempt = 0;
    loop {
        match send_request(home, &request) {
            Ok(response) => return response_into_data(response),
            Err(err @ DaemonError::DaemonNotRunning { .. }) if attempt >= 4 => return Err(err),
            Err(DaemonError::DaemonNotRunning { .. }) => {
                attempt += 1;
                sleep(Duration::from_millis(100));
            }
            Err(err) => return Err(err),
        }
    }
}

pub fn request_stop(home: &Path) -> Result<(), DaemonError> {
    let response = send_request(home, &DaemonRequest::new("stop"))?;
    response_into_data(response).map(|_| ())
}

pub fn request_run(home: &Path) -> Result<RunSummary, DaemonError> {
    let response = send_request(home, &DaemonRequest::new("run"))?;
    Ok(serde_json::from_value(response_into_data(response)?)?)
}

pub fn request_history(home: &Path, limit: usize) -> Result<Vec<BatchRun>, DaemonError> {
    let response = send_request(home, &DaemonRequest::new("history").with_limit(limit))?;
    Ok(serde_json::from_value(response_into_data(response)?)?)
}

pub fn request_episodes(home: &Path, limit: usize) -> Result<Vec<Episode>, DaemonError> {
    let response = send_request(home, &DaemonRequest::new("episodes").with_limit(limit))?;
    Ok(serde_json::from_value(response_into_data(response)?)?)
}

fn response_into_data(response: DaemonResponse) -> Result<Value, DaemonError> {
    if response.ok {
        Ok(response.data.unwrap_or(Value::Null))
    } else {
        Err(DaemonError::Protocol(
            response
                .error
                .unwrap_or_else(|| "unknown daemon error".to_string()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::TempDir;
    use tokio_test::{assert_err, assert_ok};

    use super::*;

    #[test]
    fn limit_is_omitted_when_unset() {
        let line = serde_json::to_string(&DaemonRequest::new("status")).unwrap();
        assert_eq!(line, r#"{"cmd":"status"}"#);

        let line = serde_json::to_string(&DaemonRequest::new("history").with_limit(3)).unwrap();
        assert_eq!(line, r#"{"cmd":"history","limit":3}"#);
    }

    #[test]
    fn error_response_surfaces_message() {
        let err = assert_err!(response_into_data(DaemonResponse::error(
            "weekly sync already running"
        )));
        assert!(err.to_string().contains("already running"));

        let data = assert_ok!(response_into_data(DaemonResponse::ok(json!({"a": 1}))));
        assert_eq!(data["a"], 1);
    }

    #[test]
    fn missing_socket_means_not_running() {
        let home = TempDir::new().unwrap();
        let err = send_request(home.path(), &DaemonRequest::new("status")).unwrap_err();
        assert!(matches!(err, DaemonError::DaemonNotRunning { .. }));
    }
}
