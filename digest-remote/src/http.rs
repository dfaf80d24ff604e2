//! Shared request plumbing for the HTTP adapters: status classification
//! and transport-level retry of transient failures.

use std::time::Duration;

use reqwest::{RequestBuilder, Response, StatusCode};

use crate::error::RemoteError;

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_MIN_DELAY: Duration = Duration::from_secs(2);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(10);
const ERROR_BODY_LIMIT: usize = 200;

pub(crate) fn client(timeout: Duration) -> Result<reqwest::Client, RemoteError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| RemoteError::Config(e.to_string()))
}

pub(crate) fn join(base_url: &str, path: &str) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), path)
}

/// Send `request`, retrying transient failures with exponential backoff.
///
/// Requests whose body cannot be cloned are sent exactly once.
pub(crate) async fn send(request: RequestBuilder) -> Result<Response, RemoteError> {
    let mut delay = RETRY_MIN_DELAY;
    for attempt in 1..RETRY_ATTEMPTS {
        let Some(retryable) = request.try_clone() else {
            break;
        };
        match send_once(retryable).await {
            Err(err) if err.is_transient() => {
                tracing::warn!(attempt, error = %err, "transient HTTP failure, retrying");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(RETRY_MAX_DELAY);
            }
            other => return other,
        }
    }
    send_once(request).await
}

async fn send_once(request: RequestBuilder) -> Result<Response, RemoteError> {
    let response = request.send().await?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify(status, &body))
}

pub(crate) fn classify(status: StatusCode, body: &str) -> RemoteError {
    let message: String = body.chars().take(ERROR_BODY_LIMIT).collect();
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RemoteError::Transient(format!("HTTP {}: {message}", status.as_u16()))
    } else {
        RemoteError::Rejected {
            status: status.as_u16(),
            message,
        }
    }
}
