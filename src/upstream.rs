//! Shared HTTP plumbing for model providers.

use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Retries applied to provider calls unless overridden.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Failure talking to a model provider.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// Transport failure or undecodable body.
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// Provider answered with a non-success status.
    #[error("provider returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: StatusCode,
        /// Response body, for diagnostics.
        body: String,
    },
}

/// Build the HTTP client used for provider calls.
pub fn http_client(timeout: Duration) -> Result<Client, reqwest::Error> {
    Client::builder().timeout(timeout).build()
}

/// Send a JSON request, retrying rate limits, server errors and transport failures with
/// exponential backoff (1s, 2s, 4s, ...). Other client errors fail immediately.
pub async fn send_json<F>(build: F, max_retries: u32) -> Result<Value, UpstreamError>
where
    F: Fn() -> RequestBuilder,
{
    let mut last_error = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_secs(1 << (attempt - 1).min(5))).await;
        }

        match build().send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Ok(response.json().await?);
                }
                let body = response.text().await.unwrap_or_default();
                let error = UpstreamError::Status { status, body };
                if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                    tracing::warn!(%status, attempt, "Provider call failed; retrying");
                    last_error = Some(error);
                    continue;
                }
                return Err(error);
            }
            Err(err) => {
                tracing::warn!(error = %err, attempt, "Provider request failed; retrying");
                last_error = Some(UpstreamError::Http(err));
            }
        }
    }

    Err(last_error.unwrap_or_else(|| UpstreamError::Status {
        status: StatusCode::SERVICE_UNAVAILABLE,
        body: "no attempt was made".into(),
    }))
}
