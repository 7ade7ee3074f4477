use std::time::Duration;

use draftflow_core::error::{DraftflowError, Result};
use reqwest::StatusCode;

/// Client with a per-request timeout.
pub(crate) fn build_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| DraftflowError::Config(format!("Failed to build HTTP client: {}", e)))
}

/// Statuses worth retrying: server errors, rate limits, request timeouts.
pub(crate) fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

/// Transport failures worth retrying.
pub(crate) fn is_retryable_transport(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}
