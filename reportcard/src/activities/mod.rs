//! Side-effecting adapters behind the routine ports.
//!
//! Everything here talks to the outside world (model APIs, the `gh` CLI,
//! object storage, the payment indexer) and reports failures as
//! [`ActivityError`](crate::durable::ActivityError) so the caller's retry
//! policy can tell transient from permanent.

pub mod content;
pub mod gh;
pub mod llm;
pub mod payment;
pub mod storage;

use crate::durable::ActivityError;

/// Classify an HTTP failure: 5xx, 408 and 429 are worth retrying, other statuses are not.
pub(crate) fn status_error(service: &str, status: reqwest::StatusCode, body: &str) -> ActivityError {
    let message = format!("{service} returned status {}: {body}", status.as_u16());
    if status.is_server_error()
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
    {
        ActivityError::retryable(message)
    } else {
        ActivityError::non_retryable("HttpStatusError", message)
    }
}

/// Transport failures (connect, reset, body read) are always retryable.
pub(crate) fn transport_error(service: &str, err: reqwest::Error) -> ActivityError {
    ActivityError::retryable(format!("failed to send {service} request: {err}"))
}
