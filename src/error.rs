//! Pipeline error taxonomy
//!
//! Fetch failures (transient or permanent) consume the retry budget.
//! Persistence and organization failures are terminal for the item; they
//! are surfaced on its status and never retried by this subsystem.
//! Verification outcomes are statuses on the record, not errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DownloadError {
    /// Enqueue was attempted after the task queue was closed.
    #[error("task queue is closed")]
    QueueClosed,

    /// The delegate reported a failure that may succeed on a later attempt
    /// (unreachable source, timeout, throttling).
    #[error("transient fetch failure: {0}")]
    TransientFetch(String),

    /// The delegate reported a failure that will not resolve on its own
    /// (media removed, region-blocked). Consumes the same retry budget.
    #[error("fetch failed: {0}")]
    PermanentFetch(String),

    /// A store operation failed while the item was in flight.
    #[error("persistence failure: {0}")]
    Persistence(#[source] anyhow::Error),

    /// Moving the fetched file into the library failed. The source file is
    /// left untouched.
    #[error("organization failure: {0}")]
    Organization(#[source] anyhow::Error),

    /// The item was cancelled while in flight.
    #[error("cancelled")]
    Cancelled,
}

impl DownloadError {
    /// Whether this failure is eligible for the retry policy.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DownloadError::TransientFetch(_) | DownloadError::PermanentFetch(_)
        )
    }
}
