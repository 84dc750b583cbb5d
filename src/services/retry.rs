//! Retry policy for failed download attempts
//!
//! The backoff is a fixed configured delay, the same every time — not
//! exponential. An item whose retry budget is exhausted stays permanently
//! Failed with its last error retained. If cancellation fires while
//! waiting out the backoff, the item is left Failed so shutdown never
//! spawns new attempts.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-queue for another attempt with the incremented retry count.
    Retry { next_retry_count: u32 },
    /// Budget exhausted; the item fails permanently.
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    /// Decide what happens after a failed attempt, given the item's retry
    /// count so far.
    pub fn decide(&self, retry_count: u32) -> RetryDecision {
        if retry_count < self.max_retries {
            RetryDecision::Retry {
                next_retry_count: retry_count + 1,
            }
        } else {
            RetryDecision::GiveUp
        }
    }

    /// Wait out the fixed backoff. Returns `false` if `cancel` fired
    /// first, in which case the caller must not re-queue the item.
    pub async fn wait(&self, cancel: &CancellationToken) -> bool {
        if self.backoff.is_zero() {
            return !cancel.is_cancelled();
        }
        debug!(backoff_secs = self.backoff.as_secs_f64(), "waiting out retry backoff");
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.backoff) => true,
        }
    }
}
