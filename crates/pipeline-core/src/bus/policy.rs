//! Retry policies for event handlers.
//!
//! Every handler registration carries a factory, and every delivered event gets
//! a fresh policy from it, so backoff state is never shared between deliveries.

use crate::backoff::Backoff;
use crate::error::Error;
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// First pause of [`IndefiniteBackoff`] unless configured otherwise.
pub const DEFAULT_FIRST_RETRY: Duration = Duration::from_secs(30);

/// Decides whether a failed event delivery is attempted again.
#[async_trait]
pub trait RetryPolicy: Send + 'static {
    /// Called after failed attempt number `attempt` (starting at 1).
    ///
    /// May sleep before answering; returning `true` triggers the next attempt.
    async fn should_retry(&mut self, attempt: u32, err: &Error) -> bool;
}

/// Gives up after the first failure.
#[derive(Debug, Default, Clone, Copy)]
pub struct IgnoreErrors;

#[async_trait]
impl RetryPolicy for IgnoreErrors {
    async fn should_retry(&mut self, _attempt: u32, _err: &Error) -> bool {
        false
    }
}

/// Retries recoverable failures forever with exponentially growing pauses.
#[derive(Debug, Clone)]
pub struct IndefiniteBackoff {
    backoff: Backoff,
}

impl IndefiniteBackoff {
    pub fn new(first_retry: Duration) -> Self {
        Self {
            backoff: Backoff::new(first_retry),
        }
    }
}

impl Default for IndefiniteBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_FIRST_RETRY)
    }
}

#[async_trait]
impl RetryPolicy for IndefiniteBackoff {
    async fn should_retry(&mut self, attempt: u32, err: &Error) -> bool {
        if !err.is_recoverable() {
            return false;
        }
        let delay = self.backoff.next_delay();
        debug!(attempt, ?delay, "Waiting before next attempt");
        tokio::time::sleep(delay).await;
        true
    }
}
