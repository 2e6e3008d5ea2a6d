// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Retry policies for capability calls.
//!
//! Leaf-level `CapabilityFailure` and `Timeout` errors are retried with
//! backoff up to the policy's budget; everything else (`ContentPolicy`,
//! `Cancelled`, `InvalidArgument`) propagates immediately. Content-policy
//! rejections are handled by the orchestrator's prompt-rewrite loop, not
//! here.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;

/// Backoff schedule applied between retry attempts
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum RetryPolicy {
    /// Exponential backoff: `base_delay_ms * 2^attempt`, capped at `max_delay_ms`
    Exponential {
        /// Maximum number of retries after the initial attempt
        max_retries: u32,
        /// Delay before the first retry, in milliseconds
        base_delay_ms: u64,
        /// Upper bound on any single delay, in milliseconds
        max_delay_ms: u64,
    },
    /// Fixed delay between attempts
    Fixed {
        /// Maximum number of retries after the initial attempt
        max_retries: u32,
        /// Delay between attempts, in milliseconds
        delay_ms: u64,
    },
    /// No retries; the first failure propagates
    None,
}

impl RetryPolicy {
    /// Exponential backoff with the default 500ms base and 30s cap
    #[must_use]
    pub fn exponential(max_retries: u32) -> Self {
        RetryPolicy::Exponential {
            max_retries,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }

    /// Fixed backoff
    #[must_use]
    pub fn fixed(max_retries: u32, delay_ms: u64) -> Self {
        RetryPolicy::Fixed {
            max_retries,
            delay_ms,
        }
    }

    /// Maximum number of retries after the initial attempt
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        match self {
            RetryPolicy::Exponential { max_retries, .. }
            | RetryPolicy::Fixed { max_retries, .. } => *max_retries,
            RetryPolicy::None => 0,
        }
    }

    /// Delay to apply before retry number `attempt` (0-based)
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            RetryPolicy::Exponential {
                base_delay_ms,
                max_delay_ms,
                ..
            } => {
                let exp = base_delay_ms.saturating_mul(1u64 << attempt.min(32));
                Duration::from_millis(exp.min(*max_delay_ms))
            }
            RetryPolicy::Fixed { delay_ms, .. } => Duration::from_millis(*delay_ms),
            RetryPolicy::None => Duration::ZERO,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::exponential(3)
    }
}

/// Run `operation`, retrying per `policy` while the error is retryable.
///
/// The closure is invoked once per attempt; each invocation must produce a
/// fresh future.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_retries() => {
                let delay = policy.delay(attempt);
                debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying capability call"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
