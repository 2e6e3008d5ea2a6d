// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

use thiserror::Error;

/// Error types for beamgen operations
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed config, limit, or input
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A capability returned an error not matching a more specific kind
    #[error("Capability failure ({capability}): {message}")]
    CapabilityFailure {
        /// Which capability failed (e.g. "language", "image", "vision")
        capability: String,
        /// Provider-reported error message
        message: String,
    },

    /// A capability refused the request due to content policy
    #[error("Content policy rejection ({capability}): {message}")]
    ContentPolicy {
        /// Which capability refused
        capability: String,
        /// Provider-reported refusal message
        message: String,
    },

    /// A capability did not respond within its configured budget
    #[error("Timeout after {elapsed_ms}ms waiting for {capability}")]
    Timeout {
        /// Which capability timed out
        capability: String,
        /// Configured budget that was exceeded, in milliseconds
        elapsed_ms: u64,
    },

    /// The job cancellation token tripped during a call
    #[error("Cancelled")]
    Cancelled,

    /// Every leaf of an iteration failed; fatal for the job
    #[error("All {count} leaves of iteration {iteration} failed")]
    AllLeavesFailed {
        /// Iteration that lost all its leaves
        iteration: u32,
        /// Number of leaves that failed
        count: usize,
    },
}

impl Error {
    /// Shorthand for an [`Error::InvalidArgument`]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Error::InvalidArgument(message.into())
    }

    /// Shorthand for an [`Error::CapabilityFailure`]
    pub fn capability(capability: impl Into<String>, message: impl Into<String>) -> Self {
        Error::CapabilityFailure {
            capability: capability.into(),
            message: message.into(),
        }
    }

    /// Shorthand for an [`Error::ContentPolicy`]
    pub fn content_policy(capability: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ContentPolicy {
            capability: capability.into(),
            message: message.into(),
        }
    }

    /// Shorthand for an [`Error::Timeout`]
    pub fn timeout(capability: impl Into<String>, elapsed_ms: u64) -> Self {
        Error::Timeout {
            capability: capability.into(),
            elapsed_ms,
        }
    }

    /// Stable kind tag carried by `error` events and logs
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidArgument(_) => "invalid-argument",
            Error::CapabilityFailure { .. } => "capability-failure",
            Error::ContentPolicy { .. } => "content-policy",
            Error::Timeout { .. } => "timeout",
            Error::Cancelled => "cancelled",
            Error::AllLeavesFailed { .. } => "all-leaves-failed",
        }
    }

    /// Whether the retry layer may re-attempt the failed call.
    ///
    /// Content-policy rejections are not retried here: they go through the
    /// orchestrator's prompt-rewrite path instead.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::CapabilityFailure { .. } | Error::Timeout { .. }
        )
    }
}

/// Result type for beamgen operations
pub type Result<T> = std::result::Result<T, Error>;
