// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Cooperative cancellation for jobs and capability calls.
//!
//! One token exists per job. Capability calls receive a clone and are
//! expected to return [`Error::Cancelled`] promptly once it trips; callers
//! that cannot rely on the capability honoring the token wrap the call with
//! [`CancellationToken::guard`], which discards the in-flight result.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Clonable cancellation token shared by everything a job schedules.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    /// Create a fresh, untripped token
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the token. Idempotent; wakes every waiter.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Whether the token has tripped
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Return `Err(Cancelled)` if the token has tripped
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolve once the token trips
    pub async fn cancelled(&self) {
        // Register before re-checking the flag so a cancel() between the
        // check and the await cannot be missed.
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Race `fut` against cancellation, discarding its output if the token
    /// trips first.
    pub async fn guard<F, T>(&self, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            () = self.cancelled() => Err(Error::Cancelled),
            result = fut => result,
        }
    }
}
