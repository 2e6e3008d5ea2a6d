// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Bounded-concurrency limiting for capability calls.
//!
//! Each external capability gets its own [`ConcurrencyLimiter`]: at most
//! `limit` tasks run at once, excess tasks queue FIFO, and the limit can be
//! retuned while tasks are in flight. The limiter, not the runtime,
//! determines the effective in-flight count against a provider.
//!
//! Local providers (single GPU) default to a limit of 1 so requests
//! serialize; remote providers default higher. See [`LimiterRegistry`].

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::debug;

use crate::capability::{CapabilityKind, Locality};
use crate::error::{Error, Result};

/// Snapshot of a limiter's scheduling state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterMetrics {
    /// Tasks currently running
    pub active: usize,
    /// Tasks waiting for a slot
    pub queued: usize,
    /// Maximum concurrent tasks
    pub limit: usize,
}

#[derive(Debug)]
struct LimiterState {
    limit: usize,
    active: usize,
    queue: VecDeque<oneshot::Sender<()>>,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<LimiterState>,
}

/// FIFO bounded-concurrency limiter.
///
/// Clones share the same underlying state.
///
/// # Example
///
/// ```rust
/// use beamgen::limiter::ConcurrencyLimiter;
///
/// #[tokio::main]
/// async fn main() {
///     let limiter = ConcurrencyLimiter::new(2).unwrap();
///     let value = limiter.execute(async { 41 + 1 }).await;
///     assert_eq!(value, 42);
/// }
/// ```
#[derive(Clone, Debug)]
pub struct ConcurrencyLimiter {
    inner: Arc<Inner>,
}

/// Hand the slot to the oldest live waiter, skipping waiters whose acquire
/// future was dropped while queued. If the limit was lowered below the
/// active count, drain instead of handing off.
fn release_slot(inner: &Inner) {
    let mut state = inner.state.lock();
    while state.active <= state.limit {
        match state.queue.pop_front() {
            Some(tx) => {
                if tx.send(()).is_ok() {
                    return;
                }
            }
            None => break,
        }
    }
    state.active -= 1;
}

/// RAII slot held while a task runs
struct Permit {
    inner: Arc<Inner>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        release_slot(&self.inner);
    }
}

/// Queued waiter that re-releases a slot handed to it if its acquire future
/// is dropped between the handoff and the wakeup.
struct QueuedWaiter {
    rx: Option<oneshot::Receiver<()>>,
    inner: Arc<Inner>,
}

impl Drop for QueuedWaiter {
    fn drop(&mut self) {
        if let Some(mut rx) = self.rx.take() {
            if rx.try_recv().is_ok() {
                release_slot(&self.inner);
            }
        }
    }
}

impl ConcurrencyLimiter {
    /// Create a limiter admitting at most `limit` concurrent tasks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] when `limit` is zero.
    pub fn new(limit: usize) -> Result<Self> {
        if limit == 0 {
            return Err(Error::invalid_argument(
                "concurrency limit must be a positive integer",
            ));
        }
        Ok(Self {
            inner: Arc::new(Inner {
                state: Mutex::new(LimiterState {
                    limit,
                    active: 0,
                    queue: VecDeque::new(),
                }),
            }),
        })
    }

    /// Run `task` once a slot is available, in FIFO admission order.
    ///
    /// The return value reflects the task's own outcome regardless of how
    /// the task was scheduled.
    pub async fn execute<F>(&self, task: F) -> F::Output
    where
        F: std::future::Future,
    {
        let _permit = self.acquire().await;
        task.await
    }

    async fn acquire(&self) -> Permit {
        let rx = {
            let mut state = self.inner.state.lock();
            if state.active < state.limit {
                state.active += 1;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                state.queue.push_back(tx);
                Some(rx)
            }
        };
        if let Some(rx) = rx {
            let mut waiter = QueuedWaiter {
                rx: Some(rx),
                inner: Arc::clone(&self.inner),
            };
            if let Some(rx) = waiter.rx.as_mut() {
                // Senders are never dropped without a send, so an Err here
                // cannot occur in practice; either way the handoff is ours.
                let _ = rx.await;
            }
            // Disarm the waiter: from here the Permit owns the slot.
            waiter.rx = None;
        }
        Permit {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Update the concurrency limit.
    ///
    /// Running tasks are unaffected. If the limit increased and the queue is
    /// non-empty, `min(limit - active, queued)` waiters are released
    /// immediately.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] when `limit` is zero.
    pub fn set_limit(&self, limit: usize) -> Result<()> {
        if limit == 0 {
            return Err(Error::invalid_argument(
                "concurrency limit must be a positive integer",
            ));
        }
        let mut state = self.inner.state.lock();
        state.limit = limit;
        while state.active < state.limit {
            match state.queue.pop_front() {
                Some(tx) => {
                    if tx.send(()).is_ok() {
                        state.active += 1;
                    }
                }
                None => break,
            }
        }
        Ok(())
    }

    /// Current scheduling state
    #[must_use]
    pub fn metrics(&self) -> LimiterMetrics {
        let state = self.inner.state.lock();
        LimiterMetrics {
            active: state.active,
            queued: state.queue.len(),
            limit: state.limit,
        }
    }
}

/// Default limits applied when a capability does not get an explicit one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterPolicy {
    /// Limit for local providers (single-GPU serialization)
    pub local_limit: usize,
    /// Limit for remote providers
    pub remote_limit: usize,
}

impl Default for LimiterPolicy {
    fn default() -> Self {
        Self {
            local_limit: 1,
            remote_limit: 4,
        }
    }
}

impl LimiterPolicy {
    fn limit_for(&self, locality: Locality) -> usize {
        match locality {
            Locality::Local => self.local_limit.max(1),
            Locality::Remote => self.remote_limit.max(1),
        }
    }
}

/// Per-capability limiter registry.
///
/// New capabilities plug in without orchestrator changes: the registry
/// creates a limiter on first access using the default policy for the
/// capability's locality, and [`LimiterRegistry::tune`] retunes a live
/// limiter at any time.
#[derive(Debug, Default)]
pub struct LimiterRegistry {
    limiters: DashMap<CapabilityKind, ConcurrencyLimiter>,
    policy: LimiterPolicy,
}

impl LimiterRegistry {
    /// Create a registry with the given default policy
    #[must_use]
    pub fn new(policy: LimiterPolicy) -> Self {
        Self {
            limiters: DashMap::new(),
            policy,
        }
    }

    /// Register `kind` with the default limit for `locality`.
    ///
    /// Re-registering an existing kind keeps the live limiter (and any
    /// retuning applied to it).
    pub fn register(&self, kind: CapabilityKind, locality: Locality) {
        let limit = self.policy.limit_for(locality);
        self.limiters.entry(kind).or_insert_with(|| {
            debug!(capability = %kind, limit, "registering capability limiter");
            #[allow(clippy::unwrap_used)] // limit_for never yields zero
            ConcurrencyLimiter::new(limit).unwrap()
        });
    }

    /// Limiter for `kind`, creating one with remote defaults if the kind was
    /// never registered.
    #[must_use]
    pub fn get(&self, kind: CapabilityKind) -> ConcurrencyLimiter {
        self.register(kind, Locality::Remote);
        #[allow(clippy::unwrap_used)] // register() above guarantees presence
        self.limiters.get(&kind).unwrap().clone()
    }

    /// Retune the limit for `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] when `limit` is zero.
    pub fn tune(&self, kind: CapabilityKind, limit: usize) -> Result<()> {
        self.get(kind).set_limit(limit)
    }
}
