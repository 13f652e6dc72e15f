//! In-flight request registry: deduplication and cancellation.
//!
//! The registry maps each cache key with an outstanding operation to the
//! set of requests waiting on it, plus one cancellation token for the
//! underlying work. It is the one piece of engine state mutated from
//! multiple concurrent call sites, so every read-modify-write goes through
//! a single mutex.
//!
//! # Invariants
//!
//! - A key present in the registry has at least one waiter.
//! - The key is removed the instant its waiter set becomes empty, and the
//!   underlying operation is aborted at that same instant.
//! - `complete` removes the key unconditionally once the operation
//!   settles; later calls for that key are no-ops.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use image::DynamicImage;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::key::ImageKey;

/// Opaque handle identifying one `load` call, used only for `cancel`.
///
/// Tokens are unique for the lifetime of the process and carry no data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestToken(pub(crate) u64);

impl fmt::Display for RequestToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Sender half of one request's delivery channel.
pub(crate) type DeliverySender = oneshot::Sender<Option<Arc<DynamicImage>>>;

struct InFlight {
    waiters: HashMap<RequestToken, DeliverySender>,
    cancel: CancellationToken,
}

/// Outcome of [`InFlightRegistry::begin_or_join`].
pub(crate) enum Registration {
    /// No operation was outstanding; the caller owns starting one and must
    /// watch `cancel` for abort.
    New {
        token: RequestToken,
        cancel: CancellationToken,
    },
    /// An operation is already in flight; the caller must not start a
    /// second one.
    Joined { token: RequestToken },
}

/// Tracks outstanding fetches per cache key.
pub(crate) struct InFlightRegistry {
    inner: Mutex<HashMap<ImageKey, InFlight>>,
    next_token: AtomicU64,
}

impl InFlightRegistry {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(0),
        }
    }

    /// Allocates a token without registering it.
    ///
    /// Used for requests satisfied straight from cache; cancelling such a
    /// token is a no-op because it never enters the registry.
    pub(crate) fn issue_token(&self) -> RequestToken {
        RequestToken(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    /// Registers a waiter for `key`, starting a new operation if none is
    /// outstanding.
    ///
    /// This is the deduplication point: a `Joined` result means the
    /// caller's delivery is attached to the existing operation.
    pub(crate) fn begin_or_join(&self, key: &ImageKey, delivery: DeliverySender) -> Registration {
        let token = self.issue_token();
        let mut inner = self.inner.lock();
        match inner.get_mut(key) {
            Some(entry) => {
                entry.waiters.insert(token, delivery);
                trace!(key = %key, %token, waiters = entry.waiters.len(), "joined in-flight operation");
                Registration::Joined { token }
            }
            None => {
                let cancel = CancellationToken::new();
                let mut waiters = HashMap::new();
                waiters.insert(token, delivery);
                inner.insert(
                    key.clone(),
                    InFlight {
                        waiters,
                        cancel: cancel.clone(),
                    },
                );
                Registration::New { token, cancel }
            }
        }
    }

    /// Attaches a waiter to a key already fetching.
    ///
    /// Returns `None` (dropping `delivery`) when no operation is
    /// outstanding for `key`.
    #[allow(dead_code)]
    pub(crate) fn join(&self, key: &ImageKey, delivery: DeliverySender) -> Option<RequestToken> {
        let mut inner = self.inner.lock();
        let entry = inner.get_mut(key)?;
        let token = self.issue_token();
        entry.waiters.insert(token, delivery);
        Some(token)
    }

    /// Settles `key`, removing it and returning the surviving waiters.
    ///
    /// The caller delivers the operation's result to every returned
    /// sender. Completing an absent key returns no waiters.
    pub(crate) fn complete(&self, key: &ImageKey) -> Vec<DeliverySender> {
        let mut inner = self.inner.lock();
        match inner.remove(key) {
            Some(entry) => entry.waiters.into_values().collect(),
            None => Vec::new(),
        }
    }

    /// Removes exactly one waiter; returns how many remain for `key`.
    ///
    /// Removing the last waiter cancels the underlying operation and drops
    /// the key. Unknown keys and unknown tokens are no-ops, which makes
    /// cancellation after delivery safe.
    pub(crate) fn cancel_token(&self, key: &ImageKey, token: RequestToken) -> usize {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.get_mut(key) else {
            return 0;
        };
        if entry.waiters.remove(&token).is_none() {
            return entry.waiters.len();
        }
        let remaining = entry.waiters.len();
        if remaining == 0 {
            entry.cancel.cancel();
            inner.remove(key);
            trace!(key = %key, %token, "last waiter cancelled, aborting operation");
        } else {
            trace!(key = %key, %token, remaining, "waiter cancelled");
        }
        remaining
    }

    /// Number of keys with outstanding operations.
    pub(crate) fn in_flight(&self) -> usize {
        self.inner.lock().len()
    }
}
