//! Per-envelope delivery tracker.
//!
//! Tracks each outbound envelope through
//! `sent → delivered → read`, or `failed`. Transitions are monotonic:
//! a `delivered` report can never regress an envelope that is already
//! `read`, and duplicate reports are absorbed so each stage produces
//! at most one event.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use ai2ai_types::{EnvelopeId, ReceiptStatus};
use lru::LruCache;

/// Maximum envelopes tracked; old entries fall off the LRU.
const TRACKER_CAPACITY: usize = 10_000;

/// Rank used to enforce forward-only transitions.
fn rank(status: ReceiptStatus) -> u8 {
    match status {
        ReceiptStatus::Sent => 0,
        ReceiptStatus::Delivered => 1,
        ReceiptStatus::Read => 2,
        ReceiptStatus::Failed => 3,
    }
}

// ---------------------------------------------------------------------------
// DeliveryTracker
// ---------------------------------------------------------------------------

/// Thread-safe delivery state tracker.
pub struct DeliveryTracker {
    inner: Mutex<LruCache<EnvelopeId, ReceiptStatus>>,
}

impl Default for DeliveryTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl DeliveryTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        let cap = NonZeroUsize::new(TRACKER_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Advances an envelope to `status`.
    ///
    /// Returns `true` when the state actually moved forward — the
    /// caller emits the matching event exactly when this returns
    /// `true`. `failed` is terminal but only reachable from
    /// `sent`/`delivered`; a `read` envelope cannot fail.
    pub fn advance(&self, id: EnvelopeId, status: ReceiptStatus) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            return false;
        };

        match inner.get(&id).copied() {
            None => {
                inner.put(id, status);
                true
            }
            Some(current) => {
                let forward = rank(status) > rank(current)
                    && !(current == ReceiptStatus::Read && status == ReceiptStatus::Failed);
                if forward {
                    inner.put(id, status);
                }
                forward
            }
        }
    }

    /// Current status of an envelope, if tracked.
    pub fn status(&self, id: &EnvelopeId) -> Option<ReceiptStatus> {
        self.inner.lock().ok()?.get(id).copied()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
