//! Bounded envelope-id deduplication cache.
//!
//! Backed by a fixed-capacity LRU so memory stays bounded regardless
//! of throughput, with a per-entry TTL so an id seen long ago (and
//! since expired) is treated as new. Dedup is authoritative for
//! at-most-once event emission: an id already present means the
//! envelope was fully processed and the response is `duplicate`.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use ai2ai_types::EnvelopeId;
use lru::LruCache;

/// Default maximum tracked envelope ids.
pub const DEFAULT_DEDUP_CAPACITY: usize = 10_000;

/// Default per-entry lifetime (1 hour).
pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(3600);

// ---------------------------------------------------------------------------
// DedupCache
// ---------------------------------------------------------------------------

/// LRU cache of recently processed envelope ids.
pub struct DedupCache {
    entries: LruCache<EnvelopeId, Instant>,
    ttl: Duration,
}

impl DedupCache {
    /// Creates a cache with the given capacity and entry TTL.
    ///
    /// A capacity of 0 is treated as 1 so at least one id can be
    /// tracked.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(cap),
            ttl,
        }
    }

    /// Creates a cache with the protocol defaults (10 000 entries,
    /// 1 hour TTL).
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_DEDUP_CAPACITY, DEFAULT_DEDUP_TTL)
    }

    /// Returns `true` when `id` was already processed within the TTL.
    ///
    /// Read-only: envelopes that fail later pipeline stages must not
    /// poison the dedup table, so recording happens separately via
    /// [`mark_processed`](Self::mark_processed) after success.
    pub fn is_duplicate(&mut self, id: &EnvelopeId) -> bool {
        let now = Instant::now();
        match self.entries.get(id).copied() {
            Some(inserted) if now.duration_since(inserted) <= self.ttl => true,
            Some(_) => {
                // Expired entry: treat as new.
                self.entries.pop(id);
                false
            }
            None => false,
        }
    }

    /// Records `id` as fully processed.
    pub fn mark_processed(&mut self, id: EnvelopeId) {
        self.entries.put(id, Instant::now());
    }

    /// Checks and records in one step, for callers without a
    /// success/failure split.
    pub fn check_and_insert(&mut self, id: EnvelopeId) -> bool {
        if self.is_duplicate(&id) {
            return true;
        }
        self.mark_processed(id);
        false
    }

    /// Number of ids currently tracked.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` when nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
