//! Signature verification cache.
//!
//! Ed25519 verification is the most expensive step of the ingress
//! filter chain. Identical `(signature, public key)` pairs verify to
//! the same result, so results are cached for a short TTL keyed on
//! `SHA-256(signature || public_key)`. Bounded LRU keeps memory flat
//! under signature-flood traffic.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use sha2::{Digest, Sha256};

/// Default cache capacity.
pub const DEFAULT_VERIFY_CACHE_CAPACITY: usize = 10_000;

/// Default result TTL (5 minutes).
pub const DEFAULT_VERIFY_CACHE_TTL: Duration = Duration::from_secs(300);

// ---------------------------------------------------------------------------
// VerifyCache
// ---------------------------------------------------------------------------

/// Bounded TTL cache of verification outcomes.
pub struct VerifyCache {
    entries: LruCache<[u8; 32], (bool, Instant)>,
    ttl: Duration,
}

impl VerifyCache {
    /// Creates a cache with the given capacity and TTL.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(cap),
            ttl,
        }
    }

    /// Creates a cache with the protocol defaults.
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_VERIFY_CACHE_CAPACITY, DEFAULT_VERIFY_CACHE_TTL)
    }

    /// Cache key for a `(signature, public key)` pair.
    pub fn key(signature: &[u8], public_key: &[u8]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(signature);
        hasher.update(public_key);
        hasher.finalize().into()
    }

    /// Returns the cached outcome, if present and fresh.
    pub fn get(&mut self, key: &[u8; 32]) -> Option<bool> {
        let entry = self.entries.get(key).copied();
        match entry {
            Some((outcome, inserted)) if inserted.elapsed() <= self.ttl => Some(outcome),
            Some(_) => {
                self.entries.pop(key);
                None
            }
            None => None,
        }
    }

    /// Records a verification outcome.
    pub fn put(&mut self, key: [u8; 32], outcome: bool) {
        self.entries.put(key, (outcome, Instant::now()));
    }

    /// Number of cached outcomes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
