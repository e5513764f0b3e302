//! Per-peer sliding-window rate limiter.
//!
//! Each sender gets an independent window of recent arrival times.
//! A message is admitted when fewer than `limit` messages arrived in
//! the preceding `window`. Buckets idle for more than twice the
//! window are evicted on a periodic sweep so the table stays bounded.
//!
//! Thread-safe via `std::sync::Mutex` — the lock is held only for the
//! queue trim and push.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use ai2ai_types::{Ai2AiError, AgentId, Result};

/// Minimum interval between bucket-eviction sweeps.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// RateLimiter
// ---------------------------------------------------------------------------

/// Sliding-window rate limiter keyed on sender agent id.
pub struct RateLimiter {
    inner: Mutex<Inner>,
    /// Messages admitted per window per sender.
    limit: u32,
    /// Window length.
    window: Duration,
}

struct Inner {
    buckets: HashMap<AgentId, VecDeque<Instant>>,
    last_cleanup: Instant,
}

impl RateLimiter {
    /// Creates a limiter admitting `limit` messages per `window`.
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                buckets: HashMap::new(),
                last_cleanup: Instant::now(),
            }),
            limit,
            window,
        }
    }

    /// Creates a limiter with the protocol default: `per_min`
    /// messages per 60 seconds.
    pub fn per_minute(per_min: u32) -> Self {
        Self::new(per_min, Duration::from_secs(60))
    }

    /// Admits or rejects one message from `sender`.
    ///
    /// # Errors
    ///
    /// Returns [`Ai2AiError::RateLimited`] when the window is full.
    pub fn check(&self, sender: &AgentId) -> Result<()> {
        let mut inner = self.inner.lock().map_err(|e| Ai2AiError::Internal {
            reason: format!("rate limiter lock poisoned: {e}"),
        })?;

        let now = Instant::now();
        self.maybe_cleanup(&mut inner, now);

        let bucket = inner.buckets.entry(sender.clone()).or_default();

        // Trim arrivals that slid out of the window.
        while let Some(front) = bucket.front() {
            if now.duration_since(*front) > self.window {
                bucket.pop_front();
            } else {
                break;
            }
        }

        if bucket.len() >= self.limit as usize {
            return Err(Ai2AiError::RateLimited {
                reason: format!(
                    "sender {sender} exceeded {} messages per {} s",
                    self.limit,
                    self.window.as_secs(),
                ),
            });
        }

        bucket.push_back(now);
        Ok(())
    }

    /// Evicts buckets idle for more than twice the window.
    fn maybe_cleanup(&self, inner: &mut Inner, now: Instant) {
        if now.duration_since(inner.last_cleanup) < CLEANUP_INTERVAL {
            return;
        }
        inner.last_cleanup = now;

        let expiry = self.window * 2;
        inner.buckets.retain(|_, bucket| {
            bucket
                .back()
                .is_some_and(|last| now.duration_since(*last) <= expiry)
        });
    }

    /// Number of currently tracked senders.
    pub fn tracked_senders(&self) -> usize {
        self.inner.lock().map(|inner| inner.buckets.len()).unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
