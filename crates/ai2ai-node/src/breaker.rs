//! Per-endpoint circuit breaker.
//!
//! One breaker guards each endpoint URL. State machine:
//!
//! ```text
//!            ≥ failure_threshold consecutive failures
//! closed ────────────────────────────────────────────▶ open
//!   ▲                                                    │
//!   │ probe success                reset_timeout elapsed │
//!   └──────────── half-open ◀────────────────────────────┘
//!                     │ probe failure
//!                     └──────▶ open (timer restarted)
//! ```
//!
//! While `open`, every acquire is rejected without touching the
//! network; `half-open` admits at most `half_open_max` concurrent
//! probes. All checks and counter updates happen under one mutex per
//! breaker, so concurrent callers cannot slip extra calls through.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ai2ai_types::{Ai2AiError, Result};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Breaker tuning knobs.
#[derive(Clone, Copy, Debug)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker.
    pub failure_threshold: u32,
    /// How long `open` lasts before probing.
    pub reset_timeout: Duration,
    /// Concurrent probes admitted while `half-open`.
    pub half_open_max: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            half_open_max: 1,
        }
    }
}

/// Observable breaker state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// State change produced by recording an outcome; callers emit the
/// matching node event.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BreakerTransition {
    Opened,
    Closed,
}

// ---------------------------------------------------------------------------
// CircuitBreaker
// ---------------------------------------------------------------------------

struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probes_inflight: u32,
}

/// Circuit breaker for a single endpoint.
pub struct CircuitBreaker {
    endpoint: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Creates a closed breaker for `endpoint`.
    pub fn new(endpoint: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            endpoint: endpoint.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probes_inflight: 0,
            }),
        }
    }

    /// Asks permission to make one call.
    ///
    /// # Errors
    ///
    /// Returns [`Ai2AiError::CircuitOpen`] while the breaker is open
    /// or half-open with all probe slots taken. The caller MUST
    /// report the call's outcome via [`record_success`] /
    /// [`record_failure`] when acquire succeeds.
    ///
    /// [`record_success`]: Self::record_success
    /// [`record_failure`]: Self::record_failure
    pub fn acquire(&self) -> Result<()> {
        let mut inner = self.lock()?;

        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed < self.config.reset_timeout {
                    return Err(Ai2AiError::CircuitOpen {
                        endpoint: self.endpoint.clone(),
                    });
                }
                // Timer elapsed: admit this caller as the first probe.
                inner.state = BreakerState::HalfOpen;
                inner.probes_inflight = 1;
                tracing::debug!(endpoint = %self.endpoint, "circuit breaker half-open");
                Ok(())
            }
            BreakerState::HalfOpen => {
                if inner.probes_inflight < self.config.half_open_max {
                    inner.probes_inflight += 1;
                    Ok(())
                } else {
                    Err(Ai2AiError::CircuitOpen {
                        endpoint: self.endpoint.clone(),
                    })
                }
            }
        }
    }

    /// Records a successful call.
    pub fn record_success(&self) -> Option<BreakerTransition> {
        let Ok(mut inner) = self.lock() else {
            return None;
        };

        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures = 0;
                None
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Closed;
                inner.consecutive_failures = 0;
                inner.probes_inflight = 0;
                inner.opened_at = None;
                Some(BreakerTransition::Closed)
            }
            BreakerState::Open => None,
        }
    }

    /// Records a failed call.
    pub fn record_failure(&self) -> Option<BreakerTransition> {
        let Ok(mut inner) = self.lock() else {
            return None;
        };

        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    Some(BreakerTransition::Opened)
                } else {
                    None
                }
            }
            BreakerState::HalfOpen => {
                // Failed probe: reopen and restart the timer.
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.probes_inflight = 0;
                Some(BreakerTransition::Opened)
            }
            BreakerState::Open => None,
        }
    }

    /// Current state snapshot.
    pub fn state(&self) -> BreakerState {
        self.lock().map(|inner| inner.state).unwrap_or(BreakerState::Open)
    }

    /// The guarded endpoint.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BreakerInner>> {
        self.inner.lock().map_err(|e| Ai2AiError::Internal {
            reason: format!("breaker lock poisoned: {e}"),
        })
    }
}

// ---------------------------------------------------------------------------
// BreakerRegistry
// ---------------------------------------------------------------------------

/// Lazily creates one breaker per endpoint URL.
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    /// Creates a registry applying `config` to every new breaker.
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the breaker for `endpoint`, creating it when first
    /// seen.
    pub fn for_endpoint(&self, endpoint: &str) -> Arc<CircuitBreaker> {
        let mut breakers = match self.breakers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(breakers.entry(endpoint.to_owned()).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(endpoint, self.config))
        }))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
