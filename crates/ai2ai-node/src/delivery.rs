//! Outbound HTTP delivery with retry, jittered backoff, and circuit
//! breaking.
//!
//! Interactive sends retry up to `max_retries` times with
//! `min(base · factor^i, max) · uniform(0.5, 1.0)` delays; every call
//! first asks the endpoint's circuit breaker for permission, so a
//! tripped breaker short-circuits the whole retry loop without
//! touching the network.

use std::sync::Arc;
use std::time::Duration;

use ai2ai_protocol::envelope::Envelope;
use ai2ai_types::{Ai2AiError, Result, PROTO_VERSION};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::breaker::{BreakerRegistry, BreakerTransition};
use crate::events::{EventBus, NodeEvent};

/// Protocol version header carried on every envelope submission.
pub const VERSION_HEADER: &str = "X-AI2AI-Version";

// ---------------------------------------------------------------------------
// RetryConfig
// ---------------------------------------------------------------------------

/// Interactive retry tuning.
#[derive(Clone, Copy, Debug)]
pub struct RetryConfig {
    /// First-retry delay.
    pub base_delay: Duration,
    /// Multiplier applied per attempt.
    pub factor: u32,
    /// Delay ceiling.
    pub max_delay: Duration,
    /// Retries after the initial attempt.
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            factor: 2,
            max_delay: Duration::from_secs(30),
            max_retries: 3,
        }
    }
}

impl RetryConfig {
    /// Jittered delay before retry attempt `i`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.factor.saturating_pow(attempt.min(20));
        let raw = self
            .base_delay
            .saturating_mul(exp)
            .min(self.max_delay);
        raw.mul_f64(rand::thread_rng().gen_range(0.5..1.0))
    }
}

// ---------------------------------------------------------------------------
// PeerResponse
// ---------------------------------------------------------------------------

/// Structured body of a peer's `POST /ai2ai` response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerResponse {
    /// Wire status, e.g. `ok`, `pending_approval`, `duplicate`.
    pub status: String,
    /// Envelope id echoed back, if any.
    #[serde(default)]
    pub id: Option<String>,
    /// Failure reason for error statuses.
    #[serde(default)]
    pub reason: Option<String>,
    /// Conversation id echoed back, if any.
    #[serde(default)]
    pub conversation: Option<String>,
    /// Synchronous payload (ping answers carry one).
    #[serde(default)]
    pub payload: Option<Value>,
    /// Response envelope type, when the peer answers synchronously.
    #[serde(default, rename = "type")]
    pub response_type: Option<String>,
}

// ---------------------------------------------------------------------------
// DeliveryEngine
// ---------------------------------------------------------------------------

/// Drives outbound envelope submission.
pub struct DeliveryEngine {
    client: reqwest::Client,
    breakers: BreakerRegistry,
    retry: RetryConfig,
    events: Arc<EventBus>,
}

impl DeliveryEngine {
    /// Creates an engine.
    ///
    /// # Errors
    ///
    /// Returns [`Ai2AiError::Config`] if the HTTP client cannot be
    /// constructed.
    pub fn new(
        timeout: Duration,
        retry: RetryConfig,
        breakers: BreakerRegistry,
        events: Arc<EventBus>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Ai2AiError::Config {
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            breakers,
            retry,
            events,
        })
    }

    /// Submits an envelope once: breaker check, then one HTTP POST.
    ///
    /// # Errors
    ///
    /// - [`Ai2AiError::CircuitOpen`] without touching the network.
    /// - [`Ai2AiError::Transport`] for retryable failures
    ///   (connection, timeout, 5xx).
    /// - The mapped protocol error for 4xx rejections.
    pub async fn deliver_once(&self, endpoint: &str, envelope: &Envelope) -> Result<PeerResponse> {
        let breaker = self.breakers.for_endpoint(endpoint);
        breaker.acquire()?;

        let outcome = self.post(endpoint, envelope).await;

        let transition = match &outcome {
            Ok(_) => breaker.record_success(),
            // Only transport-class failures count against the
            // breaker; a 4xx rejection proves the peer is healthy.
            Err(e) if e.is_retryable() => breaker.record_failure(),
            Err(_) => breaker.record_success(),
        };
        match transition {
            Some(BreakerTransition::Opened) => {
                tracing::warn!(endpoint, "circuit breaker opened");
                self.events.emit(&NodeEvent::CircuitOpen {
                    endpoint: endpoint.to_owned(),
                });
            }
            Some(BreakerTransition::Closed) => {
                tracing::info!(endpoint, "circuit breaker closed");
                self.events.emit(&NodeEvent::CircuitClosed {
                    endpoint: endpoint.to_owned(),
                });
            }
            None => {}
        }

        outcome
    }

    /// Submits an envelope with the interactive retry schedule.
    ///
    /// Retries only transport-class failures; protocol rejections and
    /// an open breaker surface immediately.
    pub async fn deliver(&self, endpoint: &str, envelope: &Envelope) -> Result<PeerResponse> {
        let mut last_err: Option<Ai2AiError> = None;

        for attempt in 0..=self.retry.max_retries {
            if attempt > 0 {
                tokio::time::sleep(self.retry.delay_for_attempt(attempt - 1)).await;
            }

            match self.deliver_once(endpoint, envelope).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() => {
                    tracing::debug!(
                        endpoint,
                        attempt,
                        error = %e,
                        "delivery attempt failed"
                    );
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or(Ai2AiError::Transport {
            reason: "delivery failed with no recorded error".into(),
        }))
    }

    /// One raw HTTP POST, with response classification.
    async fn post(&self, endpoint: &str, envelope: &Envelope) -> Result<PeerResponse> {
        let response = self
            .client
            .post(endpoint)
            .header(VERSION_HEADER, PROTO_VERSION)
            .json(envelope)
            .send()
            .await
            .map_err(|e| Ai2AiError::Transport {
                reason: format!("request to {endpoint} failed: {e}"),
            })?;

        let status = response.status();

        if status.is_server_error() {
            return Err(Ai2AiError::Transport {
                reason: format!("{endpoint} answered {status}"),
            });
        }

        let body: PeerResponse = response.json().await.map_err(|e| Ai2AiError::Transport {
            reason: format!("unparseable response from {endpoint}: {e}"),
        })?;

        if status.is_success() {
            return Ok(body);
        }

        // 4xx: the peer rejected the envelope for a protocol reason.
        Err(map_rejection(
            body.reason.as_deref().unwrap_or("unknown"),
            endpoint,
        ))
    }
}

/// Maps a peer's wire rejection reason onto the error taxonomy.
fn map_rejection(reason: &str, endpoint: &str) -> Ai2AiError {
    let detail = format!("{endpoint} rejected envelope: {reason}");
    match reason {
        "invalid_envelope" => Ai2AiError::InvalidEnvelope { reason: detail },
        "invalid_signature" => Ai2AiError::InvalidSignature { reason: detail },
        "message_expired" => Ai2AiError::MessageExpired { reason: detail },
        "replay_detected" => Ai2AiError::ReplayDetected { reason: detail },
        "blocked" => Ai2AiError::Blocked { reason: detail },
        "rate_limited" => Ai2AiError::RateLimited { reason: detail },
        "decryption_failed" => Ai2AiError::DecryptionFailed { reason: detail },
        _ => Ai2AiError::Internal { reason: detail },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;
    use ai2ai_protocol::envelope::{EnvelopeBuilder, Party};
    use ai2ai_types::{AgentId, ConversationId, EnvelopeType};

    fn engine(retry: RetryConfig) -> DeliveryEngine {
        DeliveryEngine::new(
            Duration::from_millis(500),
            retry,
            BreakerRegistry::new(BreakerConfig::default()),
            Arc::new(EventBus::new()),
        )
        .unwrap_or_else(|e| panic!("engine: {e}"))
    }

    fn envelope() -> Envelope {
        EnvelopeBuilder::new(
            Party {
                agent: AgentId::new("alice.example"),
                human: "Alice".into(),
            },
            AgentId::new("bob.example"),
            ConversationId::generate(),
            EnvelopeType::Message,
        )
        .build()
    }

    #[test]
    fn backoff_is_bounded_and_jittered() {
        let retry = RetryConfig::default();

        for attempt in 0..10 {
            let delay = retry.delay_for_attempt(attempt);
            assert!(delay <= retry.max_delay);
            // Jitter floor: half the un-jittered value, which itself
            // is at least base_delay / 2 for attempt 0.
            if attempt == 0 {
                assert!(delay >= retry.base_delay / 2);
            }
        }
    }

    #[test]
    fn backoff_grows_with_attempts() {
        let retry = RetryConfig {
            base_delay: Duration::from_millis(100),
            factor: 2,
            max_delay: Duration::from_secs(60),
            max_retries: 5,
        };

        // Jitter is 0.5..1.0, so attempt 3's floor (0.5 · 800 ms)
        // exceeds attempt 0's ceiling (1.0 · 100 ms).
        let early = retry.delay_for_attempt(0);
        let late = retry.delay_for_attempt(3);
        assert!(late > early);
    }

    #[test]
    fn rejection_mapping_covers_wire_reasons() {
        assert!(matches!(
            map_rejection("blocked", "http://b/ai2ai"),
            Ai2AiError::Blocked { .. },
        ));
        assert!(matches!(
            map_rejection("replay_detected", "http://b/ai2ai"),
            Ai2AiError::ReplayDetected { .. },
        ));
        assert!(matches!(
            map_rejection("something_else", "http://b/ai2ai"),
            Ai2AiError::Internal { .. },
        ));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_transport_error() {
        let engine = engine(RetryConfig {
            base_delay: Duration::from_millis(1),
            factor: 2,
            max_delay: Duration::from_millis(5),
            max_retries: 1,
        });

        // Port 1 is never listening.
        let result = engine.deliver("http://127.0.0.1:1/ai2ai", &envelope()).await;
        assert!(matches!(result, Err(Ai2AiError::Transport { .. })));
    }

    #[tokio::test]
    async fn repeated_failures_trip_breaker() {
        let engine = DeliveryEngine::new(
            Duration::from_millis(200),
            RetryConfig {
                base_delay: Duration::from_millis(1),
                factor: 1,
                max_delay: Duration::from_millis(2),
                max_retries: 0,
            },
            BreakerRegistry::new(BreakerConfig {
                failure_threshold: 5,
                reset_timeout: Duration::from_secs(60),
                half_open_max: 1,
            }),
            Arc::new(EventBus::new()),
        )
        .unwrap_or_else(|e| panic!("engine: {e}"));

        let endpoint = "http://127.0.0.1:1/ai2ai";
        let env = envelope();

        for _ in 0..5 {
            let result = engine.deliver_once(endpoint, &env).await;
            assert!(matches!(result, Err(Ai2AiError::Transport { .. })));
        }

        // Sixth call: rejected by the breaker, not the network.
        let result = engine.deliver_once(endpoint, &env).await;
        assert!(matches!(result, Err(Ai2AiError::CircuitOpen { .. })));
    }
}
