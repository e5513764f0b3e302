//! Envelope shape, version, and freshness validation.
//!
//! Shape and version checks guard everything downstream of JSON
//! parsing; freshness checks bound the replay window that the nonce
//! cache has to cover.

use ai2ai_types::{Ai2AiError, Result, PROTO_VERSION};
use chrono::{DateTime, Utc};

use crate::envelope::Envelope;

/// Validates envelope shape and protocol version.
///
/// Checks, in order:
/// 1. `protoVersion` is in the configured allowlist.
/// 2. `from.agent` and `to.agent` are non-empty.
/// 3. A `nonce` is present for `"1.0"` envelopes (legacy `"0.1"`
///    envelopes may omit it).
/// 4. A present nonce is 32 hex characters.
///
/// # Errors
///
/// Returns [`Ai2AiError::InvalidEnvelope`] naming the violated rule.
pub fn validate_shape(envelope: &Envelope, version_allowlist: &[String]) -> Result<()> {
    if !version_allowlist.iter().any(|v| v == &envelope.proto_version) {
        return Err(Ai2AiError::InvalidEnvelope {
            reason: format!(
                "unsupported protocol version '{}' (accepted: {})",
                envelope.proto_version,
                version_allowlist.join(", "),
            ),
        });
    }

    if envelope.from.agent.as_str().is_empty() {
        return Err(Ai2AiError::InvalidEnvelope {
            reason: "from.agent must not be empty".into(),
        });
    }

    if envelope.to.agent.as_str().is_empty() {
        return Err(Ai2AiError::InvalidEnvelope {
            reason: "to.agent must not be empty".into(),
        });
    }

    match &envelope.nonce {
        Some(nonce) => {
            if nonce.len() != 32 || !nonce.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(Ai2AiError::InvalidEnvelope {
                    reason: "nonce must be 32 hex characters".into(),
                });
            }
        }
        None => {
            // Only the legacy version may omit the nonce.
            if envelope.proto_version == PROTO_VERSION {
                return Err(Ai2AiError::InvalidEnvelope {
                    reason: "nonce is required for protocol version 1.0".into(),
                });
            }
        }
    }

    // The timestamp must at least parse; freshness is checked
    // separately so expiry maps to its own wire reason.
    envelope.timestamp_utc()?;
    if envelope.expires_at.is_some() {
        envelope.expires_at_utc()?;
    }

    Ok(())
}

/// Validates envelope freshness against the message TTL.
///
/// An envelope is fresh when its timestamp lies within
/// `[now - ttl_ms, now + skew]` and, if `expiresAt` is present, the
/// expiry has not passed. A small forward skew tolerates clock drift
/// between peers.
///
/// # Errors
///
/// Returns [`Ai2AiError::MessageExpired`] naming the violated bound.
pub fn validate_freshness(envelope: &Envelope, ttl_ms: u64, now: DateTime<Utc>) -> Result<()> {
    // Tolerated forward clock drift.
    const FORWARD_SKEW_MS: i64 = 120_000;

    let timestamp = envelope.timestamp_utc()?;
    let age_ms = now.signed_duration_since(timestamp).num_milliseconds();

    if age_ms > ttl_ms as i64 {
        return Err(Ai2AiError::MessageExpired {
            reason: format!("envelope is {age_ms} ms old, TTL is {ttl_ms} ms"),
        });
    }

    if age_ms < -FORWARD_SKEW_MS {
        return Err(Ai2AiError::MessageExpired {
            reason: format!("envelope timestamp is {} ms in the future", -age_ms),
        });
    }

    if let Some(expires) = envelope.expires_at_utc()? {
        if now >= expires {
            return Err(Ai2AiError::MessageExpired {
                reason: format!("envelope expired at {expires}"),
            });
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{EnvelopeBuilder, Party};
    use ai2ai_types::{AgentId, ConversationId, EnvelopeType};

    fn allowlist() -> Vec<String> {
        vec!["1.0".to_owned(), "0.1".to_owned()]
    }

    fn test_envelope() -> Envelope {
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
    fn fresh_envelope_passes() -> std::result::Result<(), Ai2AiError> {
        let env = test_envelope();
        validate_shape(&env, &allowlist())?;
        validate_freshness(&env, 86_400_000, Utc::now())
    }

    #[test]
    fn unknown_version_rejected() {
        let mut env = test_envelope();
        env.proto_version = "2.0".into();
        assert!(validate_shape(&env, &allowlist()).is_err());
    }

    #[test]
    fn legacy_version_without_nonce_accepted() -> std::result::Result<(), Ai2AiError> {
        let mut env = test_envelope();
        env.proto_version = "0.1".into();
        env.nonce = None;
        validate_shape(&env, &allowlist())
    }

    #[test]
    fn current_version_requires_nonce() {
        let mut env = test_envelope();
        env.nonce = None;
        assert!(validate_shape(&env, &allowlist()).is_err());
    }

    #[test]
    fn malformed_nonce_rejected() {
        let mut env = test_envelope();
        env.nonce = Some("not-hex".into());
        assert!(validate_shape(&env, &allowlist()).is_err());
    }

    #[test]
    fn empty_sender_rejected() {
        let mut env = test_envelope();
        env.from.agent = AgentId::new("");
        assert!(validate_shape(&env, &allowlist()).is_err());
    }

    #[test]
    fn stale_envelope_rejected() {
        let mut env = test_envelope();
        env.timestamp = (Utc::now() - chrono::Duration::hours(25)).to_rfc3339();

        let result = validate_freshness(&env, 86_400_000, Utc::now());
        assert!(matches!(result, Err(Ai2AiError::MessageExpired { .. })));
    }

    #[test]
    fn far_future_timestamp_rejected() {
        let mut env = test_envelope();
        env.timestamp = (Utc::now() + chrono::Duration::hours(1)).to_rfc3339();

        let result = validate_freshness(&env, 86_400_000, Utc::now());
        assert!(matches!(result, Err(Ai2AiError::MessageExpired { .. })));
    }

    #[test]
    fn slight_forward_skew_tolerated() -> std::result::Result<(), Ai2AiError> {
        let mut env = test_envelope();
        env.timestamp = (Utc::now() + chrono::Duration::seconds(30)).to_rfc3339();
        validate_freshness(&env, 86_400_000, Utc::now())
    }

    #[test]
    fn explicit_expiry_honored() {
        let mut env = test_envelope();
        env.expires_at = Some((Utc::now() - chrono::Duration::seconds(1)).to_rfc3339());

        let result = validate_freshness(&env, 86_400_000, Utc::now());
        assert!(matches!(result, Err(Ai2AiError::MessageExpired { .. })));
    }

    #[test]
    fn garbage_timestamp_is_shape_error() {
        let mut env = test_envelope();
        env.timestamp = "yesterday".into();
        assert!(matches!(
            validate_shape(&env, &allowlist()),
            Err(Ai2AiError::InvalidEnvelope { .. }),
        ));
    }
}
