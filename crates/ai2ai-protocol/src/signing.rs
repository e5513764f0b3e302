//! Envelope signing and verification.
//!
//! Signing covers the canonical bytes of [`crate::canonical`].
//! Verification accepts a list of candidate public keys — the peer's
//! current key plus any archived rotation keys — because envelopes
//! signed with an outgoing key may still be in flight when the key
//! changes.

use ai2ai_crypto::signing::{verify, Keypair, PublicKey, Signature};
use ai2ai_types::{Ai2AiError, Result};

use crate::canonical::signed_bytes;
use crate::envelope::Envelope;

/// Signs an envelope in place.
///
/// The signature is computed over the canonical bytes of whatever
/// payload the envelope currently carries — encrypt before signing.
///
/// # Errors
///
/// Returns [`Ai2AiError::InvalidEnvelope`] if canonicalization fails.
pub fn sign_envelope(envelope: &mut Envelope, keypair: &Keypair) -> Result<()> {
    let bytes = signed_bytes(envelope)?;
    let signature = keypair.sign(&bytes);
    envelope.signature = Some(signature.to_base64());
    Ok(())
}

/// Verifies an envelope signature against candidate public keys.
///
/// Candidates are tried in order; the first success wins. Callers
/// pass the sender's current key first, then archived rotation keys.
///
/// # Errors
///
/// - [`Ai2AiError::InvalidEnvelope`] when the envelope carries no
///   signature.
/// - [`Ai2AiError::InvalidSignature`] when no candidate verifies.
pub fn verify_envelope(envelope: &Envelope, candidates: &[PublicKey]) -> Result<()> {
    let encoded = envelope
        .signature
        .as_deref()
        .ok_or_else(|| Ai2AiError::InvalidEnvelope {
            reason: "envelope carries no signature".into(),
        })?;

    let signature = Signature::from_base64(encoded)?;
    let bytes = signed_bytes(envelope)?;

    for key in candidates {
        if verify(key, &bytes, &signature).is_ok() {
            return Ok(());
        }
    }

    Err(Ai2AiError::InvalidSignature {
        reason: format!(
            "signature from {} failed against {} candidate key(s)",
            envelope.from.agent,
            candidates.len(),
        ),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{EnvelopeBuilder, Party, Payload};
    use ai2ai_types::{AgentId, ConversationId, EnvelopeType};
    use serde_json::json;

    fn signed_test_envelope(keypair: &Keypair) -> Envelope {
        let mut env = EnvelopeBuilder::new(
            Party {
                agent: AgentId::new("alice.example"),
                human: "Alice".into(),
            },
            AgentId::new("bob.example"),
            ConversationId::generate(),
            EnvelopeType::Request,
        )
        .intent("schedule.meeting")
        .payload(json!({"proposed_times": ["2026-03-10T10:00Z"]}))
        .build();
        sign_envelope(&mut env, keypair).unwrap_or_else(|e| panic!("sign: {e}"));
        env
    }

    #[test]
    fn sign_verify_roundtrip() -> std::result::Result<(), Ai2AiError> {
        let kp = Keypair::from_seed(&[0xA1; 32]);
        let env = signed_test_envelope(&kp);
        verify_envelope(&env, &[kp.public_key()])
    }

    #[test]
    fn verification_succeeds_against_archived_key() -> std::result::Result<(), Ai2AiError> {
        let old = Keypair::from_seed(&[0xA1; 32]);
        let new = Keypair::from_seed(&[0xB2; 32]);
        let env = signed_test_envelope(&old);

        // Current key first, archived second — still verifies.
        verify_envelope(&env, &[new.public_key(), old.public_key()])
    }

    #[test]
    fn verification_fails_with_only_wrong_keys() {
        let signer = Keypair::from_seed(&[0xA1; 32]);
        let other = Keypair::from_seed(&[0xC3; 32]);
        let env = signed_test_envelope(&signer);

        assert!(verify_envelope(&env, &[other.public_key()]).is_err());
    }

    #[test]
    fn verification_fails_with_no_candidates() {
        let kp = Keypair::from_seed(&[0xA1; 32]);
        let env = signed_test_envelope(&kp);
        assert!(verify_envelope(&env, &[]).is_err());
    }

    #[test]
    fn missing_signature_is_shape_error() {
        let kp = Keypair::from_seed(&[0xA1; 32]);
        let mut env = signed_test_envelope(&kp);
        env.signature = None;

        let err = verify_envelope(&env, &[kp.public_key()]);
        assert!(matches!(err, Err(Ai2AiError::InvalidEnvelope { .. })));
    }

    // Every signed field, when mutated, must break verification.

    #[test]
    fn mutating_payload_breaks_signature() {
        let kp = Keypair::from_seed(&[0xA1; 32]);
        let mut env = signed_test_envelope(&kp);
        env.payload = Payload::Plain(json!({"proposed_times": ["2026-03-11T10:00Z"]}));
        assert!(verify_envelope(&env, &[kp.public_key()]).is_err());
    }

    #[test]
    fn mutating_id_breaks_signature() {
        let kp = Keypair::from_seed(&[0xA1; 32]);
        let mut env = signed_test_envelope(&kp);
        env.id = ai2ai_types::EnvelopeId::generate();
        assert!(verify_envelope(&env, &[kp.public_key()]).is_err());
    }

    #[test]
    fn mutating_timestamp_breaks_signature() {
        let kp = Keypair::from_seed(&[0xA1; 32]);
        let mut env = signed_test_envelope(&kp);
        env.timestamp = "2020-01-01T00:00:00+00:00".into();
        assert!(verify_envelope(&env, &[kp.public_key()]).is_err());
    }

    #[test]
    fn mutating_sender_breaks_signature() {
        let kp = Keypair::from_seed(&[0xA1; 32]);
        let mut env = signed_test_envelope(&kp);
        env.from.agent = AgentId::new("mallory.example");
        assert!(verify_envelope(&env, &[kp.public_key()]).is_err());
    }

    #[test]
    fn mutating_recipient_breaks_signature() {
        let kp = Keypair::from_seed(&[0xA1; 32]);
        let mut env = signed_test_envelope(&kp);
        env.to.agent = AgentId::new("mallory.example");
        assert!(verify_envelope(&env, &[kp.public_key()]).is_err());
    }

    #[test]
    fn mutating_conversation_breaks_signature() {
        let kp = Keypair::from_seed(&[0xA1; 32]);
        let mut env = signed_test_envelope(&kp);
        env.conversation = ConversationId::generate();
        assert!(verify_envelope(&env, &[kp.public_key()]).is_err());
    }

    #[test]
    fn mutating_type_breaks_signature() {
        let kp = Keypair::from_seed(&[0xA1; 32]);
        let mut env = signed_test_envelope(&kp);
        env.envelope_type = EnvelopeType::Confirm;
        assert!(verify_envelope(&env, &[kp.public_key()]).is_err());
    }

    #[test]
    fn mutating_intent_breaks_signature() {
        let kp = Keypair::from_seed(&[0xA1; 32]);
        let mut env = signed_test_envelope(&kp);
        env.intent = Some("commerce.request".into());
        assert!(verify_envelope(&env, &[kp.public_key()]).is_err());
    }

    #[test]
    fn mutating_unsigned_fields_preserves_signature() -> std::result::Result<(), Ai2AiError> {
        let kp = Keypair::from_seed(&[0xA1; 32]);
        let mut env = signed_test_envelope(&kp);

        // nonce, expiresAt, requiresHumanApproval are not signed.
        env.nonce = Some(crate::envelope::generate_nonce());
        env.expires_at = Some("2099-01-01T00:00:00+00:00".into());
        env.requires_human_approval = true;

        verify_envelope(&env, &[kp.public_key()])
    }
}
