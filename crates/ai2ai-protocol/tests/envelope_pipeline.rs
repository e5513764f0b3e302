//! Integration tests for the full envelope pipeline:
//! build → encrypt → sign → serialize → parse → verify → decrypt.
//!
//! All tests use deterministic Ed25519 keypairs (fixed seeds); the
//! X25519 identities are freshly generated because ephemeral
//! uniqueness is what matters, not determinism.

use ai2ai_crypto::ecdh::X25519StaticSecret;
use ai2ai_crypto::signing::Keypair;
use ai2ai_protocol::canonical::signed_bytes;
use ai2ai_protocol::e2e::{decrypt_payload, encrypt_payload};
use ai2ai_protocol::envelope::{Envelope, EnvelopeBuilder, Party, Payload};
use ai2ai_protocol::signing::{sign_envelope, verify_envelope};
use ai2ai_protocol::validation::{validate_freshness, validate_shape};
use ai2ai_types::{Ai2AiError, AgentId, ConversationId, EnvelopeType};
use chrono::Utc;
use serde_json::json;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn alice() -> Keypair {
    Keypair::from_seed(&[0xAA; 32])
}

fn allowlist() -> Vec<String> {
    vec!["1.0".to_owned(), "0.1".to_owned()]
}

fn request_envelope() -> Envelope {
    EnvelopeBuilder::new(
        Party {
            agent: AgentId::new("alice.example"),
            human: "Alice".into(),
        },
        AgentId::new("bob.example"),
        ConversationId::generate(),
        EnvelopeType::Request,
    )
    .intent("schedule.meeting")
    .payload(json!({
        "proposed_times": [
            "2026-03-10T10:00Z",
            "2026-03-10T14:00Z",
            "2026-03-11T09:00Z",
        ],
    }))
    .ttl_ms(86_400_000)
    .build()
}

// ---------------------------------------------------------------------------
// Signed-only pipeline
// ---------------------------------------------------------------------------

#[test]
fn signed_envelope_survives_wire_roundtrip() -> std::result::Result<(), Ai2AiError> {
    let kp = alice();
    let mut env = request_envelope();
    sign_envelope(&mut env, &kp)?;

    let wire = serde_json::to_string(&env).map_err(|e| Ai2AiError::Internal {
        reason: e.to_string(),
    })?;
    let received: Envelope = serde_json::from_str(&wire).map_err(|e| Ai2AiError::Internal {
        reason: e.to_string(),
    })?;

    validate_shape(&received, &allowlist())?;
    validate_freshness(&received, 86_400_000, Utc::now())?;
    verify_envelope(&received, &[kp.public_key()])
}

#[test]
fn canonical_bytes_identical_after_wire_roundtrip() -> std::result::Result<(), Ai2AiError> {
    let mut env = request_envelope();
    sign_envelope(&mut env, &alice())?;

    let wire = serde_json::to_string(&env).map_err(|e| Ai2AiError::Internal {
        reason: e.to_string(),
    })?;
    let received: Envelope = serde_json::from_str(&wire).map_err(|e| Ai2AiError::Internal {
        reason: e.to_string(),
    })?;

    assert_eq!(signed_bytes(&env)?, signed_bytes(&received)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Encrypted pipeline (sign-over-ciphertext)
// ---------------------------------------------------------------------------

#[test]
fn encrypted_envelope_roundtrip() -> std::result::Result<(), Ai2AiError> {
    let kp = alice();
    let bob_x = X25519StaticSecret::generate();

    let secret = json!({"item": "Widget", "budget": "500 GBP"});
    let mut env = request_envelope();
    env.intent = Some("commerce.request".into());
    env.payload = Payload::Encrypted(encrypt_payload(&secret, &bob_x.public_key())?);
    sign_envelope(&mut env, &kp)?;

    // The wire JSON never contains the plaintext.
    let wire = serde_json::to_string(&env).map_err(|e| Ai2AiError::Internal {
        reason: e.to_string(),
    })?;
    assert!(!wire.contains("Widget"));

    let received: Envelope = serde_json::from_str(&wire).map_err(|e| Ai2AiError::Internal {
        reason: e.to_string(),
    })?;

    // Signature verifies over the ciphertext, before decryption.
    verify_envelope(&received, &[kp.public_key()])?;

    let encrypted = match &received.payload {
        Payload::Encrypted(enc) => enc,
        Payload::Plain(_) => {
            return Err(Ai2AiError::Internal {
                reason: "payload lost its encryption on the wire".into(),
            })
        }
    };
    assert_eq!(decrypt_payload(encrypted, &bob_x)?, secret);
    Ok(())
}

#[test]
fn ciphertext_tampering_breaks_signature() -> std::result::Result<(), Ai2AiError> {
    let kp = alice();
    let bob_x = X25519StaticSecret::generate();

    let mut env = request_envelope();
    env.payload = Payload::Encrypted(encrypt_payload(&json!({"n": 1}), &bob_x.public_key())?);
    sign_envelope(&mut env, &kp)?;

    // Swap in a different ciphertext: the signature covers the final
    // (encrypted) payload, so verification must fail.
    env.payload = Payload::Encrypted(encrypt_payload(&json!({"n": 2}), &bob_x.public_key())?);
    assert!(verify_envelope(&env, &[kp.public_key()]).is_err());
    Ok(())
}

// ---------------------------------------------------------------------------
// Legacy version acceptance
// ---------------------------------------------------------------------------

#[test]
fn legacy_envelope_accepted_inbound() -> std::result::Result<(), Ai2AiError> {
    let kp = alice();
    let mut env = request_envelope();
    env.proto_version = "0.1".into();
    env.nonce = None;
    sign_envelope(&mut env, &kp)?;

    validate_shape(&env, &allowlist())?;
    verify_envelope(&env, &[kp.public_key()])
}

#[test]
fn strict_allowlist_rejects_legacy() -> std::result::Result<(), Ai2AiError> {
    let mut env = request_envelope();
    env.proto_version = "0.1".into();
    env.nonce = None;
    sign_envelope(&mut env, &alice())?;

    let strict = vec!["1.0".to_owned()];
    assert!(validate_shape(&env, &strict).is_err());
    Ok(())
}
