//! Inbound HTTP pipeline.
//!
//! Routes:
//!
//! - `GET /ai2ai/health` — liveness + advertised intents
//! - `GET /.well-known/ai2ai.json` — discovery descriptor
//! - `POST /ai2ai` — envelope submission
//!
//! Submission runs the security filter chain in its normative order
//! (blocklist → rate limit → expiry → nonce replay → shape →
//! signature → dedup), decrypts, appends to the conversation log, and
//! routes by envelope type. The rate limit runs before any
//! cryptography; dedup runs after signature verification so
//! unverified replays cannot poison the dedup table, and the table is
//! only updated once processing succeeds.

use std::sync::Arc;

use ai2ai_protocol::envelope::{Envelope, Payload, ReceiptPayload};
use ai2ai_protocol::signing::verify_envelope;
use ai2ai_protocol::validation::{validate_freshness, validate_shape};
use ai2ai_crypto::signing::PublicKey;
use ai2ai_types::{
    Ai2AiError, ConversationState, EnvelopeType, ReceiptStatus, Result, PROTO_VERSION,
};
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{body::Bytes, Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use serde_json::{json, Value};

use crate::discovery::WellKnownDescriptor;
use crate::egress::{self, SendOptions};
use crate::events::NodeEvent;
use crate::intents::{HandlerOutcome, IntentRequest};
use crate::node::NodeInner;
use crate::verify_cache::VerifyCache;

/// Envelope submissions above this size are refused with 413.
const MAX_BODY_BYTES: usize = 100 * 1024;

type Reply = (StatusCode, Json<Value>);

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Builds the node's HTTP router.
pub(crate) fn router(state: Arc<NodeInner>) -> Router {
    Router::new()
        .route("/ai2ai", post(submit))
        .route("/ai2ai/health", get(health))
        .route("/.well-known/ai2ai.json", get(well_known))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// GET handlers
// ---------------------------------------------------------------------------

async fn health(State(inner): State<Arc<NodeInner>>) -> Json<Value> {
    Json(json!({
        "status": "online",
        "protocol": PROTO_VERSION,
        "agent": inner.config.name,
        "intents": inner.intents.names(),
    }))
}

async fn well_known(State(inner): State<Arc<NodeInner>>) -> Reply {
    let (public_key, fingerprint) = match inner.keys.read() {
        Ok(keys) => (
            keys.signing_keys().public_key().to_hex(),
            keys.fingerprint(),
        ),
        Err(_) => {
            return internal_error("key store unavailable");
        }
    };

    let descriptor = WellKnownDescriptor {
        ai2ai: PROTO_VERSION.to_owned(),
        endpoint: egress::advertised_endpoint(&inner),
        agent: inner.config.name.clone(),
        human: inner.config.human_name.clone(),
        public_key,
        fingerprint,
        capabilities: inner.intents.names(),
        timezone: "UTC".to_owned(),
    };

    match serde_json::to_value(&descriptor) {
        Ok(value) => (StatusCode::OK, Json(value)),
        Err(_) => internal_error("descriptor serialization failed"),
    }
}

// ---------------------------------------------------------------------------
// POST /ai2ai
// ---------------------------------------------------------------------------

async fn submit(State(inner): State<Arc<NodeInner>>, body: Bytes) -> Reply {
    let envelope: Envelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::debug!(error = %e, "rejecting unparseable envelope");
            return error_reply(
                StatusCode::BAD_REQUEST,
                "invalid_envelope",
                Some("body is not a valid envelope"),
            );
        }
    };

    match handle_envelope(&inner, envelope).await {
        Ok(reply) => reply,
        Err(e) => map_error(e),
    }
}

/// The full filter chain plus routing. Any error short-circuits into
/// the HTTP mapping of [`map_error`].
async fn handle_envelope(inner: &Arc<NodeInner>, envelope: Envelope) -> Result<Reply> {
    let sender = envelope.from.agent.clone();

    // 1. Blocklist.
    if inner.contacts.is_blocked(&sender)? {
        return Err(Ai2AiError::Blocked {
            reason: sender.to_string(),
        });
    }

    // 2. Rate limit — before any crypto work.
    inner.rate_limiter.check(&sender)?;

    // 3. Expiry.
    validate_freshness(&envelope, inner.config.message_ttl_ms, Utc::now())?;

    // 4. Nonce replay.
    if let Some(nonce) = &envelope.nonce {
        let mut guard = inner.replay_guard.lock().map_err(|e| Ai2AiError::Internal {
            reason: format!("replay guard lock poisoned: {e}"),
        })?;
        guard.check_and_insert(&sender, nonce)?;
    }

    // 5. Shape and version.
    validate_shape(&envelope, &inner.config.version_allowlist)?;

    // 6. Signature — only when the sender's key is known. First
    // contact skips verification but may never be auto-approved.
    let candidate_keys = inner.contacts.verification_keys(&sender)?;
    let sender_verified = if candidate_keys.is_empty() {
        false
    } else {
        verify_with_cache(inner, &envelope, &candidate_keys)?;
        true
    };

    // 7. Dedup — after verify so unverified traffic cannot poison
    // the table. Read-only here; recorded after success.
    {
        let mut dedup = inner.dedup.lock().map_err(|e| Ai2AiError::Internal {
            reason: format!("dedup lock poisoned: {e}"),
        })?;
        if dedup.is_duplicate(&envelope.id) {
            tracing::debug!(id = %envelope.id, "duplicate envelope");
            return Ok((
                StatusCode::OK,
                Json(json!({ "status": "duplicate", "id": envelope.id.to_string() })),
            ));
        }
    }

    // Decrypt for processing; failure is a hard reject.
    let (envelope, payload) = decrypt_for_processing(inner, envelope)?;

    // Record and stamp activity. Receipts are pure acknowledgements
    // and open no conversation.
    if envelope.envelope_type != EnvelopeType::Receipt {
        inner.conversations.append_envelope(&envelope)?;
    }
    inner.contacts.touch(&sender)?;

    let reply = route_by_type(inner, &envelope, payload, sender_verified).await?;

    // Success: the id is now authoritative in the dedup table.
    {
        let mut dedup = inner.dedup.lock().map_err(|e| Ai2AiError::Internal {
            reason: format!("dedup lock poisoned: {e}"),
        })?;
        dedup.mark_processed(envelope.id);
    }

    inner.activity.record(
        "ingress",
        json!({
            "id": envelope.id.to_string(),
            "from": sender.to_string(),
            "type": envelope.envelope_type.as_str(),
        }),
    )?;

    Ok(reply)
}

// ---------------------------------------------------------------------------
// Signature verification with cache
// ---------------------------------------------------------------------------

/// Verifies against each candidate key, consulting the verification
/// cache per `(signature, key)` pair.
fn verify_with_cache(
    inner: &NodeInner,
    envelope: &Envelope,
    candidate_keys: &[String],
) -> Result<()> {
    let signature_b64 = envelope
        .signature
        .as_deref()
        .ok_or_else(|| Ai2AiError::InvalidEnvelope {
            reason: "envelope carries no signature".into(),
        })?;
    let signature_bytes = BASE64
        .decode(signature_b64)
        .map_err(|_| Ai2AiError::InvalidSignature {
            reason: "signature is not valid base64".into(),
        })?;

    let mut last_err = Ai2AiError::InvalidSignature {
        reason: format!("no valid key for {}", envelope.from.agent),
    };

    for key_hex in candidate_keys {
        let Ok(public_key) = PublicKey::from_hex(key_hex) else {
            continue;
        };
        let cache_key = VerifyCache::key(&signature_bytes, public_key.as_bytes());

        let cached = {
            let mut cache = inner.verify_cache.lock().map_err(|e| Ai2AiError::Internal {
                reason: format!("verify cache lock poisoned: {e}"),
            })?;
            cache.get(&cache_key)
        };

        let outcome = match cached {
            Some(outcome) => outcome,
            None => {
                let outcome = verify_envelope(envelope, &[public_key]).is_ok();
                let mut cache = inner.verify_cache.lock().map_err(|e| Ai2AiError::Internal {
                    reason: format!("verify cache lock poisoned: {e}"),
                })?;
                cache.put(cache_key, outcome);
                outcome
            }
        };

        if outcome {
            return Ok(());
        }
        last_err = Ai2AiError::InvalidSignature {
            reason: format!("signature from {} failed verification", envelope.from.agent),
        };
    }

    Err(last_err)
}

// ---------------------------------------------------------------------------
// Decryption
// ---------------------------------------------------------------------------

/// Decrypts an encrypted payload in place, returning the processed
/// envelope plus the plaintext payload value.
fn decrypt_for_processing(
    inner: &NodeInner,
    mut envelope: Envelope,
) -> Result<(Envelope, Value)> {
    match &envelope.payload {
        Payload::Plain(value) => {
            let value = value.clone();
            Ok((envelope, value))
        }
        Payload::Encrypted(encrypted) => {
            let keys = inner.keys.read().map_err(|e| Ai2AiError::Internal {
                reason: format!("key store lock poisoned: {e}"),
            })?;
            let plain = ai2ai_protocol::e2e::decrypt_payload(encrypted, keys.agreement_keys())?;
            envelope.payload = Payload::Plain(plain.clone());
            Ok((envelope, plain))
        }
    }
}

// ---------------------------------------------------------------------------
// Routing by type
// ---------------------------------------------------------------------------

async fn route_by_type(
    inner: &Arc<NodeInner>,
    envelope: &Envelope,
    payload: Value,
    sender_verified: bool,
) -> Result<Reply> {
    match envelope.envelope_type {
        EnvelopeType::Ping => handle_ping(inner, envelope, &payload),
        EnvelopeType::Request => handle_request(inner, envelope, payload, sender_verified).await,
        EnvelopeType::Response => handle_response(inner, envelope, payload),
        EnvelopeType::Confirm => handle_terminal(inner, envelope, ConversationState::Confirmed),
        EnvelopeType::Reject => handle_terminal(inner, envelope, ConversationState::Rejected),
        EnvelopeType::Message | EnvelopeType::Inform => {
            inner.events.emit(&NodeEvent::Message {
                envelope: envelope.clone(),
                payload,
            });
            Ok(ok_reply(envelope))
        }
        EnvelopeType::Receipt => handle_receipt(inner, envelope, &payload),
        EnvelopeType::KeyRotation => handle_key_rotation(inner, envelope, &payload),
    }
}

/// Ping: learn the sender's identity, answer with ours.
fn handle_ping(inner: &Arc<NodeInner>, envelope: &Envelope, payload: &Value) -> Result<Reply> {
    egress::learn_peer_identity(inner, &envelope.from.agent, payload)?;

    let keys = inner.keys.read().map_err(|e| Ai2AiError::Internal {
        reason: format!("key store lock poisoned: {e}"),
    })?;
    let answer = json!({
        "agent": inner.config.name,
        "humanName": inner.config.human_name,
        "capabilities": inner.intents.names(),
        "publicKey": keys.signing_keys().public_key().to_hex(),
        "x25519PublicKey": hex::encode(keys.agreement_keys().public_key().as_bytes()),
        "fingerprint": keys.fingerprint(),
        "endpoint": egress::advertised_endpoint(inner),
    });

    Ok((
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "type": "ping",
            "id": envelope.id.to_string(),
            "payload": answer,
        })),
    ))
}

/// Request: dispatch to the intent handler, or hold for approval.
async fn handle_request(
    inner: &Arc<NodeInner>,
    envelope: &Envelope,
    payload: Value,
    sender_verified: bool,
) -> Result<Reply> {
    let Some(intent) = envelope.intent.clone() else {
        return Err(Ai2AiError::InvalidEnvelope {
            reason: "request envelope carries no intent".into(),
        });
    };

    let Some(handler) = inner.intents.get(&intent) else {
        return Ok((
            StatusCode::OK,
            Json(json!({
                "status": "error",
                "reason": "unknown_intent",
                "supported_intents": inner.intents.names(),
            })),
        ));
    };

    let request = IntentRequest {
        envelope: envelope.clone(),
        payload: payload.clone(),
        reply: None,
    };

    let always_approve = inner
        .config
        .always_approve_prefixes
        .iter()
        .any(|p| intent.starts_with(p.as_str()));
    let trusted = inner
        .contacts
        .get(&envelope.from.agent)?
        .map(|c| c.trust_level)
        .unwrap_or_default()
        == ai2ai_types::TrustLevel::Trusted;

    // First contact (no verified key) may never be auto-approved.
    let needs_approval = always_approve
        || handler.requires_approval()
        || envelope.requires_human_approval
        || !sender_verified
        || !trusted;

    if needs_approval {
        let approval_text = handler.approval_text(&request);
        let approval = inner.approvals.enqueue(envelope.clone(), approval_text.clone())?;
        inner.events.emit(&NodeEvent::ApprovalRequested {
            approval_id: approval.id,
            from: envelope.from.agent.clone(),
            approval_text,
        });
        inner.approvals.mark_notified(&approval.id)?;
        tracing::info!(
            id = %envelope.id,
            intent = %intent,
            from = %envelope.from.agent,
            "request held for operator approval"
        );
        return Ok((
            StatusCode::OK,
            Json(json!({
                "status": "pending_approval",
                "id": envelope.id.to_string(),
                "conversation": envelope.conversation.to_string(),
            })),
        ));
    }

    // Trusted auto-dispatch: run the handler and answer
    // asynchronously in the same conversation.
    inner.events.emit(&NodeEvent::Request {
        envelope: envelope.clone(),
        payload,
    });

    let outcome = handler.handle(&request);
    let (reply_type, reply_payload, next_state) = match outcome {
        HandlerOutcome::Approved(value) => {
            (EnvelopeType::Response, value, ConversationState::Negotiating)
        }
        HandlerOutcome::Counter(value) => {
            (EnvelopeType::Response, value, ConversationState::Negotiating)
        }
        HandlerOutcome::Rejected(reason) => (
            EnvelopeType::Reject,
            json!({ "reason": reason }),
            ConversationState::Rejected,
        ),
    };

    let _ = inner
        .conversations
        .transition(&envelope.conversation, next_state);

    let inner_clone = Arc::clone(inner);
    let peer = envelope.from.agent.clone();
    let conversation = envelope.conversation;
    let intent_clone = intent.clone();
    tokio::spawn(async move {
        let result = egress::send_typed(
            &inner_clone,
            &peer,
            reply_type,
            Some(intent_clone),
            reply_payload,
            SendOptions {
                conversation: Some(conversation),
                ..SendOptions::default()
            },
        )
        .await;
        if let Err(e) = result {
            tracing::warn!(peer = %peer, error = %e, "auto-dispatch reply failed");
        }
    });

    Ok(ok_reply(envelope))
}

/// Response: advance the conversation and hold the answer for the
/// operator's confirm/reject decision.
fn handle_response(inner: &Arc<NodeInner>, envelope: &Envelope, payload: Value) -> Result<Reply> {
    let _ = inner
        .conversations
        .transition(&envelope.conversation, ConversationState::Negotiating);

    let approval_text = format!(
        "{} answered {}: {}",
        envelope.from.agent,
        envelope.intent.as_deref().unwrap_or("(no intent)"),
        payload,
    );
    let approval = inner.approvals.enqueue(envelope.clone(), approval_text.clone())?;
    inner.events.emit(&NodeEvent::ApprovalRequested {
        approval_id: approval.id,
        from: envelope.from.agent.clone(),
        approval_text,
    });
    inner.approvals.mark_notified(&approval.id)?;

    inner.events.emit(&NodeEvent::Message {
        envelope: envelope.clone(),
        payload,
    });

    Ok(ok_reply(envelope))
}

/// Confirm / reject: drive the conversation to its terminal state and
/// notify the operator exactly once.
fn handle_terminal(
    inner: &Arc<NodeInner>,
    envelope: &Envelope,
    state: ConversationState,
) -> Result<Reply> {
    let previous = inner.conversations.get(&envelope.conversation)?;
    let already_terminal = previous.as_ref().is_some_and(|m| m.state.is_terminal());

    match inner.conversations.transition(&envelope.conversation, state) {
        Ok(_) => {
            if !already_terminal {
                inner.events.emit(&NodeEvent::Notification {
                    conversation: envelope.conversation,
                    state,
                    from: envelope.from.agent.clone(),
                });
            }
        }
        Err(Ai2AiError::InvalidTransition { reason }) => {
            // Terminal states absorb; idempotent convergence.
            tracing::debug!(reason, "ignoring terminal transition");
        }
        Err(e) => return Err(e),
    }

    Ok(ok_reply(envelope))
}

/// Receipt: advance the delivery tracker; never notifies the
/// operator.
fn handle_receipt(inner: &Arc<NodeInner>, envelope: &Envelope, payload: &Value) -> Result<Reply> {
    let receipt: ReceiptPayload =
        serde_json::from_value(payload.clone()).map_err(|_| Ai2AiError::InvalidEnvelope {
            reason: "receipt payload must be {messageId, status, timestamp}".into(),
        })?;

    inner.events.emit(&NodeEvent::Receipt {
        message_id: receipt.message_id,
        status: receipt.status,
        from: envelope.from.agent.clone(),
    });

    if inner.tracker.advance(receipt.message_id, receipt.status) {
        let event = match receipt.status {
            ReceiptStatus::Delivered => Some(NodeEvent::Delivered {
                id: receipt.message_id,
                to: envelope.from.agent.clone(),
            }),
            ReceiptStatus::Read => Some(NodeEvent::Read {
                id: receipt.message_id,
            }),
            ReceiptStatus::Failed => Some(NodeEvent::Failed {
                id: receipt.message_id,
                to: envelope.from.agent.clone(),
                error: "peer reported failure".into(),
            }),
            ReceiptStatus::Sent => None,
        };
        if let Some(event) = event {
            inner.events.emit(&event);
        }
    }

    Ok(ok_reply(envelope))
}

/// Key rotation: adopt the announced key, archiving the old one.
fn handle_key_rotation(
    inner: &Arc<NodeInner>,
    envelope: &Envelope,
    payload: &Value,
) -> Result<Reply> {
    let Some(new_key) = payload.get("newPublicKey").and_then(Value::as_str) else {
        return Err(Ai2AiError::InvalidEnvelope {
            reason: "key_rotation payload missing newPublicKey".into(),
        });
    };

    inner.contacts.upsert(
        &envelope.from.agent,
        ai2ai_storage::contacts::ContactUpdate {
            ed_public_key: Some(new_key.to_owned()),
            x_public_key: payload
                .get("x25519PublicKey")
                .and_then(Value::as_str)
                .map(str::to_owned),
            ..Default::default()
        },
    )?;

    tracing::info!(peer = %envelope.from.agent, "adopted rotated signing key");
    Ok(ok_reply(envelope))
}

// ---------------------------------------------------------------------------
// Reply helpers
// ---------------------------------------------------------------------------

fn ok_reply(envelope: &Envelope) -> Reply {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "id": envelope.id.to_string(),
            "conversation": envelope.conversation.to_string(),
        })),
    )
}

fn error_reply(code: StatusCode, reason: &str, detail: Option<&str>) -> Reply {
    let mut body = json!({ "status": "error", "reason": reason });
    if let Some(detail) = detail {
        body["detail"] = json!(detail);
    }
    (code, Json(body))
}

fn internal_error(detail: &str) -> Reply {
    error_reply(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", Some(detail))
}

/// Maps the error taxonomy onto the wire status table.
fn map_error(error: Ai2AiError) -> Reply {
    let code = match &error {
        Ai2AiError::Blocked { .. } | Ai2AiError::InvalidSignature { .. } => StatusCode::FORBIDDEN,
        Ai2AiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        Ai2AiError::InvalidEnvelope { .. }
        | Ai2AiError::MessageExpired { .. }
        | Ai2AiError::ReplayDetected { .. }
        | Ai2AiError::DecryptionFailed { .. } => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    let reason = error.wire_reason().unwrap_or("internal_error");
    if code == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!(error = %error, "ingress internal error");
    } else {
        tracing::warn!(error = %error, "envelope rejected");
    }
    error_reply(code, reason, None)
}
