//! Outbound envelope pipeline.
//!
//! Build → (encrypt) → sign → deliver. Encryption applies whenever
//! the recipient's X25519 key is on file and the node has encryption
//! enabled; the signature always covers the final payload, so an
//! encrypted envelope is signed over its ciphertext.
//!
//! Terminal transport failures in interactive mode fall back to the
//! persistent queue and report `queued` to the caller.

use std::sync::Arc;

use ai2ai_crypto::ecdh::X25519PublicKey;
use ai2ai_protocol::e2e::encrypt_payload;
use ai2ai_protocol::envelope::{Envelope, EnvelopeBuilder, Payload, ReceiptPayload};
use ai2ai_protocol::signing::sign_envelope;
use ai2ai_storage::contacts::ContactUpdate;
use ai2ai_storage::queue::EnqueueOptions;
use ai2ai_types::{
    Ai2AiError, AgentId, ConversationId, EnvelopeId, EnvelopeType, ReceiptStatus, Result,
};
use chrono::Utc;
use serde_json::{json, Value};

use crate::delivery::PeerResponse;
use crate::events::NodeEvent;
use crate::node::NodeInner;

// ---------------------------------------------------------------------------
// SendOptions / SendOutcome
// ---------------------------------------------------------------------------

/// Caller-tunable send behavior.
#[derive(Clone, Debug)]
pub struct SendOptions {
    /// Envelope expiry, milliseconds from now. `None` uses the node's
    /// `message_ttl_ms`.
    pub ttl_ms: Option<u64>,
    /// Queue priority if the send falls back to the queue.
    pub priority: i32,
    /// Join an existing conversation instead of opening one.
    pub conversation: Option<ConversationId>,
    /// Force encryption on (`Some(true)`) or off (`Some(false)`).
    /// `None` follows node configuration and key availability.
    pub encrypt: Option<bool>,
    /// Queue the envelope for background retry when interactive
    /// delivery exhausts its attempts.
    pub queue_on_failure: bool,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            ttl_ms: None,
            priority: 0,
            conversation: None,
            encrypt: None,
            queue_on_failure: true,
        }
    }
}

/// What happened to an outbound envelope.
#[derive(Debug)]
pub enum SendOutcome {
    /// The peer acknowledged synchronously.
    Accepted {
        id: EnvelopeId,
        response: PeerResponse,
    },
    /// Delivery failed; the envelope is queued for background retry.
    Queued { id: EnvelopeId },
}

impl SendOutcome {
    /// The envelope id either way.
    pub fn id(&self) -> EnvelopeId {
        match self {
            Self::Accepted { id, .. } | Self::Queued { id } => *id,
        }
    }
}

// ---------------------------------------------------------------------------
// Endpoint resolution
// ---------------------------------------------------------------------------

/// Resolves a target to its delivery endpoint: contact registry
/// first, then the discovery client, caching what discovery found.
pub(crate) async fn resolve_endpoint(inner: &Arc<NodeInner>, target: &AgentId) -> Result<String> {
    if let Some(contact) = inner.contacts.get(target)? {
        if let Some(endpoint) = contact.endpoint {
            return Ok(endpoint);
        }
    }

    let endpoint = inner.discovery.resolve_endpoint(target).await?;
    inner.contacts.upsert(
        target,
        ContactUpdate {
            endpoint: Some(endpoint.clone()),
            ..ContactUpdate::default()
        },
    )?;
    Ok(endpoint)
}

// ---------------------------------------------------------------------------
// Envelope construction
// ---------------------------------------------------------------------------

/// Builds and signs an outbound envelope, encrypting the payload when
/// keys and configuration allow.
pub(crate) fn build_signed(
    inner: &NodeInner,
    target: &AgentId,
    envelope_type: EnvelopeType,
    intent: Option<String>,
    payload: Value,
    opts: &SendOptions,
) -> Result<Envelope> {
    let conversation = opts.conversation.unwrap_or_else(ConversationId::generate);

    let requires_approval = intent
        .as_deref()
        .is_some_and(|i| {
            inner
                .config
                .always_approve_prefixes
                .iter()
                .any(|p| i.starts_with(p.as_str()))
        });

    let mut builder = EnvelopeBuilder::new(
        inner.our_party(),
        target.clone(),
        conversation,
        envelope_type,
    )
    .ttl_ms(opts.ttl_ms.unwrap_or(inner.config.message_ttl_ms))
    .requires_approval(requires_approval);

    if let Some(intent) = intent {
        builder = builder.intent(intent);
    }

    let mut envelope = builder.payload(payload.clone()).build();

    // Encrypt when enabled and the recipient's X25519 key is known;
    // degrade to signed-only otherwise (back-compat).
    let encrypt = opts.encrypt.unwrap_or(inner.config.encryption_enabled);
    if encrypt {
        if let Some(recipient_x) = recipient_agreement_key(inner, target)? {
            envelope.payload = Payload::Encrypted(encrypt_payload(&payload, &recipient_x)?);
        }
    }

    {
        let keys = inner.keys.read().map_err(|e| Ai2AiError::Internal {
            reason: format!("key store lock poisoned: {e}"),
        })?;
        sign_envelope(&mut envelope, keys.signing_keys())?;
    }

    Ok(envelope)
}

/// The recipient's X25519 public key, if on file.
fn recipient_agreement_key(
    inner: &NodeInner,
    target: &AgentId,
) -> Result<Option<X25519PublicKey>> {
    let Some(contact) = inner.contacts.get(target)? else {
        return Ok(None);
    };
    let Some(hex_key) = contact.x_public_key else {
        return Ok(None);
    };

    let bytes = hex::decode(&hex_key).map_err(|_| Ai2AiError::Crypto {
        reason: format!("contact {target} has a malformed X25519 key"),
    })?;
    if bytes.len() != 32 {
        return Err(Ai2AiError::Crypto {
            reason: format!("contact {target} has an X25519 key of {} bytes", bytes.len()),
        });
    }
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&bytes);
    Ok(Some(X25519PublicKey::from_bytes(arr)))
}

// ---------------------------------------------------------------------------
// Send paths
// ---------------------------------------------------------------------------

/// `true` for failures that warrant a queue fallback rather than a
/// synchronous error.
fn should_queue(error: &Ai2AiError) -> bool {
    matches!(
        error,
        Ai2AiError::Transport { .. } | Ai2AiError::CircuitOpen { .. },
    )
}

/// Builds, signs, and delivers one typed envelope.
pub(crate) async fn send_typed(
    inner: &Arc<NodeInner>,
    target: &AgentId,
    envelope_type: EnvelopeType,
    intent: Option<String>,
    payload: Value,
    opts: SendOptions,
) -> Result<SendOutcome> {
    // Blocked peers are gated outbound as well as inbound.
    if inner.contacts.is_blocked(target)? {
        return Err(Ai2AiError::Blocked {
            reason: format!("{target} is blocked"),
        });
    }

    let endpoint = resolve_endpoint(inner, target).await?;
    let envelope = build_signed(inner, target, envelope_type, intent, payload, &opts)?;
    let id = envelope.id;

    // Receipts are pure acknowledgements; they open no conversation.
    if envelope.envelope_type != EnvelopeType::Receipt {
        inner.conversations.append_envelope(&envelope)?;
    }
    inner.tracker.advance(id, ReceiptStatus::Sent);
    inner.events.emit(&NodeEvent::Sent {
        id,
        to: target.clone(),
    });

    match inner.delivery.deliver(&endpoint, &envelope).await {
        Ok(response) => {
            if inner.tracker.advance(id, ReceiptStatus::Delivered) {
                inner.events.emit(&NodeEvent::Delivered {
                    id,
                    to: target.clone(),
                });
            }
            inner.activity.record(
                "egress",
                json!({
                    "id": id.to_string(),
                    "to": target.to_string(),
                    "type": envelope.envelope_type.as_str(),
                    "status": response.status,
                }),
            )?;
            Ok(SendOutcome::Accepted { id, response })
        }
        Err(e) if should_queue(&e) && opts.queue_on_failure => {
            tracing::info!(
                id = %id,
                to = %target,
                error = %e,
                "interactive delivery failed, queueing for background retry"
            );
            let expires_at = envelope
                .expires_at_utc()
                .ok()
                .flatten()
                .or_else(|| Some(Utc::now() + chrono::Duration::milliseconds(
                    inner.config.message_ttl_ms as i64,
                )));
            inner.queue.enqueue(
                envelope,
                endpoint,
                EnqueueOptions {
                    priority: opts.priority,
                    expires_at,
                },
            )?;
            inner.activity.record(
                "egress-queued",
                json!({ "id": id.to_string(), "to": target.to_string() }),
            )?;
            Ok(SendOutcome::Queued { id })
        }
        Err(e) => {
            if inner.tracker.advance(id, ReceiptStatus::Failed) {
                inner.events.emit(&NodeEvent::Failed {
                    id,
                    to: target.clone(),
                    error: e.to_string(),
                });
            }
            Err(e)
        }
    }
}

/// Pings a peer and learns its identity from the answer.
pub(crate) async fn ping(inner: &Arc<NodeInner>, target: &AgentId) -> Result<SendOutcome> {
    let our_keys = {
        let keys = inner.keys.read().map_err(|e| Ai2AiError::Internal {
            reason: format!("key store lock poisoned: {e}"),
        })?;
        json!({
            "publicKey": keys.signing_keys().public_key().to_hex(),
            "x25519PublicKey": hex::encode(keys.agreement_keys().public_key().as_bytes()),
            "fingerprint": keys.fingerprint(),
            "capabilities": inner.intents.names(),
            "humanName": inner.config.human_name,
            "endpoint": advertised_endpoint(inner),
        })
    };

    let outcome = send_typed(
        inner,
        target,
        EnvelopeType::Ping,
        None,
        our_keys,
        SendOptions {
            // Key exchange must see the actual keys.
            encrypt: Some(false),
            queue_on_failure: false,
            ..SendOptions::default()
        },
    )
    .await?;

    // Learn the peer's identity from the synchronous answer.
    if let SendOutcome::Accepted { response, .. } = &outcome {
        if let Some(payload) = &response.payload {
            learn_peer_identity(inner, target, payload)?;
        }
    }

    Ok(outcome)
}

/// Fire-and-forget delivery receipt.
pub(crate) async fn send_receipt(
    inner: &Arc<NodeInner>,
    target: &AgentId,
    message_id: EnvelopeId,
    status: ReceiptStatus,
) -> Result<()> {
    let receipt = ReceiptPayload::now(message_id, status);
    let payload = serde_json::to_value(&receipt).map_err(|e| Ai2AiError::Internal {
        reason: format!("receipt serialization failed: {e}"),
    })?;

    send_typed(
        inner,
        target,
        EnvelopeType::Receipt,
        None,
        payload,
        SendOptions {
            queue_on_failure: false,
            ..SendOptions::default()
        },
    )
    .await
    .map(|_| ())
}

/// Merges a peer's self-description (ping payload or answer) into the
/// contact registry.
pub(crate) fn learn_peer_identity(
    inner: &NodeInner,
    peer: &AgentId,
    payload: &Value,
) -> Result<()> {
    let update = ContactUpdate {
        human_name: payload
            .get("humanName")
            .and_then(Value::as_str)
            .map(str::to_owned),
        endpoint: payload
            .get("endpoint")
            .and_then(Value::as_str)
            .map(str::to_owned),
        ed_public_key: payload
            .get("publicKey")
            .and_then(Value::as_str)
            .map(str::to_owned),
        x_public_key: payload
            .get("x25519PublicKey")
            .and_then(Value::as_str)
            .map(str::to_owned),
        capabilities: payload.get("capabilities").and_then(Value::as_array).map(|caps| {
            caps.iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect()
        }),
        timezone: payload
            .get("timezone")
            .and_then(Value::as_str)
            .map(str::to_owned),
    };
    inner.contacts.upsert(peer, update)
}

/// The endpoint this node advertises in pings and discovery
/// documents.
pub(crate) fn advertised_endpoint(inner: &NodeInner) -> String {
    inner.config.endpoint.clone().unwrap_or_else(|| {
        format!("http://{}:{}/ai2ai", inner.config.name, inner.config.port)
    })
}
