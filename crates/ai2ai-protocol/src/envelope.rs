//! The wire envelope and its constituent parts.
//!
//! An [`Envelope`] is the single JSON document exchanged between
//! nodes. Timestamps are carried as their original RFC 3339 strings
//! rather than parsed datetimes: the canonical signing bytes must
//! reproduce the sender's exact text, and re-serializing a parsed
//! datetime does not guarantee that.

use ai2ai_types::{
    Ai2AiError, AgentId, ConversationId, EnvelopeId, EnvelopeType, ReceiptStatus, Result,
    PROTO_VERSION,
};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Party
// ---------------------------------------------------------------------------

/// Envelope sender: stable agent id plus operator display name.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Party {
    /// Stable peer id.
    pub agent: AgentId,
    /// Operator display name.
    #[serde(default)]
    pub human: String,
}

/// Envelope recipient.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Recipient {
    /// Stable peer id.
    pub agent: AgentId,
}

// ---------------------------------------------------------------------------
// EncryptedPayload
// ---------------------------------------------------------------------------

/// Marker field that only ever serializes and deserializes as `true`.
///
/// Distinguishes the encrypted payload variant from an arbitrary
/// plaintext object that happens to carry similar field names.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EncryptedMarker;

impl Serialize for EncryptedMarker {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_bool(true)
    }
}

impl<'de> Deserialize<'de> for EncryptedMarker {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        if bool::deserialize(deserializer)? {
            Ok(EncryptedMarker)
        } else {
            Err(serde::de::Error::custom("_encrypted must be true"))
        }
    }
}

/// Encrypted payload variant: everything the recipient needs to derive
/// the shared secret and decrypt. All binary fields are base64.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    /// Always `true`; distinguishes this variant on the wire.
    #[serde(rename = "_encrypted")]
    pub encrypted: EncryptedMarker,
    /// Sender's ephemeral X25519 public key.
    #[serde(rename = "ephemeralPub")]
    pub ephemeral_pub: String,
    /// 96-bit AES-GCM nonce.
    pub nonce: String,
    /// Ciphertext (same length as the plaintext JSON).
    pub ciphertext: String,
    /// 128-bit GCM authentication tag.
    pub tag: String,
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// Envelope payload: an opaque JSON object, or the encrypted variant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    /// Encrypted payload; tried first so the `_encrypted` marker wins.
    Encrypted(EncryptedPayload),
    /// Plaintext JSON payload.
    Plain(serde_json::Value),
}

impl Payload {
    /// Returns `true` for the encrypted variant.
    pub fn is_encrypted(&self) -> bool {
        matches!(self, Self::Encrypted(_))
    }

    /// An empty plaintext object, the payload of `ping` and similar
    /// envelopes.
    pub fn empty() -> Self {
        Self::Plain(serde_json::Value::Object(serde_json::Map::new()))
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The unit of communication between nodes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version; `"1.0"` outbound, `"0.1"` accepted inbound.
    #[serde(rename = "protoVersion")]
    pub proto_version: String,

    /// Globally unique envelope id; the dedup key.
    pub id: EnvelopeId,

    /// Random 128-bit hex nonce; the replay key. Optional only for
    /// legacy `"0.1"` envelopes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,

    /// Creation time, RFC 3339 UTC. Kept as the sender's exact string
    /// so canonical signing bytes are reproducible.
    pub timestamp: String,

    /// Optional absolute expiry, RFC 3339 UTC.
    #[serde(rename = "expiresAt", skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,

    /// Sender identity.
    pub from: Party,

    /// Recipient identity.
    pub to: Recipient,

    /// Conversation this envelope belongs to.
    pub conversation: ConversationId,

    /// Envelope role.
    #[serde(rename = "type")]
    pub envelope_type: EnvelopeType,

    /// Namespaced intent, e.g. `schedule.meeting`. `None` for `ping`
    /// and `receipt`.
    pub intent: Option<String>,

    /// Plaintext or encrypted payload.
    pub payload: Payload,

    /// Whether the recipient must hold this for operator approval.
    #[serde(rename = "requiresHumanApproval", default)]
    pub requires_human_approval: bool,

    /// Ed25519 signature over the canonical bytes, base64. `None`
    /// only while the envelope is being constructed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl Envelope {
    /// Parses the timestamp field.
    ///
    /// # Errors
    ///
    /// Returns [`Ai2AiError::InvalidEnvelope`] when the string is not
    /// valid RFC 3339.
    pub fn timestamp_utc(&self) -> Result<DateTime<Utc>> {
        parse_rfc3339(&self.timestamp, "timestamp")
    }

    /// Parses the optional expiry field.
    pub fn expires_at_utc(&self) -> Result<Option<DateTime<Utc>>> {
        match &self.expires_at {
            Some(s) => parse_rfc3339(s, "expiresAt").map(Some),
            None => Ok(None),
        }
    }
}

fn parse_rfc3339(s: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Ai2AiError::InvalidEnvelope {
            reason: format!("{field} is not valid RFC 3339: {e}"),
        })
}

// ---------------------------------------------------------------------------
// EnvelopeBuilder
// ---------------------------------------------------------------------------

/// Constructs outbound envelopes with fresh id, nonce, and timestamp.
pub struct EnvelopeBuilder {
    envelope: Envelope,
}

impl EnvelopeBuilder {
    /// Starts a new envelope of the given type between two agents.
    pub fn new(
        from: Party,
        to_agent: AgentId,
        conversation: ConversationId,
        envelope_type: EnvelopeType,
    ) -> Self {
        Self {
            envelope: Envelope {
                proto_version: PROTO_VERSION.to_owned(),
                id: EnvelopeId::generate(),
                nonce: Some(generate_nonce()),
                timestamp: Utc::now().to_rfc3339(),
                expires_at: None,
                from,
                to: Recipient { agent: to_agent },
                conversation,
                envelope_type,
                intent: None,
                payload: Payload::empty(),
                requires_human_approval: false,
                signature: None,
            },
        }
    }

    /// Sets the namespaced intent.
    pub fn intent(mut self, intent: impl Into<String>) -> Self {
        self.envelope.intent = Some(intent.into());
        self
    }

    /// Sets a plaintext payload.
    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.envelope.payload = Payload::Plain(payload);
        self
    }

    /// Sets an absolute expiry `ttl_ms` milliseconds from now.
    pub fn ttl_ms(mut self, ttl_ms: u64) -> Self {
        let expires = Utc::now() + chrono::Duration::milliseconds(ttl_ms as i64);
        self.envelope.expires_at = Some(expires.to_rfc3339());
        self
    }

    /// Flags the envelope as requiring operator approval.
    pub fn requires_approval(mut self, value: bool) -> Self {
        self.envelope.requires_human_approval = value;
        self
    }

    /// Returns the (unsigned) envelope.
    pub fn build(self) -> Envelope {
        self.envelope
    }
}

/// Generates a random 128-bit nonce as 32 lowercase hex characters.
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

// ---------------------------------------------------------------------------
// ReceiptPayload
// ---------------------------------------------------------------------------

/// Payload shape of a `receipt` envelope.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReceiptPayload {
    /// The envelope being acknowledged.
    #[serde(rename = "messageId")]
    pub message_id: EnvelopeId,
    /// Delivery lifecycle stage reached.
    pub status: ReceiptStatus,
    /// When the stage was reached, RFC 3339 UTC.
    pub timestamp: String,
}

impl ReceiptPayload {
    /// Builds a receipt for `message_id` at `status`, stamped now.
    pub fn now(message_id: EnvelopeId, status: ReceiptStatus) -> Self {
        Self {
            message_id,
            status,
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
