//! Core shared types for the ai2ai agent-to-agent messaging protocol.
//!
//! This crate defines all fundamental types used across the workspace.
//! No other crate should define shared types — everything lives here.

pub mod config;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Protocol versions
// ---------------------------------------------------------------------------

/// Protocol version stamped on every outbound envelope.
pub const PROTO_VERSION: &str = "1.0";

/// Legacy protocol version still accepted inbound.
pub const PROTO_VERSION_LEGACY: &str = "0.1";

// ---------------------------------------------------------------------------
// AgentId
// ---------------------------------------------------------------------------

/// Stable identifier of a peer agent.
///
/// Agent ids are opaque strings chosen by their operators (commonly a
/// DNS-ish name such as `assistant.example.com`). They key every
/// per-peer table in the node: contacts, blocklist, rate limiter,
/// nonce cache.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    /// Creates an `AgentId` from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for AgentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ---------------------------------------------------------------------------
// EnvelopeId
// ---------------------------------------------------------------------------

/// Globally unique envelope identifier (UUID v4).
///
/// The primary deduplication key: a node must observe each id at most
/// once per lifetime of its dedup window.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvelopeId(Uuid);

impl EnvelopeId {
    /// Generates a fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Returns the inner UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for EnvelopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EnvelopeId {
    type Err = Ai2AiError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let id = Uuid::parse_str(s).map_err(|e| Ai2AiError::InvalidEnvelope {
            reason: format!("invalid envelope id: {e}"),
        })?;
        Ok(Self(id))
    }
}

// ---------------------------------------------------------------------------
// ConversationId
// ---------------------------------------------------------------------------

/// Correlation id shared by all envelopes of one logical exchange.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(Uuid);

impl ConversationId {
    /// Generates a fresh random conversation id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Returns the inner UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ConversationId {
    type Err = Ai2AiError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let id = Uuid::parse_str(s).map_err(|e| Ai2AiError::InvalidEnvelope {
            reason: format!("invalid conversation id: {e}"),
        })?;
        Ok(Self(id))
    }
}

// ---------------------------------------------------------------------------
// EnvelopeType
// ---------------------------------------------------------------------------

/// Classifies an envelope's role in a conversation.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeType {
    /// Capability handshake; answered synchronously.
    Ping,
    /// One-way human-readable message.
    Message,
    /// Structured request addressed to an intent handler.
    Request,
    /// Reply carrying an intent's result payload.
    Response,
    /// Accepts a prior response, closing the conversation.
    Confirm,
    /// Declines a request or response.
    Reject,
    /// Delivery/read acknowledgement; never notifies the operator.
    Receipt,
    /// Announces a new signing key to known contacts.
    KeyRotation,
    /// One-way notification; no response expected.
    Inform,
}

impl EnvelopeType {
    /// Wire name of this type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Message => "message",
            Self::Request => "request",
            Self::Response => "response",
            Self::Confirm => "confirm",
            Self::Reject => "reject",
            Self::Receipt => "receipt",
            Self::KeyRotation => "key_rotation",
            Self::Inform => "inform",
        }
    }
}

impl fmt::Display for EnvelopeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ReceiptStatus
// ---------------------------------------------------------------------------

/// Delivery lifecycle stage reported in a `receipt` envelope.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    /// Accepted by the local delivery engine.
    Sent,
    /// The recipient's HTTP endpoint returned 2xx.
    Delivered,
    /// The recipient emitted a read receipt.
    Read,
    /// All delivery attempts exhausted.
    Failed,
}

impl fmt::Display for ReceiptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sent => f.write_str("sent"),
            Self::Delivered => f.write_str("delivered"),
            Self::Read => f.write_str("read"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

// ---------------------------------------------------------------------------
// TrustLevel
// ---------------------------------------------------------------------------

/// Per-contact disposition controlling approval bypass.
///
/// Only non-commerce intents may ever bypass operator approval, and
/// only at [`TrustLevel::Trusted`]. Transitions require explicit
/// operator action — trust is never earned automatically.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    /// First contact or unreviewed peer. Everything needs approval.
    #[default]
    None,
    /// Operator has seen this peer; still requires approval.
    Known,
    /// Operator vouches for this peer; non-commerce requests dispatch
    /// directly to handlers.
    Trusted,
}

impl TrustLevel {
    /// Wire name of this level.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Known => "known",
            Self::Trusted => "trusted",
        }
    }
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrustLevel {
    type Err = Ai2AiError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "known" => Ok(Self::Known),
            "trusted" => Ok(Self::Trusted),
            other => Err(Ai2AiError::Config {
                reason: format!("invalid trust level '{other}' (expected none|known|trusted)"),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// ConversationState
// ---------------------------------------------------------------------------

/// State machine position of a conversation.
///
/// `Confirmed`, `Rejected`, and `Expired` are terminal: no transition
/// ever leaves them.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationState {
    /// Initial request sent or received; nothing agreed yet.
    Proposed,
    /// At least one response/counter has been exchanged.
    Negotiating,
    /// Both sides agreed. Terminal.
    Confirmed,
    /// Declined by either side. Terminal.
    Rejected,
    /// Timed out without resolution. Terminal.
    Expired,
}

impl ConversationState {
    /// Returns `true` for states that absorb all further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed | Self::Rejected | Self::Expired)
    }

    /// Wire name of this state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Proposed => "proposed",
            Self::Negotiating => "negotiating",
            Self::Confirmed => "confirmed",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Ai2AiError
// ---------------------------------------------------------------------------

/// Central error type for the ai2ai workspace.
///
/// All crates convert their internal errors into variants of this
/// enum, ensuring a unified error handling surface. The variant names
/// mirror the protocol's wire-level `reason` strings where one exists.
#[derive(Debug, Error)]
pub enum Ai2AiError {
    /// A required envelope field is missing or malformed, or the
    /// protocol version is not in the accepted set.
    #[error("invalid envelope: {reason}")]
    InvalidEnvelope {
        /// Description of the shape violation.
        reason: String,
    },

    /// Signature verification failed against every candidate key.
    #[error("invalid signature: {reason}")]
    InvalidSignature {
        /// Description of the verification failure.
        reason: String,
    },

    /// The envelope timestamp is outside the freshness window, or its
    /// explicit `expiresAt` has passed.
    #[error("message expired: {reason}")]
    MessageExpired {
        /// Description of which freshness bound was violated.
        reason: String,
    },

    /// A nonce was observed twice within the replay window.
    #[error("replay detected: {reason}")]
    ReplayDetected {
        /// Description of the replayed nonce.
        reason: String,
    },

    /// The sender is on the local blocklist.
    #[error("sender blocked: {reason}")]
    Blocked {
        /// The blocked agent id.
        reason: String,
    },

    /// The sender exceeded the per-peer inbound rate limit.
    #[error("rate limited: {reason}")]
    RateLimited {
        /// Description including the limit and window.
        reason: String,
    },

    /// AEAD verification failed while decrypting a payload.
    #[error("decryption failed: {reason}")]
    DecryptionFailed {
        /// Description of the AEAD failure.
        reason: String,
    },

    /// A cryptographic operation other than payload decryption failed.
    #[error("crypto error: {reason}")]
    Crypto {
        /// Description of the cryptographic failure.
        reason: String,
    },

    /// A disk read/write or serialization-at-rest failure.
    #[error("storage error: {reason}")]
    Storage {
        /// Description of the storage failure.
        reason: String,
    },

    /// An outbound HTTP call failed in a retryable way (connection
    /// refused, timeout, 5xx).
    #[error("transport error: {reason}")]
    Transport {
        /// Description of the transport failure.
        reason: String,
    },

    /// The per-endpoint circuit breaker is open; no call was made.
    #[error("circuit breaker is open for {endpoint}")]
    CircuitOpen {
        /// The guarded endpoint URL.
        endpoint: String,
    },

    /// The target agent could not be resolved to an endpoint.
    #[error("resolution failed: {reason}")]
    Resolution {
        /// Description of the resolution failure.
        reason: String,
    },

    /// A conversation state transition is not allowed by the table.
    #[error("invalid transition: {reason}")]
    InvalidTransition {
        /// Description of the rejected move.
        reason: String,
    },

    /// A configuration value is invalid or missing.
    #[error("config error: {reason}")]
    Config {
        /// Description of the configuration problem.
        reason: String,
    },

    /// Catch-all for unexpected internal failures.
    #[error("internal error: {reason}")]
    Internal {
        /// Description of the failure.
        reason: String,
    },
}

impl Ai2AiError {
    /// The wire-level `reason` code for errors that map onto the
    /// ingress HTTP response table. Returns `None` for errors that
    /// never cross the wire (storage, config, resolution).
    pub fn wire_reason(&self) -> Option<&'static str> {
        match self {
            Self::InvalidEnvelope { .. } => Some("invalid_envelope"),
            Self::InvalidSignature { .. } => Some("invalid_signature"),
            Self::MessageExpired { .. } => Some("message_expired"),
            Self::ReplayDetected { .. } => Some("replay_detected"),
            Self::Blocked { .. } => Some("blocked"),
            Self::RateLimited { .. } => Some("rate_limited"),
            Self::DecryptionFailed { .. } => Some("decryption_failed"),
            Self::Internal { .. } => Some("internal_error"),
            _ => None,
        }
    }

    /// `true` for failures the delivery engine should retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

// ---------------------------------------------------------------------------
// Result alias
// ---------------------------------------------------------------------------

/// Convenience result type using [`Ai2AiError`].
pub type Result<T> = std::result::Result<T, Ai2AiError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_id_roundtrip() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let id = EnvelopeId::generate();
        let parsed: EnvelopeId = id.to_string().parse()?;
        assert_eq!(id, parsed);
        Ok(())
    }

    #[test]
    fn envelope_id_rejects_garbage() {
        let result: std::result::Result<EnvelopeId, _> = "not-a-uuid".parse();
        assert!(result.is_err());
    }

    #[test]
    fn envelope_type_wire_names() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let json = serde_json::to_string(&EnvelopeType::KeyRotation)?;
        assert_eq!(json, "\"key_rotation\"");
        let parsed: EnvelopeType = serde_json::from_str("\"ping\"")?;
        assert_eq!(parsed, EnvelopeType::Ping);
        Ok(())
    }

    #[test]
    fn trust_level_parse() -> std::result::Result<(), Ai2AiError> {
        assert_eq!("trusted".parse::<TrustLevel>()?, TrustLevel::Trusted);
        assert_eq!("none".parse::<TrustLevel>()?, TrustLevel::None);
        assert!("buddy".parse::<TrustLevel>().is_err());
        Ok(())
    }

    #[test]
    fn trust_level_defaults_to_none() {
        assert_eq!(TrustLevel::default(), TrustLevel::None);
    }

    #[test]
    fn trust_level_ordering() {
        assert!(TrustLevel::None < TrustLevel::Known);
        assert!(TrustLevel::Known < TrustLevel::Trusted);
    }

    #[test]
    fn conversation_state_terminality() {
        assert!(!ConversationState::Proposed.is_terminal());
        assert!(!ConversationState::Negotiating.is_terminal());
        assert!(ConversationState::Confirmed.is_terminal());
        assert!(ConversationState::Rejected.is_terminal());
        assert!(ConversationState::Expired.is_terminal());
    }

    #[test]
    fn wire_reason_mapping() {
        let err = Ai2AiError::ReplayDetected {
            reason: "nonce reused".into(),
        };
        assert_eq!(err.wire_reason(), Some("replay_detected"));

        let err = Ai2AiError::Storage {
            reason: "disk full".into(),
        };
        assert_eq!(err.wire_reason(), None);
    }

    #[test]
    fn transport_is_retryable() {
        let err = Ai2AiError::Transport {
            reason: "connection refused".into(),
        };
        assert!(err.is_retryable());

        let err = Ai2AiError::Blocked {
            reason: "peer".into(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn receipt_status_serde() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let json = serde_json::to_string(&ReceiptStatus::Delivered)?;
        assert_eq!(json, "\"delivered\"");
        Ok(())
    }
}
