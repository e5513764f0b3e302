//! Canonical JSON encoding for envelope signatures.
//!
//! The signed byte string is the JSON encoding of exactly eight
//! envelope fields with keys in lexicographic order and no
//! whitespace:
//!
//! ```text
//! {conversation, from, id, intent, payload, timestamp, to, type}
//! ```
//!
//! `nonce`, `expiresAt`, `requiresHumanApproval`, and `signature` are
//! deliberately excluded. When the payload is encrypted, the
//! encrypted variant is what gets canonicalized — the signature
//! always covers the final payload.
//!
//! Sorting is explicit: every object, including nested payload
//! objects, is rebuilt into `serde_json`'s `Map`, which is backed by
//! a `BTreeMap` and therefore serializes keys in byte-lexicographic
//! order. The `preserve_order` feature of `serde_json` must stay
//! disabled for this crate.

use ai2ai_types::{Ai2AiError, Result};
use serde_json::{Map, Value};

use crate::envelope::Envelope;

/// Field count of the canonical signing map.
const SIGNED_FIELD_COUNT: usize = 8;

/// Produces the canonical signing bytes for an envelope.
///
/// Deterministic: the same envelope always yields the same bytes,
/// and a sender and receiver holding equal field values produce
/// identical output.
///
/// # Errors
///
/// Returns [`Ai2AiError::InvalidEnvelope`] if a field cannot be
/// serialized (practically unreachable for well-formed envelopes).
pub fn signed_bytes(envelope: &Envelope) -> Result<Vec<u8>> {
    let mut map = Map::new();

    map.insert(
        "conversation".to_owned(),
        Value::String(envelope.conversation.to_string()),
    );
    map.insert("from".to_owned(), to_value(&envelope.from)?);
    map.insert("id".to_owned(), Value::String(envelope.id.to_string()));
    map.insert(
        "intent".to_owned(),
        match &envelope.intent {
            Some(intent) => Value::String(intent.clone()),
            None => Value::Null,
        },
    );
    map.insert("payload".to_owned(), canonicalize(to_value(&envelope.payload)?));
    map.insert(
        "timestamp".to_owned(),
        Value::String(envelope.timestamp.clone()),
    );
    map.insert("to".to_owned(), to_value(&envelope.to)?);
    map.insert(
        "type".to_owned(),
        Value::String(envelope.envelope_type.as_str().to_owned()),
    );

    debug_assert_eq!(map.len(), SIGNED_FIELD_COUNT);

    serde_json::to_vec(&Value::Object(map)).map_err(|e| Ai2AiError::InvalidEnvelope {
        reason: format!("canonical serialization failed: {e}"),
    })
}

/// Serializes any serde value, mapping failures to envelope errors.
fn to_value<T: serde::Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| Ai2AiError::InvalidEnvelope {
        reason: format!("canonical field serialization failed: {e}"),
    })
}

/// Recursively rebuilds every JSON object into a sorted-key map.
///
/// With default `serde_json` this is an identity transformation, but
/// making the sort explicit keeps the signing contract independent of
/// crate features.
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(entries) => {
            let mut sorted = Map::new();
            for (key, inner) in entries {
                sorted.insert(key, canonicalize(inner));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
