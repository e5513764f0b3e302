//! Envelope codec for the ai2ai agent-to-agent protocol.
//!
//! Defines the wire envelope, deterministic canonical JSON for
//! signing, the Ed25519 sign/verify pipeline (with rotation-aware
//! multi-key verification), ephemeral-ECDH payload encryption, shape
//! and freshness validation, and the replay/deduplication caches.
//!
//! # Modules
//!
//! - [`envelope`] — `Envelope`, `Party`, `Payload`, receipt shapes
//! - [`canonical`] — sorted-key, no-whitespace signing bytes
//! - [`signing`] — envelope signing and multi-candidate verification
//! - [`e2e`] — payload encryption via ephemeral X25519 + AES-256-GCM
//! - [`validation`] — shape, version, and freshness checks
//! - [`nonce`] — time-windowed replay guard
//! - [`dedup`] — bounded LRU envelope-id dedup cache

pub mod canonical;
pub mod dedup;
pub mod e2e;
pub mod envelope;
pub mod nonce;
pub mod signing;
pub mod validation;
