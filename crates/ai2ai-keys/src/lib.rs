//! Long-lived key management for an ai2ai node.
//!
//! - [`store`] — on-disk key store: Ed25519 signing pair (PEM),
//!   X25519 agreement pair (DER), owner-read-only private keys
//! - [`rotation`] — rotation metadata and the rotation predicate

pub mod rotation;
pub mod store;

pub use rotation::{RotationMeta, RotationOutcome};
pub use store::KeyStore;
