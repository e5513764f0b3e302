//! Crash-safe persistent state for an ai2ai node.
//!
//! Every store is a disk-backed singleton owned by the node
//! orchestrator. All writes go through write-to-temp-then-rename so a
//! crash mid-write never leaves a torn document behind.
//!
//! # Modules
//!
//! - [`atomic`] — atomic JSON document I/O
//! - [`contacts`] — contact registry and blocklist
//! - [`conversations`] — conversation metadata, state machine, append logs
//! - [`approvals`] — durable pending-approval inbox
//! - [`queue`] — persistent outbound delivery queue
//! - [`dlq`] — dead letter store

pub mod approvals;
pub mod atomic;
pub mod contacts;
pub mod conversations;
pub mod dlq;
pub mod queue;
