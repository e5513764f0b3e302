//! The ai2ai node runtime.
//!
//! A node is simultaneously an HTTP server (accepting inbound signed
//! envelopes) and an HTTP client (delivering outbound envelopes with
//! persistence and retry). Every externally observable action is
//! gated behind explicit operator approval.
//!
//! # Modules
//!
//! - [`node`] — the [`Node`](node::Node) orchestrator and public API
//! - [`ingress`] — HTTP receiver and security filter chain
//! - [`egress`] — build/sign/encrypt/deliver pipeline
//! - [`delivery`] — retry with backoff over per-endpoint breakers
//! - [`breaker`] — circuit breaker state machines
//! - [`tracker`] — sent/delivered/read/failed tracking
//! - [`rate_limiter`] — per-peer sliding windows
//! - [`verify_cache`] — signature verification memoization
//! - [`intents`] — intent handler registry
//! - [`discovery`] — DNS / well-known / registry resolution
//! - [`events`] — typed event callbacks
//! - [`activity_log`] — daily JSONL audit log

pub mod activity_log;
pub mod breaker;
pub mod delivery;
pub mod discovery;
pub mod egress;
pub mod events;
pub mod intents;
pub mod node;
pub mod rate_limiter;
pub mod tracker;
pub mod verify_cache;

pub(crate) mod ingress;
pub(crate) mod maintenance;
pub(crate) mod queue_worker;

pub use egress::{SendOptions, SendOutcome};
pub use events::NodeEvent;
pub use intents::{HandlerOutcome, IntentHandler, IntentRequest};
pub use node::{Node, NodeState};
