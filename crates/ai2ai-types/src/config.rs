//! Node configuration with documented defaults.
//!
//! All operational parameters are centralized here. Every value has a
//! default matching the protocol specification; `validate()` rejects
//! configurations that would render the node inert or unsafe.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Ai2AiError, Result, PROTO_VERSION, PROTO_VERSION_LEGACY};

/// Default HTTP bind port.
pub const DEFAULT_PORT: u16 = 18_800;

/// Default outbound HTTP timeout.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Default maximum accepted envelope age (24 h), also the default
/// expiry added to outbound envelopes.
pub const DEFAULT_MESSAGE_TTL_MS: u64 = 86_400_000;

/// Default per-peer inbound messages per minute.
pub const DEFAULT_RATE_LIMIT_PER_MIN: u32 = 20;

/// Default key rotation cadence (30 days).
pub const DEFAULT_ROTATION_INTERVAL_MS: u64 = 30 * 86_400_000;

/// Default pending-approval time-to-live (24 h).
pub const DEFAULT_APPROVAL_TTL_MS: u64 = 86_400_000;

/// Default conversation expiry after last activity (7 days).
pub const DEFAULT_CONVERSATION_EXPIRY_MS: u64 = 7 * 86_400_000;

/// Coarse retry schedule for queued deliveries: 1 m, 5 m, 30 m, 2 h, 12 h.
pub const DEFAULT_QUEUE_RETRY_SCHEDULE_MS: [u64; 5] =
    [60_000, 300_000, 1_800_000, 7_200_000, 43_200_000];

/// Node configuration.
///
/// Field names mirror the protocol's configuration keys; everything is
/// optional at the call site via [`NodeConfig::default`] plus struct
/// update syntax.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Agent identity stamped into every envelope's `from.agent`.
    pub name: String,

    /// Operator display name stamped into `from.human`.
    pub human_name: String,

    /// HTTP bind port.
    pub port: u16,

    /// Publicly reachable envelope endpoint advertised to peers in
    /// pings and discovery documents. Defaults to
    /// `http://<name>:<port>/ai2ai`.
    pub endpoint: Option<String>,

    /// Outbound HTTP timeout in milliseconds.
    pub timeout_ms: u64,

    /// Maximum envelope age accepted inbound; also the default expiry
    /// added to outbound envelopes. Milliseconds.
    pub message_ttl_ms: u64,

    /// Root directory for all persistent state.
    pub data_dir: PathBuf,

    /// Registry base URL. `None` disables registry discovery.
    pub registry: Option<String>,

    /// Per-peer inbound messages per minute.
    pub rate_limit_per_min: u32,

    /// Key rotation cadence in milliseconds.
    pub rotation_interval_ms: u64,

    /// Encrypt outbound payloads when the recipient's X25519 key is
    /// known. Degrades to signed-only when it is not.
    pub encryption_enabled: bool,

    /// Pending approvals auto-reject after this many milliseconds.
    pub approval_ttl_ms: u64,

    /// Non-terminal conversations expire this long after their last
    /// activity. Milliseconds.
    pub conversation_expiry_ms: u64,

    /// Accepted inbound `protoVersion` values.
    pub version_allowlist: Vec<String>,

    /// Intent prefixes that always require operator approval,
    /// regardless of the sender's trust level.
    pub always_approve_prefixes: Vec<String>,

    /// Delay before each queued-delivery retry attempt, indexed by
    /// attempt count. Exhausting the schedule moves the entry to the
    /// dead letter store.
    pub queue_retry_schedule_ms: Vec<u64>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: String::from("agent"),
            human_name: String::from("operator"),
            port: DEFAULT_PORT,
            endpoint: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            message_ttl_ms: DEFAULT_MESSAGE_TTL_MS,
            data_dir: PathBuf::from("./ai2ai-data"),
            registry: None,
            rate_limit_per_min: DEFAULT_RATE_LIMIT_PER_MIN,
            rotation_interval_ms: DEFAULT_ROTATION_INTERVAL_MS,
            encryption_enabled: true,
            approval_ttl_ms: DEFAULT_APPROVAL_TTL_MS,
            conversation_expiry_ms: DEFAULT_CONVERSATION_EXPIRY_MS,
            version_allowlist: vec![
                PROTO_VERSION.to_owned(),
                PROTO_VERSION_LEGACY.to_owned(),
            ],
            always_approve_prefixes: vec![String::from("commerce.")],
            queue_retry_schedule_ms: DEFAULT_QUEUE_RETRY_SCHEDULE_MS.to_vec(),
        }
    }
}

impl NodeConfig {
    /// Outbound HTTP timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Validates all configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`Ai2AiError::Config`] if any value is outside its
    /// acceptable range.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Ai2AiError::Config {
                reason: "name must not be empty".into(),
            });
        }

        if self.timeout_ms == 0 {
            return Err(Ai2AiError::Config {
                reason: "timeout_ms must be greater than 0".into(),
            });
        }

        if self.message_ttl_ms == 0 {
            return Err(Ai2AiError::Config {
                reason: "message_ttl_ms must be greater than 0".into(),
            });
        }

        if self.rate_limit_per_min == 0 {
            return Err(Ai2AiError::Config {
                reason: "rate_limit_per_min must be greater than 0".into(),
            });
        }

        if self.approval_ttl_ms == 0 {
            return Err(Ai2AiError::Config {
                reason: "approval_ttl_ms must be greater than 0".into(),
            });
        }

        if self.version_allowlist.is_empty() {
            return Err(Ai2AiError::Config {
                reason: "version_allowlist must contain at least one version".into(),
            });
        }

        if self.queue_retry_schedule_ms.is_empty() {
            return Err(Ai2AiError::Config {
                reason: "queue_retry_schedule_ms must contain at least one delay".into(),
            });
        }

        Ok(())
    }
}
