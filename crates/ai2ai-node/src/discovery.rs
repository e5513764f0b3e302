//! Peer discovery: DNS records, well-known documents, and the
//! optional central registry.
//!
//! Resolution methods are tried in order, first match wins:
//!
//! 1. DNS TXT `_ai2ai.<domain>` carrying `endpoint=<url>` (or the
//!    legacy `ai2ai=<url>` form).
//! 2. DNS SRV `_ai2ai._tcp.<domain>`.
//! 3. HTTPS `GET https://<domain>/.well-known/ai2ai.json`.
//! 4. Registry REST `GET <registry>/agents/<agentId>`.
//!
//! The registry client also supports registration, capability search,
//! deregistration, and heartbeats. Registry entries go stale two
//! minutes after their last heartbeat.

use std::time::Duration;

use ai2ai_types::{Ai2AiError, AgentId, Result};
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Timeout for well-known and registry HTTP calls.
const DISCOVERY_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

/// `/.well-known/ai2ai.json` document.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WellKnownDescriptor {
    /// Protocol version, `"1.0"`.
    pub ai2ai: String,
    /// Envelope submission endpoint.
    pub endpoint: String,
    /// Agent id.
    pub agent: String,
    /// Operator display name.
    pub human: String,
    /// Ed25519 public key, hex.
    #[serde(rename = "publicKey")]
    pub public_key: String,
    /// Key fingerprint.
    pub fingerprint: String,
    /// Advertised intents.
    pub capabilities: Vec<String>,
    /// IANA timezone.
    pub timezone: String,
}

/// A registry entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistryAgent {
    /// Agent id.
    pub id: String,
    /// Envelope submission endpoint.
    pub endpoint: String,
    /// Agent display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Operator display name.
    #[serde(default, rename = "humanName")]
    pub human_name: Option<String>,
    /// Ed25519 public key, hex.
    #[serde(default, rename = "publicKey")]
    pub public_key: Option<String>,
    /// Advertised intents.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: Value,
}

// ---------------------------------------------------------------------------
// DiscoveryClient
// ---------------------------------------------------------------------------

/// Locates peers by domain-shaped agent id.
pub struct DiscoveryClient {
    resolver: TokioAsyncResolver,
    http: reqwest::Client,
    registry_url: Option<String>,
}

impl DiscoveryClient {
    /// Creates a client. `registry_url` enables the registry methods.
    ///
    /// # Errors
    ///
    /// Returns [`Ai2AiError::Config`] if the HTTP client cannot be
    /// constructed.
    pub fn new(registry_url: Option<String>) -> Result<Self> {
        let resolver =
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
        let http = reqwest::Client::builder()
            .timeout(DISCOVERY_HTTP_TIMEOUT)
            .build()
            .map_err(|e| Ai2AiError::Config {
                reason: format!("failed to build discovery HTTP client: {e}"),
            })?;
        Ok(Self {
            resolver,
            http,
            registry_url,
        })
    }

    /// Resolves an agent id to its envelope endpoint, trying every
    /// method in order.
    ///
    /// # Errors
    ///
    /// Returns [`Ai2AiError::Resolution`] when nothing matched.
    pub async fn resolve_endpoint(&self, agent_id: &AgentId) -> Result<String> {
        let domain = agent_id.as_str();

        if let Some(endpoint) = self.lookup_txt(domain).await {
            tracing::debug!(domain, endpoint, "resolved via DNS TXT");
            return Ok(endpoint);
        }

        if let Some(endpoint) = self.lookup_srv(domain).await {
            tracing::debug!(domain, endpoint, "resolved via DNS SRV");
            return Ok(endpoint);
        }

        if let Some(endpoint) = self.fetch_well_known(domain).await {
            tracing::debug!(domain, endpoint, "resolved via well-known");
            return Ok(endpoint);
        }

        if let Some(agent) = self.registry_get(agent_id).await? {
            tracing::debug!(domain, endpoint = %agent.endpoint, "resolved via registry");
            return Ok(agent.endpoint);
        }

        Err(Ai2AiError::Resolution {
            reason: format!("no endpoint found for {agent_id}"),
        })
    }

    /// DNS TXT `_ai2ai.<domain>`: `endpoint=<url>` or legacy
    /// `ai2ai=<url>`.
    async fn lookup_txt(&self, domain: &str) -> Option<String> {
        let name = format!("_ai2ai.{domain}.");
        let lookup = self.resolver.txt_lookup(name).await.ok()?;

        for record in lookup.iter() {
            let text: String = record
                .txt_data()
                .iter()
                .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
                .collect();
            for prefix in ["endpoint=", "ai2ai="] {
                if let Some(url) = text.strip_prefix(prefix) {
                    if !url.is_empty() {
                        return Some(url.to_owned());
                    }
                }
            }
        }
        None
    }

    /// DNS SRV `_ai2ai._tcp.<domain>` → `http://<target>:<port>/ai2ai`.
    async fn lookup_srv(&self, domain: &str) -> Option<String> {
        let name = format!("_ai2ai._tcp.{domain}.");
        let lookup = self.resolver.srv_lookup(name).await.ok()?;

        let record = lookup.iter().next()?;
        let target = record.target().to_utf8();
        let target = target.trim_end_matches('.');
        Some(format!("http://{target}:{}/ai2ai", record.port()))
    }

    /// HTTPS well-known fetch.
    async fn fetch_well_known(&self, domain: &str) -> Option<String> {
        let url = format!("https://{domain}/.well-known/ai2ai.json");
        let response = self.http.get(&url).send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        let descriptor: WellKnownDescriptor = response.json().await.ok()?;
        Some(descriptor.endpoint)
    }

    // -- Registry REST ----------------------------------------------------

    /// `GET /agents/:id`. `Ok(None)` covers both 404 and a missing
    /// registry configuration.
    pub async fn registry_get(&self, agent_id: &AgentId) -> Result<Option<RegistryAgent>> {
        let Some(base) = &self.registry_url else {
            return Ok(None);
        };

        let response = self
            .http
            .get(format!("{base}/agents/{agent_id}"))
            .send()
            .await
            .map_err(|e| Ai2AiError::Transport {
                reason: format!("registry lookup failed: {e}"),
            })?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Ai2AiError::Transport {
                reason: format!("registry answered {}", response.status()),
            });
        }

        response.json().await.map(Some).map_err(|e| Ai2AiError::Transport {
            reason: format!("unparseable registry entry: {e}"),
        })
    }

    /// `POST /agents` — register or refresh this node's entry.
    pub async fn register(&self, registration: &RegistryAgent) -> Result<()> {
        let base = self.registry_base()?;
        let response = self
            .http
            .post(format!("{base}/agents"))
            .json(registration)
            .send()
            .await
            .map_err(|e| Ai2AiError::Transport {
                reason: format!("registry registration failed: {e}"),
            })?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Ai2AiError::Transport {
                reason: format!("registry registration answered {}", response.status()),
            })
        }
    }

    /// `GET /agents?capability=&name=` — search the registry.
    pub async fn search(
        &self,
        capability: Option<&str>,
        name: Option<&str>,
    ) -> Result<Vec<RegistryAgent>> {
        let base = self.registry_base()?;

        let mut request = self.http.get(format!("{base}/agents"));
        if let Some(capability) = capability {
            request = request.query(&[("capability", capability)]);
        }
        if let Some(name) = name {
            request = request.query(&[("name", name)]);
        }

        let response = request.send().await.map_err(|e| Ai2AiError::Transport {
            reason: format!("registry search failed: {e}"),
        })?;

        if !response.status().is_success() {
            return Err(Ai2AiError::Transport {
                reason: format!("registry search answered {}", response.status()),
            });
        }

        response.json().await.map_err(|e| Ai2AiError::Transport {
            reason: format!("unparseable registry search result: {e}"),
        })
    }

    /// `DELETE /agents/:id` — deregister.
    pub async fn deregister(&self, agent_id: &AgentId) -> Result<()> {
        let base = self.registry_base()?;
        self.http
            .delete(format!("{base}/agents/{agent_id}"))
            .send()
            .await
            .map_err(|e| Ai2AiError::Transport {
                reason: format!("registry deregistration failed: {e}"),
            })?;
        Ok(())
    }

    /// `POST /agents/:id/heartbeat` — keep the entry fresh (entries
    /// stale after 2 minutes).
    pub async fn heartbeat(&self, agent_id: &AgentId) -> Result<()> {
        let base = self.registry_base()?;
        let response = self
            .http
            .post(format!("{base}/agents/{agent_id}/heartbeat"))
            .send()
            .await
            .map_err(|e| Ai2AiError::Transport {
                reason: format!("registry heartbeat failed: {e}"),
            })?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Ai2AiError::Transport {
                reason: format!("registry heartbeat answered {}", response.status()),
            })
        }
    }

    fn registry_base(&self) -> Result<&str> {
        self.registry_url
            .as_deref()
            .ok_or_else(|| Ai2AiError::Config {
                reason: "no registry URL configured".into(),
            })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
