//! Layered configuration: defaults, an optional TOML file, environment
//! variables (`WA_HUB__*`), and CLI flag overrides, in that precedence
//! order.

mod loader;

pub use loader::{load, ConfigLoadError};

use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use wa_hub_model::SupervisorConfig;

/// Server-level config: everything the router and process need beyond the
/// tunables already covered by `wa_hub_model::SupervisorConfig`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Directory holding `instances.json` and `idempotency.json`.
    pub data_dir: PathBuf,
    /// Shared bearer token required on every endpoint except `/health`.
    /// Verification only — issuing tokens to operators happens out of band.
    pub api_token: String,
    /// HMAC secret for signing outbound webhook bodies.
    pub webhook_secret: String,
    /// Optional bearer token the dispatcher attaches to outbound webhook
    /// POSTs.
    pub webhook_bearer_token: Option<String>,
    /// Optional extra header (name, value) — e.g. a reverse-proxy
    /// protection-bypass header.
    pub webhook_bypass_header_name: Option<String>,
    pub webhook_bypass_header_value: Option<String>,

    pub outbound_queue_capacity: usize,
    pub outbound_queue_ttl_ms: u64,
    pub outbound_queue_inter_item_delay_ms: u64,
    pub inbound_buffer_capacity: usize,
    pub inbound_buffer_batch_size: usize,
    pub inbound_buffer_inter_batch_delay_ms: u64,

    /// Permissive by default; set to restrict `Access-Control-Allow-Origin`.
    pub cors_allowed_origins: Vec<String>,

    #[serde(flatten)]
    pub supervisor: SupervisorConfig,
}

impl Config {
    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }

    pub fn instances_path(&self) -> PathBuf {
        self.data_dir.join("instances.json")
    }

    pub fn idempotency_path(&self) -> PathBuf {
        self.data_dir.join("idempotency.json")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            data_dir: PathBuf::from("./data"),
            api_token: "dev-token".to_string(),
            webhook_secret: "dev-webhook-secret".to_string(),
            webhook_bearer_token: None,
            webhook_bypass_header_name: None,
            webhook_bypass_header_value: None,
            outbound_queue_capacity: 256,
            outbound_queue_ttl_ms: 60_000,
            outbound_queue_inter_item_delay_ms: 250,
            inbound_buffer_capacity: 512,
            inbound_buffer_batch_size: 20,
            inbound_buffer_inter_batch_delay_ms: 250,
            cors_allowed_origins: Vec::new(),
            supervisor: SupervisorConfig::default(),
        }
    }
}
