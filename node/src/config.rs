//! Node configuration with TOML file support.

use lattice_types::NetworkKind;
use serde::{Deserialize, Serialize};

use crate::error::NodeError;

/// Configuration for a lattice node.
///
/// Can be loaded from a TOML file via [`NodeConfig::from_toml_file`] or
/// built programmatically (e.g. for tests).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Which network to join.
    #[serde(default)]
    pub network: NetworkKind,

    /// UDP peering port. Defaults to the network's standard port.
    #[serde(default)]
    pub peering_port: Option<u16>,

    /// Peers contacted on startup ("host:port").
    #[serde(default)]
    pub preconfigured_peers: Vec<String>,

    /// Representatives (hex-encoded accounts) trusted before any are
    /// discovered.
    #[serde(default)]
    pub preconfigured_representatives: Vec<String>,

    /// Scales the gap-cache bootstrap threshold.
    #[serde(default = "default_bootstrap_fraction")]
    pub bootstrap_fraction_numerator: u32,

    /// Floor for the quorum denominator, in raw units.
    #[serde(default = "default_online_weight_minimum")]
    pub online_weight_minimum: u128,

    /// Quorum as a percentage of online stake.
    #[serde(default = "default_online_weight_quorum")]
    pub online_weight_quorum: u8,

    /// I/O worker threads for datagram receive.
    #[serde(default = "default_io_threads")]
    pub io_threads: usize,

    /// Worker threads for proof-of-work validation.
    #[serde(default = "default_work_threads")]
    pub work_threads: usize,

    /// Whether this node answers confirm_req with votes of its own.
    #[serde(default = "default_true")]
    pub enable_voting: bool,

    /// Minimum work difficulty for admitted blocks.
    #[serde(default)]
    pub work_threshold: u64,

    /// Log level filter: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// ── Serde default helpers ──────────────────────────────────────────────

fn default_bootstrap_fraction() -> u32 {
    1
}

fn default_online_weight_minimum() -> u128 {
    60_000_000
}

fn default_online_weight_quorum() -> u8 {
    50
}

fn default_io_threads() -> usize {
    4
}

fn default_work_threads() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

// ── Impl ───────────────────────────────────────────────────────────────

impl NodeConfig {
    /// Load configuration from a TOML file.
    pub fn from_toml_file(path: &str) -> Result<Self, NodeError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| NodeError::Config(e.to_string()))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self, NodeError> {
        let config: Self = toml::from_str(s).map_err(|e| NodeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize the configuration to a TOML string.
    pub fn to_toml_string(&self) -> String {
        toml::to_string_pretty(self).expect("NodeConfig is always serializable to TOML")
    }

    pub fn validate(&self) -> Result<(), NodeError> {
        if self.online_weight_quorum > 100 {
            return Err(NodeError::Config(
                "online_weight_quorum must be at most 100".into(),
            ));
        }
        Ok(())
    }

    /// The effective peering port.
    pub fn port(&self) -> u16 {
        self.peering_port
            .unwrap_or_else(|| self.network.default_port())
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            network: NetworkKind::default(),
            peering_port: None,
            preconfigured_peers: Vec::new(),
            preconfigured_representatives: Vec::new(),
            bootstrap_fraction_numerator: default_bootstrap_fraction(),
            online_weight_minimum: default_online_weight_minimum(),
            online_weight_quorum: default_online_weight_quorum(),
            io_threads: default_io_threads(),
            work_threads: default_work_threads(),
            enable_voting: true,
            work_threshold: 0,
            log_level: default_log_level(),
        }
    }
}
