//! WolfCluster Configuration
//!
//! This module provides configuration structures for a WolfCluster node.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Discovery type understood by this node
pub const SINGLE_NODE_DISCOVERY: &str = "single-node";

/// Main WolfCluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfClusterConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Cluster configuration
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Discovery configuration
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier (generated when not set)
    #[serde(default)]
    pub id: Option<String>,

    /// Human readable node name
    #[serde(default)]
    pub name: Option<String>,

    /// Transport address other nodes would reach this node on (host:port)
    pub address: String,
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cluster name
    #[serde(default = "default_cluster_name")]
    pub name: String,

    /// How long startup waits for the initial join to elect a master
    #[serde(default = "default_initial_join_timeout_ms")]
    pub initial_join_timeout_ms: u64,
}

/// Discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Discovery type (only "single-node" is supported)
    #[serde(rename = "type", default = "default_discovery_type")]
    pub kind: String,

    /// Settings for other discovery implementations, passed through untouched
    #[serde(flatten)]
    pub settings: BTreeMap<String, toml::Value>,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP status API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,

    /// Enable CORS
    #[serde(default)]
    pub cors_enabled: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_cluster_name() -> String {
    "wolfcluster".to_string()
}

fn default_initial_join_timeout_ms() -> u64 {
    30_000
}

fn default_discovery_type() -> String {
    SINGLE_NODE_DISCOVERY.to_string()
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "127.0.0.1:9200".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: default_cluster_name(),
            initial_join_timeout_ms: default_initial_join_timeout_ms(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            kind: default_discovery_type(),
            settings: BTreeMap::new(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
            cors_enabled: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl WolfClusterConfig {
    /// Build a configuration for a node reachable on `address`, everything else defaulted
    pub fn for_address(address: impl Into<String>) -> Self {
        Self {
            node: NodeConfig {
                id: None,
                name: None,
                address: address.into(),
            },
            cluster: ClusterConfig::default(),
            discovery: DiscoveryConfig::default(),
            api: ApiConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfClusterConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as TOML
    pub fn to_toml(&self) -> crate::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if let Some(id) = &self.node.id {
            if id.trim().is_empty() {
                return Err(crate::Error::Config("node.id cannot be blank".into()));
            }
        }

        if self.node.address.is_empty() {
            return Err(crate::Error::Config("node.address cannot be empty".into()));
        }

        if self.cluster.name.is_empty() {
            return Err(crate::Error::Config("cluster.name cannot be empty".into()));
        }

        if self.discovery.kind != SINGLE_NODE_DISCOVERY {
            return Err(crate::Error::Config(format!(
                "discovery.type '{}' is not supported (expected '{}')",
                self.discovery.kind, SINGLE_NODE_DISCOVERY
            )));
        }

        Ok(())
    }

    /// Get the initial join timeout as Duration
    pub fn initial_join_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.initial_join_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[node]
id = "node-1"
address = "10.0.0.5:9300"

[cluster]
name = "prod"
initial_join_timeout_ms = 5000

[discovery]
type = "single-node"
seed_hosts = ["10.0.0.6:9300"]

[api]
bind_address = "0.0.0.0:9200"
"#;

        let config = WolfClusterConfig::from_str(toml).unwrap();
        assert_eq!(config.node.id.as_deref(), Some("node-1"));
        assert_eq!(config.cluster.name, "prod");
        assert_eq!(config.initial_join_timeout(), Duration::from_secs(5));
        assert!(config.discovery.settings.contains_key("seed_hosts"));
        assert!(config.api.enabled);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_defaults() {
        let config = WolfClusterConfig::from_str("[node]\naddress = \"127.0.0.1:9300\"\n").unwrap();
        assert!(config.node.id.is_none());
        assert_eq!(config.cluster.name, "wolfcluster");
        assert_eq!(config.discovery.kind, SINGLE_NODE_DISCOVERY);
        assert_eq!(config.initial_join_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_rejects_unsupported_discovery() {
        let toml = r#"
[node]
address = "127.0.0.1:9300"

[discovery]
type = "zen"
"#;
        let err = WolfClusterConfig::from_str(toml).unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));
    }

    #[test]
    fn test_rejects_empty_address() {
        let err = WolfClusterConfig::from_str("[node]\naddress = \"\"\n").unwrap_err();
        assert!(err.to_string().contains("node.address"));
    }

    #[test]
    fn test_file_roundtrip() {
        let mut config = WolfClusterConfig::for_address("127.0.0.1:9300");
        config.node.id = Some("node-7".into());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(config.to_toml().unwrap().as_bytes()).unwrap();

        let loaded = WolfClusterConfig::from_file(file.path()).unwrap();
        assert_eq!(loaded.node.id.as_deref(), Some("node-7"));
        assert_eq!(loaded.node.address, "127.0.0.1:9300");
    }
}
