//! Node identity
//!
//! A `DiscoveryNode` is the immutable identity of a cluster member.

use serde::{Deserialize, Serialize};

use crate::config::NodeConfig;
use crate::error::{Error, Result};

/// Protocol version advertised by this build
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Identity of a node taking part in the cluster
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiscoveryNode {
    id: String,
    name: String,
    address: String,
    version: String,
}

impl DiscoveryNode {
    /// Create a node identity advertising the current protocol version
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            address: address.into(),
            version: PROTOCOL_VERSION.to_string(),
        }
    }

    /// Set the display name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the protocol version tag
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Resolve the local node identity from configuration.
    ///
    /// A configured id is used verbatim, otherwise a random one is generated.
    pub fn from_config(config: &NodeConfig) -> Result<Self> {
        if config.address.is_empty() {
            return Err(Error::Config("node.address cannot be empty".into()));
        }

        let id = match &config.id {
            Some(id) => id.clone(),
            None => uuid::Uuid::new_v4().simple().to_string(),
        };

        let mut node = Self::new(id, config.address.clone());
        if let Some(name) = &config.name {
            node = node.with_name(name.clone());
        }
        Ok(node)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn version(&self) -> &str {
        &self.version
    }
}

impl std::fmt::Display for DiscoveryNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{{}}}{{{}}}{{{}}}", self.name, self.id, self.address)
    }
}
