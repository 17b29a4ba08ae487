//! Cluster State
//!
//! Immutable, versioned snapshots of cluster membership and master identity.
//! New states are only produced through [`ClusterStateBuilder`] and stamped
//! with their version by the cluster service when applied.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::DiscoveryNode;
use crate::error::{Error, Result};

/// Immutable snapshot of the cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterState {
    cluster_name: String,
    version: u64,
    state_uuid: Uuid,
    nodes: BTreeMap<String, DiscoveryNode>,
    master_node_id: Option<String>,
    applied_at: DateTime<Utc>,
}

impl ClusterState {
    /// An empty state: version 0, no members, no master
    pub fn empty(cluster_name: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            version: 0,
            state_uuid: Uuid::new_v4(),
            nodes: BTreeMap::new(),
            master_node_id: None,
            applied_at: Utc::now(),
        }
    }

    /// The state a node starts with: itself as the only member, no master yet
    pub fn initial(cluster_name: impl Into<String>, local_node: DiscoveryNode) -> Self {
        let mut state = Self::empty(cluster_name);
        state.nodes.insert(local_node.id().to_string(), local_node);
        state
    }

    /// Start building the successor of this state
    pub fn builder(&self) -> ClusterStateBuilder {
        ClusterStateBuilder {
            cluster_name: self.cluster_name.clone(),
            version: self.version,
            nodes: self.nodes.clone(),
            master_node_id: self.master_node_id.clone(),
        }
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn state_uuid(&self) -> Uuid {
        self.state_uuid
    }

    pub fn nodes(&self) -> impl Iterator<Item = &DiscoveryNode> {
        self.nodes.values()
    }

    /// Look up a member by id
    pub fn node(&self, id: &str) -> Option<&DiscoveryNode> {
        self.nodes.get(id)
    }

    /// Number of members
    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    pub fn master_node_id(&self) -> Option<&str> {
        self.master_node_id.as_deref()
    }

    /// The elected master, if any
    pub fn master_node(&self) -> Option<&DiscoveryNode> {
        self.master_node_id.as_deref().and_then(|id| self.nodes.get(id))
    }

    pub fn has_master(&self) -> bool {
        self.master_node_id.is_some()
    }

    /// Check whether `node_id` is the elected master
    pub fn is_master(&self, node_id: &str) -> bool {
        self.master_node_id.as_deref() == Some(node_id)
    }

    /// When the service applied this state
    pub fn applied_at(&self) -> DateTime<Utc> {
        self.applied_at
    }

    /// Same membership and master as `other`, ignoring version and identity
    pub fn same_membership(&self, other: &ClusterState) -> bool {
        self.nodes == other.nodes && self.master_node_id == other.master_node_id
    }

    /// Stamp the state with the version it is applied at
    pub(crate) fn stamped(mut self, version: u64) -> Self {
        self.version = version;
        self.applied_at = Utc::now();
        self
    }

    /// Get cluster summary
    pub fn summary(&self) -> ClusterSummary {
        ClusterSummary {
            cluster_name: self.cluster_name.clone(),
            version: self.version,
            total_nodes: self.nodes.len(),
            master_id: self.master_node_id.clone(),
        }
    }
}

impl std::fmt::Display for ClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "cluster [{}] version [{}] nodes [{}] master [{}]",
            self.cluster_name,
            self.version,
            self.nodes.len(),
            self.master_node_id.as_deref().unwrap_or("-")
        )
    }
}

/// Builds the next [`ClusterState`] from a previous one
#[derive(Debug, Clone)]
pub struct ClusterStateBuilder {
    cluster_name: String,
    version: u64,
    nodes: BTreeMap<String, DiscoveryNode>,
    master_node_id: Option<String>,
}

impl ClusterStateBuilder {
    /// Add (or replace) a member
    pub fn add_node(mut self, node: DiscoveryNode) -> Self {
        self.nodes.insert(node.id().to_string(), node);
        self
    }

    /// Drop every member and the master
    pub fn clear_nodes(mut self) -> Self {
        self.nodes.clear();
        self.master_node_id = None;
        self
    }

    pub fn master_node_id(mut self, master: Option<String>) -> Self {
        self.master_node_id = master;
        self
    }

    /// Build the state, checking that the master is a member
    pub fn build(self) -> Result<ClusterState> {
        if let Some(master) = &self.master_node_id {
            if !self.nodes.contains_key(master) {
                return Err(Error::InvalidState(format!(
                    "master node [{}] is not a member of the cluster",
                    master
                )));
            }
        }

        Ok(ClusterState {
            cluster_name: self.cluster_name,
            version: self.version,
            state_uuid: Uuid::new_v4(),
            nodes: self.nodes,
            master_node_id: self.master_node_id,
            applied_at: Utc::now(),
        })
    }
}

/// Event passed to cluster state listeners after each applied update
#[derive(Debug, Clone)]
pub struct ClusterChangedEvent {
    source: Arc<str>,
    state: Arc<ClusterState>,
    previous: Arc<ClusterState>,
}

impl ClusterChangedEvent {
    pub fn new(source: Arc<str>, state: Arc<ClusterState>, previous: Arc<ClusterState>) -> Self {
        Self { source, state, previous }
    }

    /// Source of the update task that produced this change
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn state(&self) -> &Arc<ClusterState> {
        &self.state
    }

    pub fn previous_state(&self) -> &Arc<ClusterState> {
        &self.previous
    }

    pub fn nodes_changed(&self) -> bool {
        self.state.nodes != self.previous.nodes
    }

    pub fn master_changed(&self) -> bool {
        self.state.master_node_id != self.previous.master_node_id
    }
}

/// Cluster summary information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSummary {
    pub cluster_name: String,
    pub version: u64,
    pub total_nodes: usize,
    pub master_id: Option<String>,
}
