//! Discovery Module
//!
//! Discovery decides who the members and the master of the cluster are and
//! publishes that decision as a cluster state update.

mod single_node;

pub use single_node::{SingleNodeDiscovery, INITIAL_JOIN_SOURCE};

use crate::cluster::{DiscoveryNode, PendingUpdate};

/// Common trait for discovery implementations
#[async_trait::async_trait]
pub trait Discovery: Send + Sync {
    /// Identity of the local node
    fn local_node(&self) -> &DiscoveryNode;

    /// Minimum number of master-eligible nodes needed to elect a master
    fn minimum_master_nodes(&self) -> usize;

    /// Start the discovery process
    async fn start(&self) -> crate::Result<()>;

    /// Stop the discovery process
    async fn stop(&self) -> crate::Result<()>;

    /// Kick off joining the cluster. Completion is observed through the cluster state.
    fn start_initial_join(&self) -> crate::Result<PendingUpdate>;
}
