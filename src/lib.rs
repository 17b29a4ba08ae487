//! WolfCluster - Single-Node Cluster Bootstrap
//!
//! Cluster membership for a node that runs on its own: the node elects
//! itself master of a one-node cluster, and callers can wait for specific
//! cluster state changes instead of polling for them.
//!
//! # Architecture
//!
//! - [`cluster::ClusterService`] holds the current, immutable
//!   [`cluster::ClusterState`] and applies update tasks one at a time,
//!   notifying listeners after each one.
//! - [`cluster::ClusterStateObserver`] waits until a predicate holds on the
//!   current or a future state and delivers exactly one outcome: the
//!   matching state, service close, or timeout.
//! - [`discovery::SingleNodeDiscovery`] submits the initial join that makes
//!   the local node the only member and the master.
//! - [`node::Node`] runs the startup sequence and shutdown.

pub mod config;
pub mod error;
pub mod cluster;
pub mod discovery;
pub mod node;
pub mod api;

pub use config::WolfClusterConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::WolfClusterConfig;
    pub use crate::error::{Error, Result};
    pub use crate::cluster::{
        ClusterService, ClusterState, ClusterStateObserver, DiscoveryNode, Listener, WaitOutcome,
    };
    pub use crate::discovery::{Discovery, SingleNodeDiscovery};
    pub use crate::node::Node;
}
