//! Cluster State Module
//!
//! The versioned cluster state, the service that applies updates to it,
//! and the observer used to wait for particular states.

mod discovery_node;
mod state;
mod service;
pub mod observer;

pub use discovery_node::{DiscoveryNode, PROTOCOL_VERSION};
pub use state::{ClusterState, ClusterStateBuilder, ClusterChangedEvent, ClusterSummary};
pub use service::{ClusterService, ClusterStateListener, ListenerId, PendingUpdate, Registration};
pub use observer::{ClusterStateObserver, Listener, WaitHandle, WaitOutcome, WaitState};
