//! Node Lifecycle
//!
//! Wires the local identity, the cluster service and discovery together and
//! runs the startup sequence: start discovery, submit the initial join and
//! wait until a master has been elected.

use std::sync::{Arc, Mutex, PoisonError};

use crate::cluster::{ClusterService, ClusterState, ClusterStateObserver, DiscoveryNode};
use crate::config::WolfClusterConfig;
use crate::discovery::{Discovery, SingleNodeDiscovery};
use crate::error::{Error, Result};

/// Lifecycle of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Created, discovery not started
    Initialized,
    /// Starting discovery and submitting the initial join
    Starting,
    /// Discovery running, initial join submitted
    Started,
    /// Shut down; cannot be restarted
    Closed,
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Lifecycle::Initialized => write!(f, "INITIALIZED"),
            Lifecycle::Starting => write!(f, "STARTING"),
            Lifecycle::Started => write!(f, "STARTED"),
            Lifecycle::Closed => write!(f, "CLOSED"),
        }
    }
}

/// A cluster node
pub struct Node {
    config: WolfClusterConfig,
    local_node: DiscoveryNode,
    cluster: Arc<ClusterService>,
    discovery: Box<dyn Discovery>,
    lifecycle: Mutex<Lifecycle>,
}

impl Node {
    /// Resolve the local identity and create the cluster service.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: WolfClusterConfig) -> Result<Self> {
        Self::with_discovery(config, |local_node, cluster| {
            Box::new(SingleNodeDiscovery::new(local_node, cluster))
        })
    }

    /// Like [`Node::new`], with discovery built by `discovery`
    pub fn with_discovery<F>(config: WolfClusterConfig, discovery: F) -> Result<Self>
    where
        F: FnOnce(DiscoveryNode, Arc<ClusterService>) -> Box<dyn Discovery>,
    {
        config.validate()?;

        let local_node = DiscoveryNode::from_config(&config.node)?;
        let initial = ClusterState::initial(config.cluster.name.clone(), local_node.clone());
        let cluster = ClusterService::start(initial)?;
        let discovery = discovery(local_node.clone(), Arc::clone(&cluster));

        tracing::info!("Initialized node {} in cluster [{}]", local_node, config.cluster.name);

        Ok(Self {
            config,
            local_node,
            cluster,
            discovery,
            lifecycle: Mutex::new(Lifecycle::Initialized),
        })
    }

    pub fn local_node(&self) -> &DiscoveryNode {
        &self.local_node
    }

    pub fn cluster(&self) -> &Arc<ClusterService> {
        &self.cluster
    }

    pub fn config(&self) -> &WolfClusterConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start discovery, join and wait for a master to be elected.
    ///
    /// Returns the first state with a master, or `WaitTimeout` if none
    /// appeared within `cluster.initial_join_timeout_ms`. If discovery fails
    /// to start or to submit the join, the node goes back to `Initialized`
    /// and `start` may be retried.
    pub async fn start(&self) -> Result<Arc<ClusterState>> {
        {
            let mut lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
            match *lifecycle {
                Lifecycle::Initialized => *lifecycle = Lifecycle::Starting,
                Lifecycle::Starting | Lifecycle::Started => {
                    return Err(Error::Internal("node already started".into()))
                }
                Lifecycle::Closed => return Err(Error::Closed),
            }
        }

        // The join timeout budget starts before the join is submitted
        let observer = ClusterStateObserver::with_timeout(
            Arc::clone(&self.cluster),
            self.config.initial_join_timeout(),
        );

        if let Err(e) = self.join().await {
            tracing::warn!("Node {} failed to start discovery: {}", self.local_node.id(), e);
            let mut lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
            if *lifecycle == Lifecycle::Starting {
                *lifecycle = Lifecycle::Initialized;
            }
            return Err(e);
        }

        {
            let mut lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
            if *lifecycle == Lifecycle::Closed {
                return Err(Error::Closed);
            }
            *lifecycle = Lifecycle::Started;
        }

        let state = observer
            .wait_for(|state| state.has_master(), None)
            .await
            .into_result()?;

        tracing::info!(
            "Node {} started, master is [{}] at cluster state version {}",
            self.local_node.id(),
            state.master_node_id().unwrap_or("-"),
            state.version()
        );
        Ok(state)
    }

    async fn join(&self) -> Result<()> {
        self.discovery.start().await?;
        // Completion is observed by the caller; the handle itself is not needed
        drop(self.discovery.start_initial_join()?);
        Ok(())
    }

    /// Stop discovery and close the cluster service. Safe to call more than once.
    pub async fn close(&self) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
            if *lifecycle == Lifecycle::Closed {
                return Ok(());
            }
            *lifecycle = Lifecycle::Closed;
        }

        self.discovery.stop().await?;
        self.cluster.close();
        tracing::info!("Node {} closed", self.local_node.id());
        Ok(())
    }
}
