//! Single-node discovery
//!
//! For a node that never looks for peers: the initial join installs the
//! local node as the only member and as master.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::Discovery;
use crate::cluster::{ClusterService, ClusterState, DiscoveryNode, PendingUpdate};
use crate::error::{Error, Result};

/// Source of the update submitted by the initial join
pub const INITIAL_JOIN_SOURCE: &str = "single-node-start-initial-join";

/// Discovery for a cluster made of exactly this node
pub struct SingleNodeDiscovery {
    local_node: DiscoveryNode,
    cluster: Arc<ClusterService>,
    running: AtomicBool,
}

impl SingleNodeDiscovery {
    pub fn new(local_node: DiscoveryNode, cluster: Arc<ClusterService>) -> Self {
        Self {
            local_node,
            cluster,
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// The transition the initial join applies: `{local}` as members, local as master
    fn elect_local(local: &DiscoveryNode, state: &ClusterState) -> Result<ClusterState> {
        state
            .builder()
            .clear_nodes()
            .add_node(local.clone())
            .master_node_id(Some(local.id().to_string()))
            .build()
    }
}

#[async_trait::async_trait]
impl Discovery for SingleNodeDiscovery {
    fn local_node(&self) -> &DiscoveryNode {
        &self.local_node
    }

    fn minimum_master_nodes(&self) -> usize {
        1
    }

    async fn start(&self) -> Result<()> {
        if !self.running.swap(true, Ordering::AcqRel) {
            tracing::info!("Single-node discovery started for {}", self.local_node);
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if self.running.swap(false, Ordering::AcqRel) {
            tracing::info!("Single-node discovery stopped");
        }
        Ok(())
    }

    fn start_initial_join(&self) -> Result<PendingUpdate> {
        if !self.is_running() {
            return Err(Error::NotStarted("single-node discovery".into()));
        }

        tracing::info!("Electing {} as master of a single-node cluster", self.local_node.id());
        let local = self.local_node.clone();
        Ok(self
            .cluster
            .submit_state_update_task(INITIAL_JOIN_SOURCE, move |state| Self::elect_local(&local, state)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterStateObserver, Listener, WaitOutcome};
    use std::sync::Mutex;
    use std::time::Duration;

    fn setup() -> (DiscoveryNode, Arc<ClusterService>, SingleNodeDiscovery) {
        let node = DiscoveryNode::new("node-1", "127.0.0.1:9300");
        let cluster = ClusterService::start(ClusterState::initial("test", node.clone())).unwrap();
        let discovery = SingleNodeDiscovery::new(node.clone(), cluster.clone());
        (node, cluster, discovery)
    }

    #[tokio::test]
    async fn test_initial_join() {
        let (node, cluster, discovery) = setup();
        discovery.start().await.unwrap();

        // Racing the asynchronous join, so observe rather than poll
        let state = cluster.state();
        let observer = ClusterStateObserver::with_state(cluster.clone(), state.clone(), None);
        let _join = discovery.start_initial_join().unwrap();

        if !state.has_master() {
            let outcome = observer
                .wait_for_next(|s| s.master_node_id().is_some(), None)
                .await;
            assert!(matches!(outcome, WaitOutcome::Matched(_)));
        }

        let state = cluster.state();
        assert_eq!(state.size(), 1);
        assert_eq!(state.master_node().unwrap().id(), node.id());
    }

    #[tokio::test]
    async fn test_observer_registered_before_join_sees_master() {
        struct Capture(Mutex<Option<Arc<ClusterState>>>);

        impl Listener for Arc<Capture> {
            fn on_new_cluster_state(&self, state: Arc<ClusterState>) {
                *self.0.lock().unwrap() = Some(state);
            }
            fn on_cluster_service_close(&self) {
                panic!("unexpected close");
            }
            fn on_timeout(&self, _timeout: Duration) {
                panic!("unexpected timeout");
            }
        }

        let (node, cluster, discovery) = setup();
        discovery.start().await.unwrap();

        let capture = Arc::new(Capture(Mutex::new(None)));
        let observer = ClusterStateObserver::new(cluster.clone());
        let handle = observer.wait_for_change(|s| s.has_master(), capture.clone(), None);
        assert!(!handle.is_resolved());

        let applied = discovery.start_initial_join().unwrap().await.unwrap().unwrap();
        assert!(handle.is_resolved());

        let seen = capture.0.lock().unwrap().clone().unwrap();
        assert_eq!(seen.size(), 1);
        assert_eq!(seen.master_node_id(), Some(node.id()));
        assert_eq!(seen.version(), applied.version());
    }

    #[tokio::test]
    async fn test_repeated_join_is_idempotent_but_advances_version() {
        let (node, _cluster, discovery) = setup();
        discovery.start().await.unwrap();

        let first = discovery.start_initial_join().unwrap().await.unwrap().unwrap();
        let second = discovery.start_initial_join().unwrap().await.unwrap().unwrap();

        assert!(first.same_membership(&second));
        assert!(second.version() > first.version());
        assert!(second.is_master(node.id()));
    }

    #[tokio::test]
    async fn test_join_replaces_stale_members() {
        let (node, cluster, discovery) = setup();
        discovery.start().await.unwrap();

        cluster
            .submit_state_update_task("stale", |state| {
                state
                    .builder()
                    .add_node(DiscoveryNode::new("ghost", "10.0.0.9:9300"))
                    .master_node_id(Some("ghost".into()))
                    .build()
            })
            .await
            .unwrap();

        let state = discovery.start_initial_join().unwrap().await.unwrap().unwrap();
        assert_eq!(state.size(), 1);
        assert!(state.node("ghost").is_none());
        assert!(state.is_master(node.id()));
    }

    #[tokio::test]
    async fn test_join_requires_start() {
        let (_node, _cluster, discovery) = setup();
        assert!(matches!(discovery.start_initial_join(), Err(Error::NotStarted(_))));

        discovery.start().await.unwrap();
        discovery.stop().await.unwrap();
        assert!(!discovery.is_running());
        assert_eq!(discovery.minimum_master_nodes(), 1);
    }
}
