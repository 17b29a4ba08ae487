//! HTTP API Server
//!
//! Read-only REST API exposing the node's view of the cluster state.

use std::sync::Arc;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::cluster::{ClusterService, ClusterSummary, DiscoveryNode};
use crate::config::ApiConfig;
use crate::error::{Error, Result};

/// Shared application state
pub struct AppState {
    /// Local node ID
    pub node_id: String,
    /// Cluster service
    pub cluster: Arc<ClusterService>,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(config: ApiConfig, node_id: String, cluster: Arc<ClusterService>) -> Self {
        let state = Arc::new(AppState { node_id, cluster });
        Self { config, state }
    }

    /// Create the router
    pub fn router(&self) -> Router {
        let router = Router::new()
            .route("/health", get(handle_health))
            .route("/status", get(handle_status))
            .route("/cluster/state", get(handle_cluster_state))
            .route("/cluster/nodes", get(handle_nodes))
            .route("/cluster/nodes/:node_id", get(handle_node_info))
            .with_state(Arc::clone(&self.state))
            .layer(TraceLayer::new_for_http());

        if self.config.cors_enabled {
            router.layer(CorsLayer::permissive())
        } else {
            router
        }
    }

    /// Start the HTTP server
    pub async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let app = self.router();

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, app)
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

// ============ Response Types ============

/// Status response
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub node_id: String,
    pub is_master: bool,
    pub master_id: Option<String>,
    pub cluster_name: String,
    pub version: u64,
    pub cluster_size: usize,
    pub closed: bool,
}

/// Health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub node_id: String,
}

/// Node list response
#[derive(Debug, Serialize, Deserialize)]
pub struct NodesResponse {
    pub summary: ClusterSummary,
    pub nodes: Vec<DiscoveryNode>,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

// ============ Handlers ============

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        healthy: !state.cluster.is_closed(),
        node_id: state.node_id.clone(),
    })
}

async fn handle_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let cluster_state = state.cluster.state();

    Json(StatusResponse {
        node_id: state.node_id.clone(),
        is_master: cluster_state.is_master(&state.node_id),
        master_id: cluster_state.master_node_id().map(str::to_string),
        cluster_name: cluster_state.cluster_name().to_string(),
        version: cluster_state.version(),
        cluster_size: cluster_state.size(),
        closed: state.cluster.is_closed(),
    })
}

async fn handle_cluster_state(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let cluster_state = state.cluster.state();
    Json(cluster_state.as_ref().clone())
}

async fn handle_nodes(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let cluster_state = state.cluster.state();
    Json(NodesResponse {
        summary: cluster_state.summary(),
        nodes: cluster_state.nodes().cloned().collect(),
    })
}

async fn handle_node_info(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
) -> impl IntoResponse {
    let cluster_state = state.cluster.state();
    match cluster_state.node(&node_id) {
        Some(node) => Json(node.clone()).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: Error::NodeNotFound(node_id).to_string(),
                code: "NODE_NOT_FOUND".to_string(),
            }),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::cluster::ClusterState;
    use crate::discovery::{Discovery, SingleNodeDiscovery};

    async fn started_server() -> HttpServer {
        let node = DiscoveryNode::new("node-1", "127.0.0.1:9300");
        let cluster = ClusterService::start(ClusterState::initial("test", node.clone())).unwrap();
        let discovery = SingleNodeDiscovery::new(node, Arc::clone(&cluster));
        discovery.start().await.unwrap();
        discovery.start_initial_join().unwrap().await.unwrap();

        HttpServer::new(ApiConfig::default(), "node-1".into(), cluster)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(server: &HttpServer, uri: &str) -> (StatusCode, T) {
        let response = server
            .router()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_status_reports_master() {
        let server = started_server().await;
        let (status, body): (_, StatusResponse) = get_json(&server, "/status").await;

        assert_eq!(status, StatusCode::OK);
        assert!(body.is_master);
        assert_eq!(body.master_id.as_deref(), Some("node-1"));
        assert_eq!(body.cluster_size, 1);
        assert_eq!(body.version, 1);
        assert!(!body.closed);
    }

    #[tokio::test]
    async fn test_cluster_state_and_nodes() {
        let server = started_server().await;

        let (_, state): (_, ClusterState) = get_json(&server, "/cluster/state").await;
        assert_eq!(state.master_node_id(), Some("node-1"));

        let (_, nodes): (_, NodesResponse) = get_json(&server, "/cluster/nodes").await;
        assert_eq!(nodes.nodes.len(), 1);
        assert_eq!(nodes.summary.master_id.as_deref(), Some("node-1"));

        let (status, node): (_, DiscoveryNode) = get_json(&server, "/cluster/nodes/node-1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(node.address(), "127.0.0.1:9300");
    }

    #[tokio::test]
    async fn test_unknown_node_is_404() {
        let server = started_server().await;
        let (status, body): (_, ErrorResponse) = get_json(&server, "/cluster/nodes/ghost").await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body.code, "NODE_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_health_after_close() {
        let server = started_server().await;
        server.state.cluster.close();

        let (_, body): (_, HealthResponse) = get_json(&server, "/health").await;
        assert!(!body.healthy);
    }
}
