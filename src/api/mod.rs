//! API Module
//!
//! HTTP API for querying the node's cluster state.

mod http;

pub use http::{HttpServer, AppState, StatusResponse, HealthResponse, NodesResponse, ErrorResponse};
