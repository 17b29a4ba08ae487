//! WolfCluster Error Types

use std::time::Duration;
use thiserror::Error;

/// Result type alias for WolfCluster operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfCluster error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Failed to serialize configuration: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    // Cluster state errors
    #[error("Invalid cluster state: {0}")]
    InvalidState(String),

    #[error("Cluster state update [{task}] failed: {reason}")]
    Transition { task: String, reason: String },

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    // Lifecycle errors
    #[error("Component not started: {0}")]
    NotStarted(String),

    #[error("Cluster service closed")]
    Closed,

    #[error("Timed out after {0:?} waiting for cluster state")]
    WaitTimeout(Duration),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::WaitTimeout(_) | Error::Network(_))
    }

    /// Check if this error means the cluster service is gone for good
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Closed)
    }
}
