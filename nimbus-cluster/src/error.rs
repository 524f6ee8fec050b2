//! Error types for the nimbus-cluster crate.

use std::io;
use thiserror::Error;

/// Main error type for cluster operations
#[derive(Error, Debug)]
pub enum ClusterError {
    /// Invalid template, option value or command argument
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Provisioning or SSH deadline exceeded
    #[error("Timeout: {0}")]
    TimeoutError(String),

    /// Referenced node is not part of the cluster inventory
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// No persisted state exists for the named cluster
    #[error("Cluster not found: {0}")]
    ClusterNotFound(String),

    /// The cloud provider rejected or failed a request
    #[error("Provider error: {0}")]
    ProviderError(String),

    /// Network level failure talking to a node
    #[error("Network error: {0}")]
    NetworkError(String),

    /// SSH protocol, authentication or host key failure
    #[error("SSH error: {0}")]
    SshError(String),

    /// The configuration-management collaborator could not be run
    #[error("Setup error: {0}")]
    SetupError(String),

    /// Persisted state could not be read or written
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Invalid operation
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// IO error occurred
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

/// Type alias for Result with ClusterError
pub type ClusterResult<T> = Result<T, ClusterError>;

impl ClusterError {
    /// Whether the error is a deadline expiry
    pub fn is_timeout(&self) -> bool {
        matches!(self, ClusterError::TimeoutError(_))
    }
}

impl From<serde_yaml::Error> for ClusterError {
    fn from(err: serde_yaml::Error) -> Self {
        ClusterError::SerializationError(err.to_string())
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(err: serde_json::Error) -> Self {
        ClusterError::SerializationError(err.to_string())
    }
}

impl From<bincode::Error> for ClusterError {
    fn from(err: bincode::Error) -> Self {
        ClusterError::SerializationError(err.to_string())
    }
}

impl From<ssh2::Error> for ClusterError {
    fn from(err: ssh2::Error) -> Self {
        ClusterError::SshError(err.to_string())
    }
}

impl From<tokio::task::JoinError> for ClusterError {
    fn from(err: tokio::task::JoinError) -> Self {
        ClusterError::InvalidOperation(format!("background task failed: {}", err))
    }
}
