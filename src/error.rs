//! Nmid-Registry Error Types

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for registry operations
pub type Result<T> = std::result::Result<T, Error>;

/// Registry error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Cluster name mismatch: local '{local}' != stored '{stored}'")]
    ClusterNameMismatch { local: String, stored: String },

    #[error("Membership file {path:?} is corrupted: {reason}")]
    MembersCorrupted { path: PathBuf, reason: String },

    // Store errors
    #[error("Store error: {0}")]
    Store(String),

    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Store instance not ready after {0:?}")]
    StartupTimeout(Duration),

    #[error("Store instance is not ready")]
    HostNotReady,

    #[error("Store instance failed: {0}")]
    HostFailed(String),

    // Coordination errors
    #[error("Lease is not ready")]
    LeaseNotReady,

    #[error("Mutex {0} is not locked")]
    NotLocked(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error must stop the node instead of being retried.
    ///
    /// Configuration-fatal errors indicate a misconfigured deployment; the
    /// bootstrap loop surfaces them immediately.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Config(_)
                | Error::ConfigParse(_)
                | Error::ClusterNameMismatch { .. }
                | Error::MembersCorrupted { .. }
        )
    }

    /// Check if this error is retryable on the next scheduled tick
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Store(_)
                | Error::Etcd(_)
                | Error::Unavailable(_)
                | Error::Timeout(_)
                | Error::StartupTimeout(_)
                | Error::HostNotReady
                | Error::HostFailed(_)
                | Error::LeaseNotReady
        )
    }
}
