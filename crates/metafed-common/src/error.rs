//! Error types for MetaFed
//!
//! This module defines the common error types used throughout the system.

use thiserror::Error;

/// Common result type for MetaFed operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for MetaFed
#[derive(Debug, Error)]
pub enum Error {
    // Federation errors
    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("request timed out after {0} seconds")]
    Timeout(u64),

    #[error("no backend available for operation")]
    NoBackendAvailable,

    // Backend errors
    #[error("unknown backend kind: {0}")]
    UnknownBackendKind(String),

    #[error("backend not started: {0}")]
    BackendNotStarted(String),

    #[error("name translation failed: no rule matches {0}")]
    NoXlationMatch(String),

    // Cache errors
    #[error("record encoding error: {0}")]
    Encoding(String),

    #[error("record decoding error: {0}")]
    Decoding(String),

    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // Generic
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
