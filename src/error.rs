//! Error types for keygraph
//!
//! All modules use `KeygraphResult<T>` as their return type. A cache miss is
//! never an error: lookups return empty collections instead.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for keygraph operations
pub type KeygraphResult<T> = Result<T, KeygraphError>;

/// All errors that can occur in keygraph
#[derive(Error, Debug)]
pub enum KeygraphError {
    // Key/link storage errors
    #[error("Cache key not found: {0}")]
    KeyNotFound(String),

    #[error("Result {result} not found under cache key {key}")]
    ResultNotFound { key: String, result: String },

    #[error("Storage backend failed during {operation}: {reason}")]
    Backend { operation: String, reason: String },

    // Result storage errors
    #[error("Artifact not found: {0}")]
    ArtifactNotFound(String),

    // Manager errors
    #[error("Record {record} belongs to a different cache manager than {manager}")]
    ForeignRecord { record: String, manager: String },

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to initialize logging: {0}")]
    Logging(String),

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl KeygraphError {
    /// Create a backend failure for the named storage operation
    pub fn backend(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Backend {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Whether the failure is transient and the operation may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Backend { .. } | Self::Io { .. })
    }

    /// Whether the error reports a missing entry in one of the stores
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::KeyNotFound(_) | Self::ResultNotFound { .. } | Self::ArtifactNotFound(_)
        )
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::ArtifactNotFound(_) => {
                Some("The artifact was removed from result storage; run release_unreferenced")
            }
            Self::ForeignRecord { .. } => {
                Some("Load records through the manager that returned them")
            }
            Self::Logging(_) => Some("A global tracing subscriber is already installed"),
            _ => None,
        }
    }
}
