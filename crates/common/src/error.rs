//! Error types for netplane

use thiserror::Error;

/// Result type alias using netplane Error
pub type Result<T> = std::result::Result<T, Error>;

/// netplane error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Malformed input, rejected before any external mutation is attempted
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Resource not found: {kind} with id {id}")]
    NotFound { kind: String, id: String },

    #[error("Resource already exists: {kind} with id {id}")]
    AlreadyExists { kind: String, id: String },

    /// A kernel or container-runtime call failed
    #[error("External state error during {operation}: {message}")]
    ExternalState { operation: String, message: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Node is not provisioned; run `netplaned setup` first")]
    NotProvisioned,
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn not_found(kind: &str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.to_string(),
            id: id.into(),
        }
    }

    pub fn already_exists(kind: &str, id: impl Into<String>) -> Self {
        Error::AlreadyExists {
            kind: kind.to_string(),
            id: id.into(),
        }
    }

    pub fn external(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ExternalState {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Whether the error was raised by input validation
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation(_))
    }

    /// Whether the error originated in the kernel or container runtime
    pub fn is_external(&self) -> bool {
        matches!(self, Error::ExternalState { .. })
    }
}
