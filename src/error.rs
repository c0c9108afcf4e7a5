//! Agentloop error types

use thiserror::Error;

/// Agentloop error type
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Wire protocol error (malformed or unknown command)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Session error
    #[error("Session error: {0}")]
    Session(String),

    /// Service supervision error
    #[error("Service error: {0}")]
    Service(String),

    /// Completion request error
    #[error("Completion error: {0}")]
    Completion(String),

    /// Backend returned an empty final content string
    #[error("Completion returned empty content")]
    EmptyCompletion,

    /// Tool execution error
    #[error("Tool error: {0}")]
    Tool(String),

    /// Path resolves outside the sandboxed workspace root
    #[error("Path escapes workspace root: {0}")]
    PathEscape(String),

    /// Gateway error
    #[error("Gateway error: {0}")]
    Gateway(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for agentloop operations
pub type Result<T> = std::result::Result<T, Error>;
