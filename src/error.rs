//! Error types for the SMS forwarder.

use thiserror::Error;

/// Top-level error type for the forwarder.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Inbox error: {0}")]
    Inbox(#[from] InboxError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required settings: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Persisted state store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to open store: {0}")]
    Open(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Failures querying the SMS inbox.
///
/// All of these abort the current scan only; the cursor is left untouched
/// and the next trigger retries.
#[derive(Debug, Error)]
pub enum InboxError {
    #[error("SMS access permission denied: {0}")]
    PermissionDenied(String),

    #[error("SMS store unavailable: {0}")]
    Unavailable(String),

    #[error("SMS query failed: {0}")]
    Query(String),
}

/// Classified outcome of a single mail dispatch attempt.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Target address, username or password missing. Never retried.
    #[error("Mail settings not configured: {0}")]
    IncompleteConfig(String),

    #[error("SMTP authentication failed: {0}")]
    Auth(String),

    #[error("SMTP connection failed: {0}")]
    Connection(String),

    #[error("SMTP protocol error: {0}")]
    Protocol(String),

    #[error("Mail send failed: {0}")]
    Unknown(String),
}

impl DispatchError {
    /// Whether the queue should retry after this failure.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::IncompleteConfig(_))
    }
}

/// Forward queue errors.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Forward queue worker is gone")]
    Closed,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Result type alias for the forwarder.
pub type Result<T> = std::result::Result<T, Error>;
