//! Error types for clinic-sentinel

use thiserror::Error;

/// Errors that can occur in the security pipeline
///
/// Collaborator failures (store, channels) are caught by the recorder and
/// escalator and never reach the business operation being observed. Only
/// construction-time failures are returned to callers.
#[derive(Debug, Error)]
pub enum SentinelError {
    /// Audit store connection failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Generic audit store failure
    #[error("Store error: {0}")]
    Store(String),

    /// Append failure
    #[error("Failed to append event to store '{store}': {reason}")]
    Append {
        store: String,
        reason: String,
    },

    /// Stream creation or management error
    #[error("Stream error: {0}")]
    Stream(String),

    /// Notification channel failure
    #[error("Channel '{channel}' failed: {reason}")]
    Channel {
        channel: String,
        reason: String,
    },

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A detection signature failed to compile
    #[error("Invalid signature '{signature}': {reason}")]
    InvalidPattern {
        signature: String,
        reason: String,
    },

    /// Encryption or decryption failure
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// The escalation dispatch worker has shut down
    #[error("Escalation dispatcher is closed")]
    DispatcherClosed,
}

/// Result type alias for sentinel operations
pub type Result<T> = std::result::Result<T, SentinelError>;
