//! Error types for Lifeline Mesh operations.
//!
//! Only [`MeshError`] values reach callers, and only for local storage
//! problems. Radio trouble during an exchange is a [`TransientError`]: it is
//! logged and counted by the courier, never propagated.

use lifeline_radio::RadioError;
use thiserror::Error;

/// Errors that can occur in mesh operations.
#[derive(Debug, Error)]
pub enum MeshError {
    /// Durable queue storage errors
    #[error("Queue storage error: {0}")]
    QueueStorage(String),

    /// Database errors (received ledger)
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Local I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Core errors (configuration, canonical hashing)
    #[error("Core error: {0}")]
    Core(#[from] lifeline_core::CoreError),

    /// Wire codec errors
    #[error("Codec error: {0}")]
    Codec(String),

    /// Frame payload was not valid base64
    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Result type for mesh operations.
pub type MeshResult<T> = Result<T, MeshError>;

/// A failed peer contact. Abandons the peer for this cycle; never fatal.
#[derive(Debug, Error)]
pub enum TransientError {
    /// Radio operation failed
    #[error("Radio error: {0}")]
    Radio(#[from] RadioError),

    /// Radio operation did not complete in time
    #[error("Radio {op} timed out after {timeout_ms}ms")]
    Timeout { op: &'static str, timeout_ms: u64 },

    /// Peer sent something we could not decode
    #[error("Undecodable bundle: {0}")]
    Decode(String),

    /// Local store failed while handling this peer
    #[error("Local store error during exchange: {0}")]
    Store(#[from] MeshError),
}
