//! Error types for the sync layer.

use tessel_store::StoreError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Network error.
    #[error("network error: {0}")]
    Network(String),

    /// Protocol error (invalid message format or unexpected reply).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The local store rejected an operation.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A request was not answered in time.
    #[error("operation timed out")]
    Timeout,

    /// Channel closed.
    #[error("channel closed")]
    ChannelClosed,

    /// There is no open connection to send on.
    #[error("not connected")]
    NotConnected,

    /// The connection dropped while a request was outstanding.
    #[error("connection closed")]
    ConnectionClosed,

    /// The server answered with an `error-reply`.
    #[error("server error: {0}")]
    Remote(String),

    /// A serial arrived out of order.
    #[error("serial gap: expected {expected}, got {actual}")]
    SerialGap { expected: u64, actual: u64 },

    /// The manager hit an unrecoverable ordering violation earlier.
    #[error("sync stopped after fatal error: {0}")]
    Fatal(String),
}

impl SyncError {
    /// Whether the error means the local replica can no longer be trusted
    /// to match the server.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::SerialGap { .. } | Self::Fatal(_) | Self::Store(_)
        )
    }
}
