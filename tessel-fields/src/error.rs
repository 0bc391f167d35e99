//! Error types for field adapters.

use tessel_store::StoreError;
use thiserror::Error;

/// Result type for field operations.
pub type FieldResult<T> = Result<T, FieldError>;

/// Errors returned by field adapters.
#[derive(Debug, Error)]
pub enum FieldError {
    /// `null` is how the store represents an absent value; use the
    /// adapter's removal operation instead of writing it.
    #[error("cannot write null; use a removal operation")]
    AbsentValue,

    #[error("index {index} out of range for length {len}")]
    IndexOutOfRange { index: usize, len: usize },

    /// The store the adapter was bound to has been dropped.
    #[error("store has been dropped")]
    StoreDropped,

    /// Undo and redo cannot run inside an open transaction.
    #[error("a transaction is open")]
    TransactionOpen,

    #[error(transparent)]
    Store(#[from] StoreError),
}
