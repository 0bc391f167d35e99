//! Error types for the store engine.

use tessel_types::{FieldId, SchemaId};
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The schema is not registered with the store.
    #[error("unknown schema: {0}")]
    UnknownSchema(SchemaId),

    /// The field is not declared by its schema.
    #[error("unknown field `{field}` in schema `{schema}`")]
    UnknownField { schema: SchemaId, field: FieldId },

    /// An update or value does not match the declared field kind.
    #[error("field `{field}` is a {expected} field, got a {actual} update")]
    KindMismatch {
        field: FieldId,
        expected: &'static str,
        actual: &'static str,
    },

    /// A write was attempted outside a transaction scope.
    #[error("update outside of a transaction")]
    NotInTransaction,

    /// A splice addresses positions past the end of the field.
    #[error("splice at {index} out of range for `{field}` of length {len}")]
    SpliceOutOfRange {
        field: FieldId,
        index: usize,
        len: usize,
    },

    /// A splice's recorded removal does not match the field's contents.
    #[error("splice at {index} does not match the contents of `{field}`")]
    SpliceMismatch { field: FieldId, index: usize },

    /// A checkpoint could not be restored.
    #[error("invalid checkpoint: {0}")]
    InvalidCheckpoint(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
