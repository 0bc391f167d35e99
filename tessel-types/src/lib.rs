//! Core type definitions for Tessel.
//!
//! This crate defines the plain data shared by every layer of the
//! synchronization core:
//! - Transaction and message identifiers (UUID v7)
//! - Store identity and the schema / record / field naming triple
//! - Transactions and their kind-specific field patches
//!
//! Nothing here performs I/O or owns state; the store engine, the sync
//! manager and the field adapters all speak in these types.

mod ids;
mod transaction;

pub use ids::{FieldId, MessageId, RecordId, SchemaId, StoreId, TransactionId};
pub use transaction::{
    FieldPatch, FieldUpdate, ListSplice, SerialTransaction, TextSplice, Transaction,
};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),
}
