//! Reference store engine for Tessel.
//!
//! The synchronization core treats the store as a black box exposing
//! `table / update / begin_transaction / end_transaction / in_transaction`
//! and a change notification. This crate provides an in-memory engine with
//! that boundary:
//!
//! - [`Schema`] / [`FieldKind`]: table shapes (text, list, map, register fields)
//! - [`Datastore`]: tables of records, reentrant transaction scopes,
//!   remote transaction application, checkpoints
//! - [`StoreChange`] / [`FieldChange`]: raw previous/current change records
//! - [`Signal`] / [`Subscription`]: typed listener channels with
//!   deterministic disconnection
//!
//! Patches are applied in the order they are received. Concurrent-edit
//! merging is not attempted: the server's total order is the merge.

mod change;
mod datastore;
mod error;
mod schema;
mod signal;

pub use change::{ChangeOrigin, ChangeSet, FieldChange, StoreChange};
pub use datastore::{ApplyFailure, ApplyOutcome, Datastore, Table, TableUpdate};
pub use error::{StoreError, StoreResult};
pub use schema::{FieldKind, FieldValue, Schema};
pub use signal::{Signal, Subscription};
