//! Observable field adapters for the Tessel store.
//!
//! Each adapter binds to one `(schema, record, field)` triple of a
//! [`Datastore`](tessel_store::Datastore) without owning it, reads through to
//! the store, and writes small deltas inside a transaction scope:
//!
//! - [`ObservableValue`]: register fields
//! - [`ObservableString`]: text fields, edited by character splices
//! - [`ObservableMap`]: string-keyed JSON maps
//! - [`ObservableList`]: ordered JSON lists
//! - [`UndoableList`]: an `ObservableList` with compound-aware undo and redo
//!
//! Adapters translate the store's raw previous/current change records into
//! typed events on [`changed()`](ObservableList::changed). Events tag their
//! [`ChangeOrigin`](tessel_store::ChangeOrigin), so a local edit and a
//! remote transaction are told apart. Writes that would not change the
//! stored value produce no transaction.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use serde_json::json;
//! use tessel_fields::ObservableList;
//! use tessel_store::{Datastore, Schema};
//! use tessel_types::StoreId;
//!
//! let store = Arc::new(Datastore::new(StoreId::new(1), [Schema::new("cells").list("order")]));
//! let order = ObservableList::new(&store, "cells", "root", "order").unwrap();
//! let _sub = order.changed().connect(|change| println!("{:?}", change.kind));
//! order.push(json!("c1")).unwrap();
//! assert_eq!(order.to_vec().unwrap(), vec![json!("c1")]);
//! ```

mod binding;
mod error;
pub mod list;
pub mod map;
pub mod string;
pub mod undo;
pub mod value;

pub use error::{FieldError, FieldResult};
pub use list::{ListChange, ListChangeKind, ObservableList};
pub use map::{MapChange, MapChangeKind, ObservableMap};
pub use string::{ObservableString, StringChange};
pub use undo::{UndoConfig, UndoableList};
pub use value::{ObservableValue, ValueChange};
