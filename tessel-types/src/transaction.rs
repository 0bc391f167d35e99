//! Transactions and the field patches they carry.
//!
//! A transaction is an immutable, engine-produced patch targeting one or
//! more `(schema, record, field)` triples. Once the server accepts it, it is
//! delivered to every replica annotated with a serial number that totally
//! orders all accepted transactions.

use crate::{FieldId, RecordId, SchemaId, StoreId, TransactionId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// One splice of a text field. Indices count Unicode scalar values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextSplice {
    /// Position of the first affected character.
    pub index: usize,
    /// Text removed at `index`.
    #[serde(default)]
    pub removed: String,
    /// Text inserted at `index` after the removal.
    #[serde(default)]
    pub inserted: String,
}

impl TextSplice {
    /// Number of characters the splice removes.
    #[must_use]
    pub fn removed_len(&self) -> usize {
        self.removed.chars().count()
    }
}

/// One splice of a list field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListSplice {
    /// Position of the first affected element.
    pub index: usize,
    /// Elements removed at `index`.
    #[serde(default)]
    pub removed: Vec<Value>,
    /// Elements inserted at `index` after the removal.
    #[serde(default)]
    pub inserted: Vec<Value>,
}

/// A kind-specific delta for one field.
///
/// Map entries set to `null` delete the key: the engine has no separate
/// notion of an absent value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldUpdate {
    /// Ordered splices applied to a text field.
    Text { splices: Vec<TextSplice> },
    /// Ordered splices applied to a list field.
    List { splices: Vec<ListSplice> },
    /// Key-level assignments applied to a map field.
    Map { entries: BTreeMap<String, Value> },
    /// Replacement value of a register field.
    Register { value: Value },
}

impl FieldUpdate {
    /// Convenience constructor for a single text splice.
    #[must_use]
    pub fn text(index: usize, removed: impl Into<String>, inserted: impl Into<String>) -> Self {
        Self::Text {
            splices: vec![TextSplice {
                index,
                removed: removed.into(),
                inserted: inserted.into(),
            }],
        }
    }

    /// Convenience constructor for a single list splice.
    #[must_use]
    pub fn list(index: usize, removed: Vec<Value>, inserted: Vec<Value>) -> Self {
        Self::List {
            splices: vec![ListSplice {
                index,
                removed,
                inserted,
            }],
        }
    }

    /// Convenience constructor for a register write.
    #[must_use]
    pub fn register(value: Value) -> Self {
        Self::Register { value }
    }

    /// Short name of the field kind this update targets.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::List { .. } => "list",
            Self::Map { .. } => "map",
            Self::Register { .. } => "register",
        }
    }

    /// Whether applying the update can have no effect.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text { splices } => splices
                .iter()
                .all(|s| s.removed.is_empty() && s.inserted.is_empty()),
            Self::List { splices } => splices
                .iter()
                .all(|s| s.removed.is_empty() && s.inserted.is_empty()),
            Self::Map { entries } => entries.is_empty(),
            Self::Register { .. } => false,
        }
    }
}

/// A field update addressed to its `(schema, record, field)` triple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldPatch {
    pub schema: SchemaId,
    pub record: RecordId,
    pub field: FieldId,
    pub update: FieldUpdate,
}

/// An atomic patch to one or more record fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    /// Unique identifier for this transaction.
    pub id: TransactionId,
    /// The replica that originated the transaction.
    pub store_id: StoreId,
    /// Field updates in application order.
    pub patch: Vec<FieldPatch>,
}

impl Transaction {
    /// Creates a transaction with a fresh id.
    #[must_use]
    pub fn new(store_id: StoreId, patch: Vec<FieldPatch>) -> Self {
        Self {
            id: TransactionId::new(),
            store_id,
            patch,
        }
    }

    /// Whether the transaction carries no field updates.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patch.is_empty()
    }

    /// Whether any patch in the transaction targets the given triple.
    #[must_use]
    pub fn touches(&self, schema: &SchemaId, record: &RecordId, field: &FieldId) -> bool {
        self.patch
            .iter()
            .any(|p| &p.schema == schema && &p.record == record && &p.field == field)
    }
}

/// A transaction annotated with its serial number.
///
/// Outgoing transactions carry the originating client's local serial; the
/// server replaces it with its own total-order serial on acceptance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialTransaction {
    #[serde(flatten)]
    pub transaction: Transaction,
    pub serial: u64,
}

impl SerialTransaction {
    #[must_use]
    pub fn new(transaction: Transaction, serial: u64) -> Self {
        Self {
            transaction,
            serial,
        }
    }

    /// The wrapped transaction's id.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.transaction.id
    }
}
