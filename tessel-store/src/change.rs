//! Raw change records emitted by the store.
//!
//! A [`StoreChange`] is published once per committed transaction (local or
//! remote) and groups the affected fields as `{schema: {record: {field:
//! change}}}`. Each [`FieldChange`] carries the engine's raw previous/current
//! shape; the observable adapters translate it into typed events.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tessel_types::{FieldId, ListSplice, RecordId, SchemaId, StoreId, TextSplice, TransactionId};

/// Where a change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOrigin {
    /// A transaction committed by this replica.
    Local,
    /// A transaction (or checkpoint) received from the server.
    Remote,
}

/// The raw change to one field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldChange {
    /// Splices in application order.
    Text(Vec<TextSplice>),
    /// Splices in application order.
    List(Vec<ListSplice>),
    /// Previous and current values of every touched key; `null` when absent.
    Map {
        previous: BTreeMap<String, Value>,
        current: BTreeMap<String, Value>,
    },
    /// Register value before and after the transaction.
    Register { previous: Value, current: Value },
}

impl FieldChange {
    /// Folds a later change to the same field into this one.
    ///
    /// Splices append; maps keep each key's first previous value and latest
    /// current value; registers keep the first previous value.
    pub fn merge(&mut self, later: FieldChange) {
        match (self, later) {
            (Self::Text(splices), Self::Text(more)) => splices.extend(more),
            (Self::List(splices), Self::List(more)) => splices.extend(more),
            (
                Self::Map { previous, current },
                Self::Map {
                    previous: later_previous,
                    current: later_current,
                },
            ) => {
                for (key, value) in later_previous {
                    previous.entry(key).or_insert(value);
                }
                current.extend(later_current);
            }
            (Self::Register { current, .. }, Self::Register { current: next, .. }) => {
                *current = next;
            }
            (this, later) => *this = later,
        }
    }
}

/// Changes grouped by schema, record and field.
pub type ChangeSet = BTreeMap<SchemaId, BTreeMap<RecordId, BTreeMap<FieldId, FieldChange>>>;

/// Everything one committed transaction changed.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreChange {
    pub origin: ChangeOrigin,
    pub transaction_id: TransactionId,
    /// The replica that originated the transaction.
    pub store_id: StoreId,
    pub fields: ChangeSet,
}

impl StoreChange {
    /// Looks up the change for one field, if it was touched.
    #[must_use]
    pub fn field(
        &self,
        schema: &SchemaId,
        record: &RecordId,
        field: &FieldId,
    ) -> Option<&FieldChange> {
        self.fields.get(schema)?.get(record)?.get(field)
    }

    /// Whether the change touches nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Records `change` for the triple, merging with any earlier change.
pub(crate) fn record_change(
    set: &mut ChangeSet,
    schema: &SchemaId,
    record: &RecordId,
    field: &FieldId,
    change: FieldChange,
) {
    let fields = set
        .entry(schema.clone())
        .or_default()
        .entry(record.clone())
        .or_default();
    match fields.get_mut(field) {
        Some(existing) => existing.merge(change),
        None => {
            fields.insert(field.clone(), change);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn map_merge_keeps_first_previous() {
        let mut first = FieldChange::Map {
            previous: [("a".to_string(), json!(1))].into(),
            current: [("a".to_string(), json!(2))].into(),
        };
        first.merge(FieldChange::Map {
            previous: [("a".to_string(), json!(2)), ("b".to_string(), Value::Null)].into(),
            current: [("a".to_string(), json!(3)), ("b".to_string(), json!(true))].into(),
        });
        let FieldChange::Map { previous, current } = first else {
            panic!("expected map change");
        };
        assert_eq!(previous["a"], json!(1));
        assert_eq!(previous["b"], Value::Null);
        assert_eq!(current["a"], json!(3));
    }

    #[test]
    fn register_merge_keeps_first_previous() {
        let mut first = FieldChange::Register { previous: json!(1), current: json!(2) };
        first.merge(FieldChange::Register { previous: json!(2), current: json!(3) });
        assert_eq!(first, FieldChange::Register { previous: json!(1), current: json!(3) });
    }
}
