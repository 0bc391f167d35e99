//! String-keyed maps of JSON values.

use crate::binding::FieldBinding;
use crate::error::{FieldError, FieldResult};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use tessel_store::{ChangeOrigin, Datastore, FieldChange, FieldKind, Signal, Subscription};
use tessel_types::{FieldId, FieldUpdate, RecordId, SchemaId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MapChangeKind {
    Add,
    Remove,
    Change,
}

/// Emitted once per key whose value changed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MapChange {
    pub kind: MapChangeKind,
    pub key: String,
    /// `None` for [`MapChangeKind::Add`].
    pub old_value: Option<Value>,
    /// `None` for [`MapChangeKind::Remove`].
    pub new_value: Option<Value>,
    pub origin: ChangeOrigin,
}

/// Classifies raw previous/current entries into per-key events.
/// `null` on either side means the key was absent.
fn map_changes(
    previous: &BTreeMap<String, Value>,
    current: &BTreeMap<String, Value>,
    origin: ChangeOrigin,
) -> Vec<MapChange> {
    let present = |m: &BTreeMap<String, Value>, key: &str| m.get(key).filter(|v| !v.is_null()).cloned();
    let keys: BTreeSet<&String> = previous.keys().chain(current.keys()).collect();
    keys.into_iter()
        .filter_map(|key| {
            let old_value = present(previous, key.as_str());
            let new_value = present(current, key.as_str());
            let kind = match (&old_value, &new_value) {
                (None, Some(_)) => MapChangeKind::Add,
                (Some(_), None) => MapChangeKind::Remove,
                (Some(a), Some(b)) if a != b => MapChangeKind::Change,
                _ => return None,
            };
            Some(MapChange {
                kind,
                key: key.clone(),
                old_value,
                new_value,
                origin,
            })
        })
        .collect()
}

/// An observable view of a map field.
pub struct ObservableMap {
    binding: FieldBinding,
    changed: Arc<Signal<MapChange>>,
    listener: Mutex<Option<Subscription>>,
}

impl ObservableMap {
    /// Binds to a map field.
    pub fn new(
        store: &Arc<Datastore>,
        schema: impl Into<SchemaId>,
        record: impl Into<RecordId>,
        field: impl Into<FieldId>,
    ) -> FieldResult<Self> {
        let binding = FieldBinding::new(
            store,
            schema.into(),
            record.into(),
            field.into(),
            FieldKind::Map,
        )?;
        let changed = Arc::new(Signal::new());
        let signal = Arc::clone(&changed);
        let listener = binding.listen(move |raw, origin| {
            if let FieldChange::Map { previous, current } = raw {
                for change in map_changes(previous, current, origin) {
                    signal.emit(&change);
                }
            }
        })?;
        Ok(Self {
            binding,
            changed,
            listener: Mutex::new(Some(listener)),
        })
    }

    /// A copy of every entry.
    pub fn to_map(&self) -> FieldResult<BTreeMap<String, Value>> {
        Ok(self.binding.read()?.as_map().cloned().unwrap_or_default())
    }

    pub fn get(&self, key: &str) -> FieldResult<Option<Value>> {
        Ok(self.to_map()?.remove(key))
    }

    pub fn has(&self, key: &str) -> FieldResult<bool> {
        Ok(self.to_map()?.contains_key(key))
    }

    /// Keys in sorted order.
    pub fn keys(&self) -> FieldResult<Vec<String>> {
        Ok(self.to_map()?.into_keys().collect())
    }

    /// Values in key order.
    pub fn values(&self) -> FieldResult<Vec<Value>> {
        Ok(self.to_map()?.into_values().collect())
    }

    pub fn len(&self) -> FieldResult<usize> {
        Ok(self.to_map()?.len())
    }

    pub fn is_empty(&self) -> FieldResult<bool> {
        Ok(self.to_map()?.is_empty())
    }

    /// Sets `key`, returning the previous value. Setting an equal value
    /// does nothing.
    pub fn set(&self, key: &str, value: Value) -> FieldResult<Option<Value>> {
        if value.is_null() {
            return Err(FieldError::AbsentValue);
        }
        let old = self.get(key)?;
        if old.as_ref() == Some(&value) {
            return Ok(old);
        }
        self.binding.write(vec![FieldUpdate::Map {
            entries: [(key.to_owned(), value)].into(),
        }])?;
        Ok(old)
    }

    /// Removes `key`, returning its value.
    pub fn delete(&self, key: &str) -> FieldResult<Option<Value>> {
        let Some(old) = self.get(key)? else {
            return Ok(None);
        };
        self.binding.write(vec![FieldUpdate::Map {
            entries: [(key.to_owned(), Value::Null)].into(),
        }])?;
        Ok(Some(old))
    }

    /// Removes every key in one transaction.
    pub fn clear(&self) -> FieldResult<()> {
        let entries: BTreeMap<String, Value> = self
            .keys()?
            .into_iter()
            .map(|key| (key, Value::Null))
            .collect();
        if entries.is_empty() {
            return Ok(());
        }
        self.binding.write(vec![FieldUpdate::Map { entries }])
    }

    /// Change notifications.
    pub fn changed(&self) -> &Signal<MapChange> {
        &self.changed
    }

    /// Detaches from the store.
    pub fn dispose(&self) {
        self.listener.lock().unwrap().take();
    }

    pub fn is_disposed(&self) -> bool {
        self.listener.lock().unwrap().is_none()
    }
}

impl std::fmt::Debug for ObservableMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservableMap")
            .field("schema", self.binding.schema())
            .field("record", self.binding.record())
            .field("field", self.binding.field())
            .finish_non_exhaustive()
    }
}
