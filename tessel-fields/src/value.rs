//! A single JSON value stored in a register field.

use crate::binding::FieldBinding;
use crate::error::{FieldError, FieldResult};
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tessel_store::{ChangeOrigin, Datastore, FieldChange, FieldKind, Signal, Subscription};
use tessel_types::{FieldId, FieldUpdate, RecordId, SchemaId};

/// Emitted when the value changes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValueChange {
    /// `null` when the value was absent.
    pub old_value: Value,
    /// `null` when the value was cleared.
    pub new_value: Value,
    pub origin: ChangeOrigin,
}

/// An observable view of a register field.
pub struct ObservableValue {
    binding: FieldBinding,
    changed: Arc<Signal<ValueChange>>,
    listener: Mutex<Option<Subscription>>,
}

impl ObservableValue {
    /// Binds to a register field.
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
            FieldKind::Register,
        )?;
        let changed = Arc::new(Signal::new());
        let signal = Arc::clone(&changed);
        let listener = binding.listen(move |raw, origin| {
            if let FieldChange::Register { previous, current } = raw {
                if previous != current {
                    signal.emit(&ValueChange {
                        old_value: previous.clone(),
                        new_value: current.clone(),
                        origin,
                    });
                }
            }
        })?;
        Ok(Self {
            binding,
            changed,
            listener: Mutex::new(Some(listener)),
        })
    }

    /// The current value; `null` when absent.
    pub fn get(&self) -> FieldResult<Value> {
        Ok(self
            .binding
            .read()?
            .as_register()
            .cloned()
            .unwrap_or(Value::Null))
    }

    /// Replaces the value. Writing an equal value does nothing.
    pub fn set(&self, value: Value) -> FieldResult<()> {
        if value.is_null() {
            return Err(FieldError::AbsentValue);
        }
        if self.get()? == value {
            return Ok(());
        }
        self.binding.write(vec![FieldUpdate::register(value)])
    }

    /// Removes the value.
    pub fn clear(&self) -> FieldResult<()> {
        if self.get()?.is_null() {
            return Ok(());
        }
        self.binding.write(vec![FieldUpdate::register(Value::Null)])
    }

    /// Change notifications.
    pub fn changed(&self) -> &Signal<ValueChange> {
        &self.changed
    }

    /// Detaches from the store. Further store changes are not reported.
    pub fn dispose(&self) {
        self.listener.lock().unwrap().take();
    }

    pub fn is_disposed(&self) -> bool {
        self.listener.lock().unwrap().is_none()
    }

    pub fn field(&self) -> &FieldId {
        self.binding.field()
    }
}

impl std::fmt::Debug for ObservableValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservableValue")
            .field("schema", self.binding.schema())
            .field("record", self.binding.record())
            .field("field", self.binding.field())
            .finish_non_exhaustive()
    }
}
