//! The `(schema, record, field)` binding shared by every adapter.

use crate::error::{FieldError, FieldResult};
use std::sync::{Arc, Weak};
use tessel_store::{
    ChangeOrigin, Datastore, FieldChange, FieldKind, FieldValue, StoreError, Subscription,
};
use tessel_types::{FieldId, FieldUpdate, RecordId, SchemaId};

/// A non-owning reference to one field of one record.
#[derive(Debug, Clone)]
pub(crate) struct FieldBinding {
    store: Weak<Datastore>,
    schema: SchemaId,
    record: RecordId,
    field: FieldId,
}

impl FieldBinding {
    /// Binds to a field, checking that it is declared with `kind`.
    pub(crate) fn new(
        store: &Arc<Datastore>,
        schema: SchemaId,
        record: RecordId,
        field: FieldId,
        kind: FieldKind,
    ) -> FieldResult<Self> {
        let actual = store.schema(&schema)?.kind_of(&field)?;
        if actual != kind {
            return Err(StoreError::KindMismatch {
                field,
                expected: kind.name(),
                actual: actual.name(),
            }
            .into());
        }
        Ok(Self {
            store: Arc::downgrade(store),
            schema,
            record,
            field,
        })
    }

    pub(crate) fn store(&self) -> FieldResult<Arc<Datastore>> {
        self.store.upgrade().ok_or(FieldError::StoreDropped)
    }

    pub(crate) fn schema(&self) -> &SchemaId {
        &self.schema
    }

    pub(crate) fn record(&self) -> &RecordId {
        &self.record
    }

    pub(crate) fn field(&self) -> &FieldId {
        &self.field
    }

    pub(crate) fn read(&self) -> FieldResult<FieldValue> {
        Ok(self
            .store()?
            .get_field(&self.schema, &self.record, &self.field)?)
    }

    /// Writes updates in order inside one transaction scope.
    pub(crate) fn write(&self, updates: Vec<FieldUpdate>) -> FieldResult<()> {
        let store = self.store()?;
        store.transact(|| {
            for update in updates {
                store.update_field(&self.schema, &self.record, &self.field, update)?;
            }
            Ok(())
        })?;
        Ok(())
    }

    /// Calls `listener` with this field's raw change whenever a committed
    /// change touches it.
    pub(crate) fn listen<F>(&self, listener: F) -> FieldResult<Subscription>
    where
        F: Fn(&FieldChange, ChangeOrigin) + Send + Sync + 'static,
    {
        let (schema, record, field) = (self.schema.clone(), self.record.clone(), self.field.clone());
        Ok(self.store()?.on_change(move |change| {
            if let Some(raw) = change.field(&schema, &record, &field) {
                listener(raw, change.origin);
            }
        }))
    }
}
