//! Text fields edited by character splices.

use crate::binding::FieldBinding;
use crate::error::{FieldError, FieldResult};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tessel_store::{ChangeOrigin, Datastore, FieldChange, FieldKind, Signal, Subscription};
use tessel_types::{FieldId, FieldUpdate, RecordId, SchemaId};

/// One edit to the text. Indices count characters, not bytes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StringChange {
    Insert {
        index: usize,
        text: String,
        origin: ChangeOrigin,
    },
    Remove {
        index: usize,
        text: String,
        origin: ChangeOrigin,
    },
}

impl StringChange {
    pub fn origin(&self) -> ChangeOrigin {
        match self {
            Self::Insert { origin, .. } | Self::Remove { origin, .. } => *origin,
        }
    }
}

/// An observable view of a text field.
pub struct ObservableString {
    binding: FieldBinding,
    changed: Arc<Signal<StringChange>>,
    listener: Mutex<Option<Subscription>>,
}

impl ObservableString {
    /// Binds to a text field.
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
            FieldKind::Text,
        )?;
        let changed = Arc::new(Signal::new());
        let signal = Arc::clone(&changed);
        let listener = binding.listen(move |raw, origin| {
            let FieldChange::Text(splices) = raw else {
                return;
            };
            // Each splice reports its removal first, then its insertion.
            for splice in splices {
                if !splice.removed.is_empty() {
                    signal.emit(&StringChange::Remove {
                        index: splice.index,
                        text: splice.removed.clone(),
                        origin,
                    });
                }
                if !splice.inserted.is_empty() {
                    signal.emit(&StringChange::Insert {
                        index: splice.index,
                        text: splice.inserted.clone(),
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

    /// The current text.
    pub fn text(&self) -> FieldResult<String> {
        Ok(self
            .binding
            .read()?
            .as_text()
            .map(str::to_owned)
            .unwrap_or_default())
    }

    /// Length in characters.
    pub fn len(&self) -> FieldResult<usize> {
        Ok(self.text()?.chars().count())
    }

    pub fn is_empty(&self) -> FieldResult<bool> {
        Ok(self.text()?.is_empty())
    }

    /// Inserts `text` before character `index`.
    pub fn insert(&self, index: usize, text: &str) -> FieldResult<()> {
        let len = self.len()?;
        if index > len {
            return Err(FieldError::IndexOutOfRange { index, len });
        }
        if text.is_empty() {
            return Ok(());
        }
        self.binding.write(vec![FieldUpdate::text(index, "", text)])
    }

    /// Removes the characters in `start..end`.
    pub fn remove(&self, start: usize, end: usize) -> FieldResult<()> {
        let current = self.text()?;
        let len = current.chars().count();
        if end > len {
            return Err(FieldError::IndexOutOfRange { index: end, len });
        }
        if start > end {
            return Err(FieldError::IndexOutOfRange { index: start, len: end });
        }
        if start == end {
            return Ok(());
        }
        let removed: String = current.chars().skip(start).take(end - start).collect();
        self.binding.write(vec![FieldUpdate::text(start, removed, "")])
    }

    /// Replaces the whole text. Setting equal text does nothing.
    pub fn set_text(&self, text: &str) -> FieldResult<()> {
        let current = self.text()?;
        if current == text {
            return Ok(());
        }
        self.binding.write(vec![FieldUpdate::text(0, current, text)])
    }

    /// Removes all text.
    pub fn clear(&self) -> FieldResult<()> {
        self.set_text("")
    }

    /// Change notifications.
    pub fn changed(&self) -> &Signal<StringChange> {
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

impl std::fmt::Debug for ObservableString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservableString")
            .field("schema", self.binding.schema())
            .field("record", self.binding.record())
            .field("field", self.binding.field())
            .finish_non_exhaustive()
    }
}
