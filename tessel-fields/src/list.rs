//! Ordered lists of JSON values.

use crate::binding::FieldBinding;
use crate::error::{FieldError, FieldResult};
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tessel_store::{ChangeOrigin, Datastore, FieldChange, FieldKind, Signal, Subscription};
use tessel_types::{FieldId, FieldUpdate, ListSplice, RecordId, SchemaId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ListChangeKind {
    Add,
    Remove,
    Set,
    Move,
}

/// One structural change to the list.
///
/// For `Add`, `Remove` and `Set` both indices are the splice position. For
/// `Move`, `old_index` is where the element was and `new_index` is where it
/// ended up.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListChange {
    pub kind: ListChangeKind,
    pub old_index: usize,
    pub new_index: usize,
    /// Elements removed or overwritten. Empty for `Add`.
    pub old_values: Vec<Value>,
    /// Elements inserted or written. Empty for `Remove`.
    pub new_values: Vec<Value>,
    pub origin: ChangeOrigin,
}

fn is_move(first: &ListSplice, second: &ListSplice) -> bool {
    first.removed.len() == 1
        && first.inserted.is_empty()
        && second.removed.is_empty()
        && second.inserted.len() == 1
        && first.removed[0] == second.inserted[0]
        && first.index != second.index
}

/// Normalizes raw splices into list events.
fn list_changes(splices: &[ListSplice], origin: ChangeOrigin) -> Vec<ListChange> {
    let mut changes = Vec::new();
    let mut rest = splices;
    while let [splice, tail @ ..] = rest {
        if let [next, after @ ..] = tail {
            if is_move(splice, next) {
                changes.push(ListChange {
                    kind: ListChangeKind::Move,
                    old_index: splice.index,
                    new_index: next.index,
                    old_values: splice.removed.clone(),
                    new_values: next.inserted.clone(),
                    origin,
                });
                rest = after;
                continue;
            }
        }
        let at = splice.index;
        if splice.removed.len() == 1 && splice.inserted.len() == 1 {
            changes.push(ListChange {
                kind: ListChangeKind::Set,
                old_index: at,
                new_index: at,
                old_values: splice.removed.clone(),
                new_values: splice.inserted.clone(),
                origin,
            });
        } else {
            if !splice.removed.is_empty() {
                changes.push(ListChange {
                    kind: ListChangeKind::Remove,
                    old_index: at,
                    new_index: at,
                    old_values: splice.removed.clone(),
                    new_values: Vec::new(),
                    origin,
                });
            }
            if !splice.inserted.is_empty() {
                changes.push(ListChange {
                    kind: ListChangeKind::Add,
                    old_index: at,
                    new_index: at,
                    old_values: Vec::new(),
                    new_values: splice.inserted.clone(),
                    origin,
                });
            }
        }
        rest = tail;
    }
    changes
}

/// An observable view of a list field.
pub struct ObservableList {
    binding: FieldBinding,
    changed: Arc<Signal<ListChange>>,
    listener: Mutex<Option<Subscription>>,
}

impl ObservableList {
    /// Binds to a list field.
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
            FieldKind::List,
        )?;
        let changed = Arc::new(Signal::new());
        let signal = Arc::clone(&changed);
        let listener = binding.listen(move |raw, origin| {
            if let FieldChange::List(splices) = raw {
                for change in list_changes(splices, origin) {
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

    pub(crate) fn store(&self) -> FieldResult<Arc<Datastore>> {
        self.binding.store()
    }

    /// A copy of the elements.
    pub fn to_vec(&self) -> FieldResult<Vec<Value>> {
        Ok(self
            .binding
            .read()?
            .as_list()
            .map(<[Value]>::to_vec)
            .unwrap_or_default())
    }

    pub fn len(&self) -> FieldResult<usize> {
        Ok(self.to_vec()?.len())
    }

    pub fn is_empty(&self) -> FieldResult<bool> {
        Ok(self.to_vec()?.is_empty())
    }

    pub fn get(&self, index: usize) -> FieldResult<Option<Value>> {
        Ok(self.to_vec()?.into_iter().nth(index))
    }

    pub fn push(&self, value: Value) -> FieldResult<()> {
        self.push_all(vec![value])
    }

    pub fn insert(&self, index: usize, value: Value) -> FieldResult<()> {
        self.insert_all(index, vec![value])
    }

    pub fn push_all(&self, values: Vec<Value>) -> FieldResult<()> {
        let len = self.len()?;
        self.insert_all(len, values)
    }

    /// Inserts `values` before `index` as one splice. `null` elements are
    /// rejected.
    pub fn insert_all(&self, index: usize, values: Vec<Value>) -> FieldResult<()> {
        if values.iter().any(Value::is_null) {
            return Err(FieldError::AbsentValue);
        }
        self.splice(index, 0, values).map(drop)
    }

    /// Overwrites the element at `index`, returning the old one. Writing an
    /// equal value does nothing.
    pub fn set(&self, index: usize, value: Value) -> FieldResult<Value> {
        if value.is_null() {
            return Err(FieldError::AbsentValue);
        }
        let items = self.to_vec()?;
        let Some(old) = items.get(index).cloned() else {
            return Err(FieldError::IndexOutOfRange {
                index,
                len: items.len(),
            });
        };
        if old == value {
            return Ok(old);
        }
        self.binding
            .write(vec![FieldUpdate::list(index, vec![old.clone()], vec![value])])?;
        Ok(old)
    }

    /// Removes and returns the element at `index`.
    pub fn remove(&self, index: usize) -> FieldResult<Value> {
        let len = self.len()?;
        if index >= len {
            return Err(FieldError::IndexOutOfRange { index, len });
        }
        let mut removed = self.splice(index, 1, Vec::new())?;
        removed.pop().ok_or(FieldError::IndexOutOfRange { index, len })
    }

    /// Removes the elements in `start..end`.
    pub fn remove_range(&self, start: usize, end: usize) -> FieldResult<Vec<Value>> {
        if start > end {
            return Err(FieldError::IndexOutOfRange {
                index: start,
                len: end,
            });
        }
        self.splice(start, end - start, Vec::new())
    }

    /// Moves the element at `from` so that it ends up at `to`.
    ///
    /// Written as a single-element removal followed by a re-insertion, and
    /// reported as one `Move`.
    pub fn move_item(&self, from: usize, to: usize) -> FieldResult<()> {
        let items = self.to_vec()?;
        let len = items.len();
        for index in [from, to] {
            if index >= len {
                return Err(FieldError::IndexOutOfRange { index, len });
            }
        }
        let value = items[from].clone();
        let mut moved = items.clone();
        moved.remove(from);
        moved.insert(to, value.clone());
        if moved == items {
            return Ok(());
        }
        self.binding.write(vec![FieldUpdate::List {
            splices: vec![
                ListSplice {
                    index: from,
                    removed: vec![value.clone()],
                    inserted: Vec::new(),
                },
                ListSplice {
                    index: to,
                    removed: Vec::new(),
                    inserted: vec![value],
                },
            ],
        }])
    }

    /// Removes every element.
    pub fn clear(&self) -> FieldResult<()> {
        let len = self.len()?;
        self.splice(0, len, Vec::new()).map(drop)
    }

    /// Replaces `count` elements at `index` with `inserted`, returning the
    /// removed elements. Empty splices write nothing.
    pub(crate) fn splice(
        &self,
        index: usize,
        count: usize,
        inserted: Vec<Value>,
    ) -> FieldResult<Vec<Value>> {
        let items = self.to_vec()?;
        let len = items.len();
        if index > len {
            return Err(FieldError::IndexOutOfRange { index, len });
        }
        let end = index + count;
        if end > len {
            return Err(FieldError::IndexOutOfRange { index: end, len });
        }
        let removed = items[index..end].to_vec();
        if removed.is_empty() && inserted.is_empty() {
            return Ok(removed);
        }
        self.binding
            .write(vec![FieldUpdate::list(index, removed.clone(), inserted)])?;
        Ok(removed)
    }

    /// Change notifications.
    pub fn changed(&self) -> &Signal<ListChange> {
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

impl std::fmt::Debug for ObservableList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservableList")
            .field("schema", self.binding.schema())
            .field("record", self.binding.record())
            .field("field", self.binding.field())
            .finish_non_exhaustive()
    }
}
