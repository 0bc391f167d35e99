//! Linear undo history over an [`ObservableList`].
//!
//! Every locally originated [`ListChange`] is recorded as a step. Inside a
//! compound operation, changes accumulate into one step that is committed
//! when the operation ends. Undo replays a step's inverse changes in reverse
//! order; redo replays the step forward. Both run in a single store
//! transaction with recording suppressed, so the replay itself never lands
//! in the history.
//!
//! Remote changes are not recorded. Undoing after a remote edit moved the
//! recorded indices can fail with [`FieldError::IndexOutOfRange`]. A step is
//! checked against the current list before anything is written, so a failed
//! undo or redo leaves both the list and the history position as they were.

use crate::error::{FieldError, FieldResult};
use crate::list::{ListChange, ListChangeKind, ObservableList};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::ops::Deref;
use std::sync::{Arc, Mutex};
use tessel_store::{ChangeOrigin, Datastore, Subscription};
use tracing::debug;

/// Undo history options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UndoConfig {
    /// Clear the history whenever the store reaches a stable point.
    pub trim_on_stable: bool,
}

#[derive(Debug)]
struct UndoState {
    steps: Vec<Vec<ListChange>>,
    /// Last applied step; `-1` when nothing can be undone.
    index: isize,
    in_compound: bool,
    compound_undoable: bool,
    compound_changed: bool,
    replaying: bool,
}

impl UndoState {
    fn new() -> Self {
        Self {
            steps: Vec::new(),
            index: -1,
            in_compound: false,
            compound_undoable: true,
            compound_changed: false,
            replaying: false,
        }
    }

    fn record(&mut self, change: &ListChange) {
        if self.replaying || !self.compound_undoable || change.origin != ChangeOrigin::Local {
            return;
        }
        let next = (self.index + 1) as usize;
        if !self.in_compound || !self.compound_changed {
            self.steps.truncate(next);
        }
        match self.steps.get_mut(next) {
            Some(step) => step.push(change.clone()),
            None => self.steps.push(vec![change.clone()]),
        }
        if self.in_compound {
            self.compound_changed = true;
        } else {
            self.index += 1;
        }
    }

    fn clear(&mut self) {
        self.steps.clear();
        self.index = -1;
        self.compound_changed = false;
    }
}

/// One list write a replayed change is turned into.
#[derive(Debug)]
enum Edit {
    Splice {
        index: usize,
        count: usize,
        inserted: Vec<Value>,
    },
    Move {
        from: usize,
        to: usize,
    },
}

impl Edit {
    fn splice(index: usize, count: usize, inserted: Vec<Value>) -> Self {
        Self::Splice {
            index,
            count,
            inserted,
        }
    }

    fn revert(change: &ListChange) -> Self {
        match change.kind {
            ListChangeKind::Add => Self::splice(change.new_index, change.new_values.len(), Vec::new()),
            ListChangeKind::Remove => Self::splice(change.old_index, 0, change.old_values.clone()),
            ListChangeKind::Set => Self::splice(
                change.old_index,
                change.new_values.len(),
                change.old_values.clone(),
            ),
            ListChangeKind::Move => Self::Move {
                from: change.new_index,
                to: change.old_index,
            },
        }
    }

    fn reapply(change: &ListChange) -> Self {
        match change.kind {
            ListChangeKind::Add => Self::splice(change.new_index, 0, change.new_values.clone()),
            ListChangeKind::Remove => Self::splice(change.old_index, change.old_values.len(), Vec::new()),
            ListChangeKind::Set => Self::splice(
                change.old_index,
                change.old_values.len(),
                change.new_values.clone(),
            ),
            ListChangeKind::Move => Self::Move {
                from: change.old_index,
                to: change.new_index,
            },
        }
    }

    /// Applies the edit to a copy of the list, failing wherever the real
    /// write would.
    fn check(&self, items: &mut Vec<Value>) -> FieldResult<()> {
        let len = items.len();
        match self {
            Self::Splice {
                index,
                count,
                inserted,
            } => {
                if *index > len {
                    return Err(FieldError::IndexOutOfRange { index: *index, len });
                }
                let end = index.saturating_add(*count);
                if end > len {
                    return Err(FieldError::IndexOutOfRange { index: end, len });
                }
                items.splice(*index..end, inserted.iter().cloned());
            }
            Self::Move { from, to } => {
                for index in [*from, *to] {
                    if index >= len {
                        return Err(FieldError::IndexOutOfRange { index, len });
                    }
                }
                let value = items.remove(*from);
                items.insert(*to, value);
            }
        }
        Ok(())
    }

    fn write(self, list: &ObservableList) -> FieldResult<()> {
        match self {
            Self::Splice {
                index,
                count,
                inserted,
            } => list.splice(index, count, inserted).map(drop),
            Self::Move { from, to } => list.move_item(from, to),
        }
    }
}

/// An [`ObservableList`] with undo and redo.
///
/// Dereferences to the wrapped list, so mutations go through the usual list
/// operations and are recorded as they commit.
pub struct UndoableList {
    list: ObservableList,
    state: Arc<Mutex<UndoState>>,
    _recorder: Subscription,
    _stable: Option<Subscription>,
}

impl UndoableList {
    /// Wraps `list` with default options.
    pub fn new(list: ObservableList) -> FieldResult<Self> {
        Self::with_config(list, UndoConfig::default())
    }

    pub fn with_config(list: ObservableList, config: UndoConfig) -> FieldResult<Self> {
        let state = Arc::new(Mutex::new(UndoState::new()));
        let recorder = {
            let state = Arc::clone(&state);
            list.changed()
                .connect(move |change| state.lock().unwrap().record(change))
        };
        let stable = if config.trim_on_stable {
            let state = Arc::clone(&state);
            Some(list.store()?.on_stable(move |serial| {
                debug!(serial, "trimming undo history at stable point");
                state.lock().unwrap().clear();
            }))
        } else {
            None
        };
        Ok(Self {
            list,
            state,
            _recorder: recorder,
            _stable: stable,
        })
    }

    /// The wrapped list.
    pub fn list(&self) -> &ObservableList {
        &self.list
    }

    pub fn can_undo(&self) -> bool {
        self.state.lock().unwrap().index >= 0
    }

    pub fn can_redo(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.index + 1 < state.steps.len() as isize
    }

    /// Starts grouping changes into one step.
    ///
    /// With `is_undoable` false, changes made until the operation ends are
    /// not recorded at all.
    pub fn begin_compound_operation(&self, is_undoable: bool) {
        let mut state = self.state.lock().unwrap();
        state.in_compound = true;
        state.compound_undoable = is_undoable;
        state.compound_changed = false;
    }

    /// Commits the grouped changes as one step, if any were recorded.
    pub fn end_compound_operation(&self) {
        let mut state = self.state.lock().unwrap();
        state.in_compound = false;
        state.compound_undoable = true;
        if state.compound_changed {
            state.index += 1;
            state.compound_changed = false;
        }
    }

    /// Reverts the last applied step.
    pub fn undo(&self) -> FieldResult<()> {
        let store = self.replay_store()?;
        let step = {
            let state = self.state.lock().unwrap();
            if state.index < 0 {
                return Ok(());
            }
            state.steps[state.index as usize].clone()
        };
        self.replay(&store, step.iter().rev().map(Edit::revert).collect())?;
        self.state.lock().unwrap().index -= 1;
        Ok(())
    }

    /// Re-applies the next undone step.
    pub fn redo(&self) -> FieldResult<()> {
        let store = self.replay_store()?;
        let step = {
            let state = self.state.lock().unwrap();
            let next = (state.index + 1) as usize;
            match state.steps.get(next) {
                Some(step) => step.clone(),
                None => return Ok(()),
            }
        };
        self.replay(&store, step.iter().map(Edit::reapply).collect())?;
        self.state.lock().unwrap().index += 1;
        Ok(())
    }

    /// Forgets the history. The list is left as it is.
    pub fn clear_undo(&self) {
        self.state.lock().unwrap().clear();
    }

    fn replay_store(&self) -> FieldResult<Arc<Datastore>> {
        let store = self.list.store()?;
        if store.in_transaction() {
            return Err(FieldError::TransactionOpen);
        }
        Ok(store)
    }

    /// Writes `edits` in one store transaction with recording suppressed.
    ///
    /// The whole step is checked against the list inside the scope, where
    /// remote transactions are held back, so either every edit is written
    /// or none is. Changes commit when the scope closes, so suppression
    /// lasts until after the transaction ends.
    fn replay(&self, store: &Datastore, edits: Vec<Edit>) -> FieldResult<()> {
        self.state.lock().unwrap().replaying = true;
        store.begin_transaction();
        let applied = self.list.to_vec().and_then(|mut items| {
            edits.iter().try_for_each(|edit| edit.check(&mut items))?;
            edits.into_iter().try_for_each(|edit| edit.write(&self.list))
        });
        let ended = store.end_transaction();
        self.state.lock().unwrap().replaying = false;
        applied?;
        ended?;
        Ok(())
    }
}

impl Deref for UndoableList {
    type Target = ObservableList;

    fn deref(&self) -> &ObservableList {
        &self.list
    }
}

impl std::fmt::Debug for UndoableList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("UndoableList")
            .field("list", &self.list)
            .field("steps", &state.steps.len())
            .field("index", &state.index)
            .finish()
    }
}
