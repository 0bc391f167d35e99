use pretty_assertions::assert_eq;
use proptest::prelude::*;
use serde_json::{Value, json};
use std::sync::Arc;
use tessel_fields::{FieldError, FieldResult, ObservableList, UndoConfig, UndoableList};
use tessel_store::{Datastore, Schema};
use tessel_types::{FieldId, FieldPatch, FieldUpdate, RecordId, SchemaId, StoreId, Transaction};

fn make_store() -> Arc<Datastore> {
    Arc::new(Datastore::new(StoreId::new(1), [Schema::new("cells").list("order")]))
}

fn undoable(store: &Arc<Datastore>, config: UndoConfig) -> UndoableList {
    let list = ObservableList::new(store, "cells", "root", "order").unwrap();
    UndoableList::with_config(list, config).unwrap()
}

fn items(list: &UndoableList) -> Vec<Value> {
    list.to_vec().unwrap()
}

// ── Single steps ─────────────────────────────────────────────────

#[test]
fn fresh_history_has_nothing_to_undo() {
    let store = make_store();
    let list = undoable(&store, UndoConfig::default());
    assert!(!list.can_undo());
    assert!(!list.can_redo());
    list.undo().unwrap();
    list.redo().unwrap();
}

#[test]
fn undo_and_redo_each_kind_of_change() {
    let store = make_store();
    let list = undoable(&store, UndoConfig::default());
    list.push_all(vec![json!("a"), json!("b"), json!("c")]).unwrap();
    list.set(1, json!("B")).unwrap();
    list.move_item(0, 2).unwrap();
    list.remove(0).unwrap();
    let end = items(&list);
    assert_eq!(end, vec![json!("c"), json!("a")]);

    list.undo().unwrap();
    assert_eq!(items(&list), vec![json!("B"), json!("c"), json!("a")]);
    list.undo().unwrap();
    assert_eq!(items(&list), vec![json!("a"), json!("B"), json!("c")]);
    list.undo().unwrap();
    assert_eq!(items(&list), vec![json!("a"), json!("b"), json!("c")]);
    list.undo().unwrap();
    assert!(items(&list).is_empty());
    assert!(!list.can_undo());

    for _ in 0..4 {
        list.redo().unwrap();
    }
    assert_eq!(items(&list), end);
    assert!(!list.can_redo());
}

#[test]
fn undo_commits_one_transaction() {
    let store = make_store();
    let list = undoable(&store, UndoConfig::default());
    list.begin_compound_operation(true);
    list.push(json!(1)).unwrap();
    list.push(json!(2)).unwrap();
    list.end_compound_operation();

    let count = Arc::new(std::sync::Mutex::new(0));
    let c = count.clone();
    let _sub = store.on_transaction(move |_| *c.lock().unwrap() += 1);
    list.undo().unwrap();
    assert_eq!(*count.lock().unwrap(), 1);
}

#[test]
fn new_change_after_undo_drops_redo() {
    let store = make_store();
    let list = undoable(&store, UndoConfig::default());
    list.push(json!(1)).unwrap();
    list.push(json!(2)).unwrap();
    list.undo().unwrap();
    assert!(list.can_redo());
    list.push(json!(3)).unwrap();
    assert!(!list.can_redo());
    list.undo().unwrap();
    list.undo().unwrap();
    assert!(items(&list).is_empty());
}

#[test]
fn replay_is_not_recorded() {
    let store = make_store();
    let list = undoable(&store, UndoConfig::default());
    list.push(json!(1)).unwrap();
    list.undo().unwrap();
    list.redo().unwrap();
    list.undo().unwrap();
    assert!(!list.can_undo());
    assert!(list.can_redo());
}

// ── Compound operations ──────────────────────────────────────────

#[test]
fn compound_operation_undoes_as_one_step() {
    let store = make_store();
    let list = undoable(&store, UndoConfig::default());
    list.push(json!("keep")).unwrap();

    list.begin_compound_operation(true);
    list.push(json!("a")).unwrap();
    list.insert(0, json!("b")).unwrap();
    list.set(2, json!("A")).unwrap();
    assert!(list.can_undo());
    list.end_compound_operation();

    list.undo().unwrap();
    assert_eq!(items(&list), vec![json!("keep")]);
    list.redo().unwrap();
    assert_eq!(items(&list), vec![json!("b"), json!("keep"), json!("A")]);
}

#[test]
fn empty_compound_operation_adds_no_step() {
    let store = make_store();
    let list = undoable(&store, UndoConfig::default());
    list.push(json!(1)).unwrap();
    list.begin_compound_operation(true);
    list.end_compound_operation();
    list.undo().unwrap();
    assert!(!list.can_undo());
}

#[test]
fn non_undoable_compound_is_not_recorded() {
    let store = make_store();
    let list = undoable(&store, UndoConfig::default());
    list.push(json!(1)).unwrap();
    list.begin_compound_operation(false);
    list.push(json!(2)).unwrap();
    list.end_compound_operation();
    list.push(json!(3)).unwrap();

    list.undo().unwrap();
    list.undo().unwrap();
    assert_eq!(items(&list), vec![json!(2)]);
}

// ── State ────────────────────────────────────────────────────────

#[test]
fn clear_undo_keeps_the_data() {
    let store = make_store();
    let list = undoable(&store, UndoConfig::default());
    list.push(json!(1)).unwrap();
    list.clear_undo();
    assert!(!list.can_undo());
    assert_eq!(items(&list), vec![json!(1)]);
}

#[test]
fn undo_rejects_an_open_transaction() {
    let store = make_store();
    let list = undoable(&store, UndoConfig::default());
    list.push(json!(1)).unwrap();
    store.begin_transaction();
    assert!(matches!(list.undo(), Err(FieldError::TransactionOpen)));
    assert!(matches!(list.redo(), Err(FieldError::TransactionOpen)));
    store.end_transaction().unwrap();
    list.undo().unwrap();
}

#[test]
fn remote_changes_are_not_undone() {
    let store = make_store();
    let list = undoable(&store, UndoConfig::default());
    list.push(json!("mine")).unwrap();
    store
        .apply_transaction(&Transaction::new(
            StoreId::new(2),
            vec![FieldPatch {
                schema: SchemaId::new("cells"),
                record: RecordId::new("root"),
                field: FieldId::new("order"),
                update: FieldUpdate::list(1, vec![], vec![json!("theirs")]),
            }],
        ))
        .unwrap();
    list.undo().unwrap();
    assert_eq!(items(&list), vec![json!("theirs")]);
    assert!(!list.can_undo());
}

#[test]
fn undo_invalidated_by_a_remote_edit_writes_nothing() {
    let store = make_store();
    let list = undoable(&store, UndoConfig::default());
    list.begin_compound_operation(true);
    list.push_all(vec![json!("x"), json!("y"), json!("z")]).unwrap();
    list.insert(0, json!("w")).unwrap();
    list.end_compound_operation();

    // The remote side drops the tail, so only the later insert can still be
    // reverted.
    store
        .apply_transaction(&Transaction::new(
            StoreId::new(2),
            vec![FieldPatch {
                schema: SchemaId::new("cells"),
                record: RecordId::new("root"),
                field: FieldId::new("order"),
                update: FieldUpdate::list(2, vec![json!("y"), json!("z")], vec![]),
            }],
        ))
        .unwrap();
    let before = store.version();

    assert!(matches!(list.undo(), Err(FieldError::IndexOutOfRange { .. })));
    assert_eq!(items(&list), vec![json!("w"), json!("x")]);
    assert_eq!(store.version(), before);
    assert!(list.can_undo());
    assert!(!list.can_redo());
}

#[test]
fn stable_point_trims_history_when_configured() {
    let store = make_store();
    let trimmed = undoable(&store, UndoConfig { trim_on_stable: true });
    trimmed.push(json!(1)).unwrap();

    let other = make_store();
    let kept = undoable(&other, UndoConfig::default());
    kept.push(json!(1)).unwrap();

    store.mark_stable(1);
    other.mark_stable(1);
    assert!(!trimmed.can_undo());
    assert!(kept.can_undo());
}

// ── Properties ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Op {
    Push(i64),
    Insert(usize, i64),
    Set(usize, i64),
    Remove(usize),
    Move(usize, usize),
    Clear,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => any::<i64>().prop_map(Op::Push),
        2 => (any::<usize>(), any::<i64>()).prop_map(|(i, v)| Op::Insert(i, v)),
        2 => (any::<usize>(), any::<i64>()).prop_map(|(i, v)| Op::Set(i, v)),
        2 => any::<usize>().prop_map(Op::Remove),
        2 => (any::<usize>(), any::<usize>()).prop_map(|(a, b)| Op::Move(a, b)),
        1 => Just(Op::Clear),
    ]
}

/// Applies `op` with indices wrapped into range.
fn apply(list: &UndoableList, op: &Op) -> FieldResult<()> {
    let len = list.len()?;
    match *op {
        Op::Push(v) => list.push(json!(v)),
        Op::Insert(i, v) => list.insert(i % (len + 1), json!(v)),
        Op::Set(i, v) if len > 0 => list.set(i % len, json!(v)).map(drop),
        Op::Remove(i) if len > 0 => list.remove(i % len).map(drop),
        Op::Move(a, b) if len > 0 => list.move_item(a % len, b % len),
        Op::Clear => list.clear(),
        _ => Ok(()),
    }
}

proptest! {
    #[test]
    fn undo_then_redo_restores_every_state(ops in prop::collection::vec(op(), 1..24)) {
        let store = make_store();
        let list = undoable(&store, UndoConfig::default());
        let mut states = vec![items(&list)];
        for op in &ops {
            apply(&list, op).unwrap();
            let now = items(&list);
            if states.last() != Some(&now) {
                states.push(now);
            }
        }

        for expected in states.iter().rev().skip(1) {
            prop_assert!(list.can_undo());
            list.undo().unwrap();
            prop_assert_eq!(&items(&list), expected);
        }
        prop_assert!(!list.can_undo());

        for expected in states.iter().skip(1) {
            list.redo().unwrap();
            prop_assert_eq!(&items(&list), expected);
        }
        prop_assert!(!list.can_redo());
    }
}
