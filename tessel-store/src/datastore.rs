//! The in-memory datastore.

use crate::change::{ChangeOrigin, ChangeSet, StoreChange, record_change};
use crate::error::{StoreError, StoreResult};
use crate::schema::{FieldValue, Schema, expect_object};
use crate::signal::{Signal, Subscription};
use serde_json::{Map, Value};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use tessel_types::{
    FieldId, FieldPatch, FieldUpdate, RecordId, SchemaId, StoreId, Transaction, TransactionId,
};
use tracing::{debug, trace, warn};

/// Per-record field updates for one table, as passed to [`Table::update`].
pub type TableUpdate = BTreeMap<RecordId, BTreeMap<FieldId, FieldUpdate>>;

type Records = BTreeMap<RecordId, BTreeMap<FieldId, FieldValue>>;

/// What [`Datastore::apply_transaction`] did with a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The patch was applied and a change was emitted.
    Applied,
    /// The transaction id was already applied; nothing changed.
    Duplicate,
    /// A local transaction scope is open; the transaction will be applied
    /// when the outermost scope closes.
    Deferred,
}

/// A deferred remote transaction that could not be applied once the local
/// scope closed. Emitted on [`Datastore::on_apply_error`].
#[derive(Debug)]
pub struct ApplyFailure {
    pub transaction_id: TransactionId,
    pub error: StoreError,
}

/// The transaction currently being built by local writes.
struct OpenTransaction {
    id: TransactionId,
    patch: Vec<FieldPatch>,
    changes: ChangeSet,
}

struct StoreState {
    schemas: BTreeMap<SchemaId, Schema>,
    tables: BTreeMap<SchemaId, Records>,
    /// Nesting depth of transaction scopes; 0 means none is open.
    depth: usize,
    open: Option<OpenTransaction>,
    deferred: Vec<Transaction>,
    /// Ids of every transaction applied since the last stable point.
    seen: HashSet<TransactionId>,
    /// Local commits the server has not yet sequenced. Kept in `seen`
    /// across stable points until [`Datastore::confirm`] releases them.
    unconfirmed: HashSet<TransactionId>,
    version: u64,
}

impl StoreState {
    fn schema(&self, schema: &SchemaId) -> StoreResult<&Schema> {
        self.schemas
            .get(schema)
            .ok_or_else(|| StoreError::UnknownSchema(schema.clone()))
    }

    fn read(&self, schema: &SchemaId, record: &RecordId, field: &FieldId) -> StoreResult<FieldValue> {
        let kind = self.schema(schema)?.kind_of(field)?;
        Ok(self
            .tables
            .get(schema)
            .and_then(|t| t.get(record))
            .and_then(|r| r.get(field))
            .cloned()
            .unwrap_or_else(|| kind.default_value()))
    }

    /// Applies a whole patch atomically: either every update lands or none.
    fn apply_patch(&mut self, patch: &[FieldPatch]) -> StoreResult<ChangeSet> {
        let mut staged: BTreeMap<(SchemaId, RecordId, FieldId), FieldValue> = BTreeMap::new();
        let mut changes = ChangeSet::new();
        for p in patch {
            let key = (p.schema.clone(), p.record.clone(), p.field.clone());
            let value = match staged.entry(key) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => entry.insert(self.read(&p.schema, &p.record, &p.field)?),
            };
            let change = value.apply(&p.field, &p.update)?;
            record_change(&mut changes, &p.schema, &p.record, &p.field, change);
        }
        for ((schema, record, field), value) in staged {
            self.tables
                .entry(schema)
                .or_default()
                .entry(record)
                .or_default()
                .insert(field, value);
        }
        self.version += 1;
        Ok(changes)
    }
}

/// A local replica: schema-defined tables of records.
///
/// Writes happen inside transaction scopes. Scopes nest; only the outermost
/// [`end_transaction`](Self::end_transaction) commits, producing one
/// [`Transaction`] and one [`StoreChange`]. Listeners are always invoked
/// after the internal lock is released.
pub struct Datastore {
    store_id: StoreId,
    state: Mutex<StoreState>,
    changed: Signal<StoreChange>,
    committed: Signal<Transaction>,
    stable: Signal<u64>,
    apply_failed: Signal<ApplyFailure>,
}

impl Datastore {
    /// Creates an empty store for the given replica and schemas.
    pub fn new(store_id: StoreId, schemas: impl IntoIterator<Item = Schema>) -> Self {
        let schemas = schemas.into_iter().map(|s| (s.id.clone(), s)).collect();
        Self {
            store_id,
            state: Mutex::new(StoreState {
                schemas,
                tables: BTreeMap::new(),
                depth: 0,
                open: None,
                deferred: Vec::new(),
                seen: HashSet::new(),
                unconfirmed: HashSet::new(),
                version: 0,
            }),
            changed: Signal::new(),
            committed: Signal::new(),
            stable: Signal::new(),
            apply_failed: Signal::new(),
        }
    }

    /// The replica identity this store brands its transactions with.
    pub fn store_id(&self) -> StoreId {
        self.store_id
    }

    /// Returns a copy of a registered schema.
    pub fn schema(&self, schema: &SchemaId) -> StoreResult<Schema> {
        self.state.lock().unwrap().schema(schema).cloned()
    }

    /// Registered schema ids.
    pub fn schema_ids(&self) -> Vec<SchemaId> {
        self.state.lock().unwrap().schemas.keys().cloned().collect()
    }

    /// Returns a handle to one table.
    pub fn table(self: &Arc<Self>, schema: impl Into<SchemaId>) -> StoreResult<Table> {
        let schema = schema.into();
        self.state.lock().unwrap().schema(&schema)?;
        Ok(Table {
            store: Arc::clone(self),
            schema,
        })
    }

    /// Counter bumped on every committed change.
    pub fn version(&self) -> u64 {
        self.state.lock().unwrap().version
    }

    /// Whether a transaction scope is open.
    pub fn in_transaction(&self) -> bool {
        self.state.lock().unwrap().depth > 0
    }

    /// Opens a transaction scope, or joins the one already open.
    ///
    /// Returns the id the committed transaction will carry.
    pub fn begin_transaction(&self) -> TransactionId {
        let mut state = self.state.lock().unwrap();
        state.depth += 1;
        state
            .open
            .get_or_insert_with(|| OpenTransaction {
                id: TransactionId::new(),
                patch: Vec::new(),
                changes: ChangeSet::new(),
            })
            .id
    }

    /// Closes a transaction scope.
    ///
    /// Closing the outermost scope commits: if anything was written, the
    /// transaction is emitted on [`on_transaction`](Self::on_transaction) and
    /// its change on [`on_change`](Self::on_change), and it is returned.
    /// Remote transactions deferred while the scope was open are applied
    /// afterwards. Their failures do not belong to the local writer: they are
    /// reported on [`on_apply_error`](Self::on_apply_error) and the remaining
    /// deferred transactions are still applied.
    pub fn end_transaction(&self) -> StoreResult<Option<Transaction>> {
        let (committed, deferred) = {
            let mut state = self.state.lock().unwrap();
            if state.depth == 0 {
                return Err(StoreError::NotInTransaction);
            }
            state.depth -= 1;
            if state.depth > 0 {
                return Ok(None);
            }
            let open = state.open.take();
            let deferred = std::mem::take(&mut state.deferred);
            let committed = open.filter(|o| !o.patch.is_empty()).map(|o| {
                state.seen.insert(o.id);
                state.unconfirmed.insert(o.id);
                let change = StoreChange {
                    origin: ChangeOrigin::Local,
                    transaction_id: o.id,
                    store_id: self.store_id,
                    fields: o.changes,
                };
                let transaction = Transaction {
                    id: o.id,
                    store_id: self.store_id,
                    patch: o.patch,
                };
                (transaction, change)
            });
            (committed, deferred)
        };

        let committed = committed.map(|(transaction, change)| {
            debug!(
                transaction = %transaction.id,
                patches = transaction.patch.len(),
                "committed local transaction"
            );
            self.changed.emit(&change);
            self.committed.emit(&transaction);
            transaction
        });

        for transaction in deferred {
            if let Err(error) = self.apply_transaction(&transaction) {
                warn!(transaction = %transaction.id, %error, "deferred remote transaction failed");
                self.apply_failed.emit(&ApplyFailure {
                    transaction_id: transaction.id,
                    error,
                });
            }
        }
        Ok(committed)
    }

    /// Runs `f` inside a transaction scope.
    pub fn transact<R>(&self, f: impl FnOnce() -> StoreResult<R>) -> StoreResult<R> {
        self.begin_transaction();
        let result = f();
        let ended = self.end_transaction();
        let value = result?;
        ended?;
        Ok(value)
    }

    /// Reads one field; unset fields read as their kind's default.
    pub fn get_field(
        &self,
        schema: &SchemaId,
        record: &RecordId,
        field: &FieldId,
    ) -> StoreResult<FieldValue> {
        self.state.lock().unwrap().read(schema, record, field)
    }

    /// Record ids present in a table.
    pub fn records(&self, schema: &SchemaId) -> StoreResult<Vec<RecordId>> {
        let state = self.state.lock().unwrap();
        state.schema(schema)?;
        Ok(state
            .tables
            .get(schema)
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default())
    }

    /// Applies updates to one table inside the open transaction scope.
    pub fn update(&self, schema: &SchemaId, update: TableUpdate) -> StoreResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.depth == 0 {
            return Err(StoreError::NotInTransaction);
        }
        let schema_def = state.schema(schema)?;
        for fields in update.values() {
            for field in fields.keys() {
                schema_def.kind_of(field)?;
            }
        }
        let patch: Vec<FieldPatch> = update
            .into_iter()
            .flat_map(|(record, fields)| {
                fields.into_iter().map(move |(field, update)| FieldPatch {
                    schema: schema.clone(),
                    record: record.clone(),
                    field,
                    update,
                })
            })
            .filter(|p| !p.update.is_empty())
            .collect();
        if patch.is_empty() {
            return Ok(());
        }

        let changes = state.apply_patch(&patch)?;
        if let Some(open) = state.open.as_mut() {
            for (schema, records) in changes {
                for (record, fields) in records {
                    for (field, change) in fields {
                        record_change(&mut open.changes, &schema, &record, &field, change);
                    }
                }
            }
            open.patch.extend(patch);
        }
        Ok(())
    }

    /// Convenience for updating a single field.
    pub fn update_field(
        &self,
        schema: &SchemaId,
        record: &RecordId,
        field: &FieldId,
        update: FieldUpdate,
    ) -> StoreResult<()> {
        let mut fields = BTreeMap::new();
        fields.insert(field.clone(), update);
        let mut table = TableUpdate::new();
        table.insert(record.clone(), fields);
        self.update(schema, table)
    }

    /// Applies a transaction received from the server.
    ///
    /// A transaction whose id was already applied is skipped.
    pub fn apply_transaction(&self, transaction: &Transaction) -> StoreResult<ApplyOutcome> {
        let change = {
            let mut state = self.state.lock().unwrap();
            if state.seen.contains(&transaction.id) {
                trace!(transaction = %transaction.id, "skipping duplicate transaction");
                return Ok(ApplyOutcome::Duplicate);
            }
            if state.depth > 0 {
                debug!(transaction = %transaction.id, "deferring remote transaction");
                state.deferred.push(transaction.clone());
                return Ok(ApplyOutcome::Deferred);
            }
            let fields = state.apply_patch(&transaction.patch)?;
            state.seen.insert(transaction.id);
            StoreChange {
                origin: ChangeOrigin::Remote,
                transaction_id: transaction.id,
                store_id: transaction.store_id,
                fields,
            }
        };
        self.changed.emit(&change);
        Ok(ApplyOutcome::Applied)
    }

    /// Records that the server has sequenced these local transactions, so
    /// the next stable point may forget them.
    pub fn confirm<'a>(&self, ids: impl IntoIterator<Item = &'a TransactionId>) {
        let mut state = self.state.lock().unwrap();
        for id in ids {
            state.unconfirmed.remove(id);
        }
    }

    /// Whether a transaction id has been applied since the last stable point.
    pub fn has_applied(&self, id: &TransactionId) -> bool {
        self.state.lock().unwrap().seen.contains(id)
    }

    /// Serializes every table as `{schema: {record: {field: value}}}`.
    pub fn snapshot(&self) -> Value {
        let state = self.state.lock().unwrap();
        let tables: Map<String, Value> = state
            .tables
            .iter()
            .map(|(schema, records)| {
                let records: Map<String, Value> = records
                    .iter()
                    .map(|(record, fields)| {
                        let fields: Map<String, Value> = fields
                            .iter()
                            .map(|(field, value)| (field.to_string(), value.to_json()))
                            .collect();
                        (record.to_string(), Value::Object(fields))
                    })
                    .collect();
                (schema.to_string(), Value::Object(records))
            })
            .collect();
        Value::Object(tables)
    }

    /// Replaces the store's contents with a snapshot.
    ///
    /// Emits one remote change describing every field that differs.
    pub fn restore(&self, snapshot: &Value) -> StoreResult<()> {
        let change = {
            let mut state = self.state.lock().unwrap();
            if state.depth > 0 {
                return Err(StoreError::InvalidCheckpoint(
                    "cannot restore inside a transaction".into(),
                ));
            }
            let mut tables: BTreeMap<SchemaId, Records> = BTreeMap::new();
            for (schema, records) in expect_object(snapshot.clone(), "snapshot")? {
                let schema = SchemaId::new(schema);
                let schema_def = state.schema(&schema)?;
                let table = tables.entry(schema.clone()).or_default();
                for (record, fields) in expect_object(records, "table")? {
                    let row = table.entry(RecordId::new(record)).or_default();
                    for (field, value) in expect_object(fields, "record")? {
                        let field = FieldId::new(field);
                        let kind = schema_def.kind_of(&field)?;
                        row.insert(field.clone(), FieldValue::from_json(kind, &field, value)?);
                    }
                }
            }

            let mut fields = ChangeSet::new();
            let keys: HashSet<(SchemaId, RecordId, FieldId)> = state
                .tables
                .iter()
                .chain(tables.iter())
                .flat_map(|(schema, records)| {
                    records.iter().flat_map(move |(record, row)| {
                        row.keys()
                            .map(move |field| (schema.clone(), record.clone(), field.clone()))
                    })
                })
                .collect();
            for (schema, record, field) in keys {
                let before = state.read(&schema, &record, &field)?;
                let kind = before.kind();
                let after = tables
                    .get(&schema)
                    .and_then(|t| t.get(&record))
                    .and_then(|r| r.get(&field))
                    .cloned()
                    .unwrap_or_else(|| kind.default_value());
                if let Some(change) = before.replacement_change(&after) {
                    record_change(&mut fields, &schema, &record, &field, change);
                }
            }

            state.tables = tables;
            state.version += 1;
            StoreChange {
                origin: ChangeOrigin::Remote,
                transaction_id: TransactionId::new(),
                store_id: self.store_id,
                fields,
            }
        };
        if !change.is_empty() {
            self.changed.emit(&change);
        }
        Ok(())
    }

    /// Marks history up to `serial` as applied everywhere.
    ///
    /// Forgets the ids kept for duplicate detection, except local commits
    /// not yet [confirmed](Self::confirm), and notifies
    /// [`on_stable`](Self::on_stable) listeners.
    pub fn mark_stable(&self, serial: u64) {
        let forgotten = {
            let mut state = self.state.lock().unwrap();
            let StoreState {
                seen, unconfirmed, ..
            } = &mut *state;
            let n = seen.len();
            seen.retain(|id| unconfirmed.contains(id));
            n - seen.len()
        };
        debug!(serial, forgotten, "store reached a stable point");
        self.stable.emit(&serial);
    }

    /// Subscribes to committed changes, local and remote.
    #[must_use = "dropping the subscription disconnects the listener"]
    pub fn on_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&StoreChange) + Send + Sync + 'static,
    {
        self.changed.connect(listener)
    }

    /// Subscribes to locally committed transactions.
    #[must_use = "dropping the subscription disconnects the listener"]
    pub fn on_transaction<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Transaction) + Send + Sync + 'static,
    {
        self.committed.connect(listener)
    }

    /// Subscribes to failures of deferred remote transactions.
    #[must_use = "dropping the subscription disconnects the listener"]
    pub fn on_apply_error<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ApplyFailure) + Send + Sync + 'static,
    {
        self.apply_failed.connect(listener)
    }

    /// Subscribes to stable-point notifications.
    #[must_use = "dropping the subscription disconnects the listener"]
    pub fn on_stable<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&u64) + Send + Sync + 'static,
    {
        self.stable.connect(listener)
    }
}

impl std::fmt::Debug for Datastore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Datastore")
            .field("store_id", &self.store_id)
            .finish_non_exhaustive()
    }
}

/// A handle to one table of a [`Datastore`].
#[derive(Clone)]
pub struct Table {
    store: Arc<Datastore>,
    schema: SchemaId,
}

impl Table {
    pub fn schema_id(&self) -> &SchemaId {
        &self.schema
    }

    /// Applies updates inside the store's open transaction scope.
    pub fn update(&self, update: TableUpdate) -> StoreResult<()> {
        self.store.update(&self.schema, update)
    }

    /// Reads one field of one record.
    pub fn get(&self, record: &RecordId, field: &FieldId) -> StoreResult<FieldValue> {
        self.store.get_field(&self.schema, record, field)
    }

    /// Record ids present in the table.
    pub fn records(&self) -> StoreResult<Vec<RecordId>> {
        self.store.records(&self.schema)
    }

    /// Whether a record exists.
    pub fn has(&self, record: &RecordId) -> StoreResult<bool> {
        Ok(self.records()?.contains(record))
    }
}
