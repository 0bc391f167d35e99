//! The synchronization manager.
//!
//! [`SyncManager`] owns the session, the local [`Datastore`] and the serial
//! bookkeeping for one collaboration. Local transactions committed to the
//! store are queued and broadcast in batches; the server's acknowledgments
//! and remote transactions are reconciled on the session's reader task, in
//! frame order, so the store only ever sees server serials in sequence.

use crate::error::{SyncError, SyncResult};
use crate::protocol::{Checkpoint, Message, MessageBody, Permissions};
use crate::serial::{DEFAULT_IDLE_THRESHOLD, IdleTimer, SerialReconciler};
use crate::session::{MessageHandler, Session, SessionConfig};
use crate::transport::Connector;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;
use tessel_store::{ApplyFailure, ApplyOutcome, ChangeOrigin, Datastore, Schema, Subscription};
use tessel_types::{SerialTransaction, StoreId, Transaction, TransactionId};
use tokio::sync::{OnceCell, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Configuration for a [`SyncManager`].
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub service_url: String,
    pub collaboration_id: Option<String>,
    pub token: Option<String>,
    /// Quiet period before a `serial-update` heartbeat.
    pub idle_threshold_ms: u64,
    /// Deadline for each request; 0 waits indefinitely.
    pub request_timeout_ms: u64,
    /// Pause before each reconnect attempt.
    pub reconnect_delay_ms: u64,
    /// Reconnect attempts before giving up; `None` retries forever.
    pub max_reconnect_attempts: Option<u32>,
    /// Checkpoint to start history replay from.
    pub checkpoint_id: Option<String>,
    /// Tables of the local store.
    pub schemas: Vec<Schema>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let session = SessionConfig::default();
        Self {
            service_url: session.service_url,
            collaboration_id: None,
            token: None,
            idle_threshold_ms: DEFAULT_IDLE_THRESHOLD.as_millis() as u64,
            request_timeout_ms: 30_000,
            reconnect_delay_ms: 1_000,
            max_reconnect_attempts: Some(10),
            checkpoint_id: None,
            schemas: Vec::new(),
        }
    }
}

impl SyncConfig {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            service_url: self.service_url.clone(),
            collaboration_id: self.collaboration_id.clone(),
            token: self.token.clone(),
        }
    }

    pub fn idle_threshold(&self) -> Duration {
        Duration::from_millis(self.idle_threshold_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

/// Lifecycle and progress notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerEvent {
    /// History is replayed and pending work resent; the store is current.
    Ready,
    Connected,
    Disconnected,
    /// A server transaction was applied to the store.
    RemoteApplied { serial: u64 },
    /// The server reported a stable point at the current serial.
    Stable { serial: u64 },
    /// Sync stopped; the store no longer tracks the server.
    Fatal { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct Progress {
    /// Local transactions queued or awaiting acknowledgment.
    outstanding: usize,
    fatal: bool,
}

#[derive(Default)]
struct SyncState {
    serials: SerialReconciler,
    pending: HashMap<TransactionId, SerialTransaction>,
    /// Local transactions not yet picked up by the broadcaster.
    queued: usize,
    /// Notices buffered while a history replay is in flight.
    replay: Option<Vec<SerialTransaction>>,
    /// Server serials of transactions handed to the store whose change has
    /// not landed yet, possibly because a local scope deferred them.
    applying: HashMap<TransactionId, u64>,
    fatal: Option<String>,
}

impl SyncState {
    fn progress(&self) -> Progress {
        Progress {
            outstanding: self.queued + self.pending.len(),
            fatal: self.fatal.is_some(),
        }
    }
}

struct ManagerInner {
    config: SyncConfig,
    session: Session,
    store_id: OnceCell<StoreId>,
    store: OnceLock<Arc<Datastore>>,
    sync: Mutex<SyncState>,
    events: broadcast::Sender<ManagerEvent>,
    progress: watch::Sender<Progress>,
    queue: mpsc::UnboundedSender<Transaction>,
    /// Serializes broadcasting with reconnect resends.
    send_gate: tokio::sync::Mutex<()>,
    idle: OnceLock<IdleTimer>,
    /// Store listeners, dropped on close.
    listeners: Mutex<Vec<Subscription>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    reconnecting: AtomicBool,
    closed: AtomicBool,
    this: Weak<ManagerInner>,
}

impl ManagerInner {
    fn emit(&self, event: ManagerEvent) {
        let _ = self.events.send(event);
    }

    fn publish(&self, sync: &SyncState) {
        self.progress.send_replace(sync.progress());
    }

    fn touch(&self) {
        if let Some(idle) = self.idle.get() {
            idle.touch();
        }
    }

    fn store(&self) -> SyncResult<&Arc<Datastore>> {
        self.store
            .get()
            .ok_or_else(|| SyncError::Protocol("store is not initialised yet".into()))
    }

    fn check_fatal(&self) -> SyncResult<()> {
        match &self.sync.lock().unwrap().fatal {
            Some(reason) => Err(SyncError::Fatal(reason.clone())),
            None => Ok(()),
        }
    }

    /// Records the first fatal error and stops broadcasting.
    fn fail(&self, err: &SyncError) {
        let reason = err.to_string();
        {
            let mut sync = self.sync.lock().unwrap();
            if sync.fatal.is_some() {
                return;
            }
            sync.fatal = Some(reason.clone());
            self.publish(&sync);
        }
        error!(error = %reason, "sync stopped");
        self.emit(ManagerEvent::Fatal { reason });
    }

    fn request_timeout(&self) -> Duration {
        self.config.request_timeout()
    }

    // ── Local side ───────────────────────────────────────────────

    fn enqueue(&self, transaction: Transaction) {
        {
            let mut sync = self.sync.lock().unwrap();
            if sync.fatal.is_some() {
                debug!(transaction = %transaction.id, "not queueing after fatal error");
                return;
            }
            sync.queued += 1;
            self.publish(&sync);
        }
        if self.queue.send(transaction).is_err() {
            warn!("broadcast queue closed");
        }
    }

    /// Brands transactions with our serial and records them as pending.
    fn stage(&self, transactions: Vec<Transaction>, dequeued: usize) -> Vec<SerialTransaction> {
        let mut sync = self.sync.lock().unwrap();
        sync.queued = sync.queued.saturating_sub(dequeued);
        let staged: Vec<SerialTransaction> = transactions
            .into_iter()
            .map(|transaction| {
                let serial = sync.serials.next_our_serial();
                let staged = SerialTransaction::new(transaction, serial);
                sync.pending.insert(staged.id(), staged.clone());
                staged
            })
            .collect();
        self.publish(&sync);
        staged
    }

    async fn send_broadcast(&self, transactions: Vec<SerialTransaction>) -> SyncResult<()> {
        if transactions.is_empty() {
            return Ok(());
        }
        let count = transactions.len();
        let reply = self
            .session
            .request_reply(
                Message::transaction_broadcast(transactions),
                self.request_timeout(),
            )
            .await?;
        match reply.body {
            MessageBody::TransactionAck { .. } => {
                debug!(count, "broadcast acknowledged");
                Ok(())
            }
            other => Err(SyncError::Protocol(format!(
                "expected transaction-ack, got {}",
                other.msg_type()
            ))),
        }
    }

    /// Re-broadcasts every pending transaction in original serial order.
    async fn resend_pending(&self) -> SyncResult<()> {
        let mut pending: Vec<SerialTransaction> =
            self.sync.lock().unwrap().pending.values().cloned().collect();
        if pending.is_empty() {
            return Ok(());
        }
        pending.sort_by_key(|t| t.serial);
        info!(count = pending.len(), "resending unacknowledged transactions");
        self.send_broadcast(pending).await
    }

    // ── Server side (reader task) ────────────────────────────────

    fn reconcile_ack(&self, transaction_ids: &[TransactionId], serials: &[u64]) -> SyncResult<()> {
        if transaction_ids.len() != serials.len() {
            return Err(SyncError::Protocol(format!(
                "ack names {} transactions but {} serials",
                transaction_ids.len(),
                serials.len()
            )));
        }
        let mut sync = self.sync.lock().unwrap();
        let mut confirmed = Vec::with_capacity(transaction_ids.len());
        let mut result: SyncResult<()> = Ok(());
        for (id, &serial) in transaction_ids.iter().zip(serials) {
            if let Err(e) = sync.serials.accept(serial) {
                result = Err(e);
                break;
            }
            if sync.pending.remove(id).is_none() {
                warn!(transaction = %id, serial, "acknowledged transaction was not pending");
            }
            confirmed.push(*id);
        }
        self.publish(&sync);
        drop(sync);
        if let Some(store) = self.store.get() {
            store.confirm(&confirmed);
        }
        self.touch();
        result
    }

    /// The single ordered-apply path for server transactions.
    ///
    /// With `skip_covered`, serials already applied are ignored (history
    /// replay); otherwise they are a gap like any other.
    fn apply_ordered(&self, transaction: SerialTransaction, skip_covered: bool) -> SyncResult<()> {
        let store = self.store()?;
        let id = transaction.id();
        let serial = transaction.serial;
        let own = {
            let mut sync = self.sync.lock().unwrap();
            if skip_covered && sync.serials.covers(serial) {
                trace!(serial, "skipping covered serial");
                return Ok(());
            }
            sync.serials.accept(serial)?;
            let own = sync.pending.remove(&id).is_some();
            if own {
                debug!(serial, "own transaction confirmed by history");
                self.publish(&sync);
            }
            sync.applying.insert(id, serial);
            own
        };
        if own {
            store.confirm([&id]);
        }
        // `RemoteApplied` is emitted by the change listener once the patch
        // lands, which for a deferred transaction is after the local scope
        // closes.
        let outcome = store.apply_transaction(&transaction.transaction);
        match outcome {
            Ok(ApplyOutcome::Deferred) => {
                debug!(serial, "remote transaction waits for the local scope to close");
            }
            Ok(outcome) => {
                self.sync.lock().unwrap().applying.remove(&id);
                trace!(serial, ?outcome, "applied remote transaction");
            }
            Err(e) => {
                self.sync.lock().unwrap().applying.remove(&id);
                return Err(e.into());
            }
        }
        self.touch();
        Ok(())
    }

    /// Called for every remote change the store emits.
    fn on_remote_change(&self, transaction_id: &TransactionId) {
        let serial = self.sync.lock().unwrap().applying.remove(transaction_id);
        if let Some(serial) = serial {
            self.emit(ManagerEvent::RemoteApplied { serial });
        }
    }

    /// A deferred server transaction failed once the local scope closed.
    /// The serial was already accepted, so the store has diverged.
    fn on_deferred_failure(&self, failure: &ApplyFailure) {
        let serial = self
            .sync
            .lock()
            .unwrap()
            .applying
            .remove(&failure.transaction_id);
        self.fail(&SyncError::Fatal(format!(
            "deferred transaction {} at serial {} failed: {}",
            failure.transaction_id,
            serial.unwrap_or_default(),
            failure.error
        )));
    }

    fn apply_history(
        &self,
        checkpoint: Option<&Checkpoint>,
        transactions: &[SerialTransaction],
    ) -> SyncResult<()> {
        let store = self.store()?;
        let restore = {
            let sync = self.sync.lock().unwrap();
            if sync.replay.is_none() {
                debug!("ignoring history reply outside a replay");
                return Ok(());
            }
            checkpoint.filter(|c| !sync.serials.covers(c.serial))
        };
        if let Some(checkpoint) = restore {
            store.restore(&checkpoint.state)?;
            self.sync.lock().unwrap().serials.restore(checkpoint.serial);
            info!(checkpoint = %checkpoint.id, serial = checkpoint.serial, "restored checkpoint");
        }

        for transaction in transactions {
            self.apply_ordered(transaction.clone(), true)?;
        }
        let buffered = self.sync.lock().unwrap().replay.take().unwrap_or_default();
        if !buffered.is_empty() {
            debug!(count = buffered.len(), "applying notices buffered during replay");
        }
        for transaction in buffered {
            self.apply_ordered(transaction, true)?;
        }
        Ok(())
    }

    fn on_remote_broadcast(&self, transactions: Vec<SerialTransaction>) -> SyncResult<()> {
        for transaction in transactions {
            {
                let mut sync = self.sync.lock().unwrap();
                if let Some(buffer) = sync.replay.as_mut() {
                    buffer.push(transaction);
                    continue;
                }
            }
            self.apply_ordered(transaction, false)?;
        }
        Ok(())
    }

    fn on_state_stable(&self, serial: u64) -> SyncResult<()> {
        let current = {
            let sync = self.sync.lock().unwrap();
            if sync.replay.is_some() {
                debug!(serial, "ignoring state-stable during history replay");
                return Ok(());
            }
            sync.serials.server_serial()
        };
        if serial != current {
            debug!(serial, current, "ignoring state-stable for another serial");
            return Ok(());
        }
        self.store()?.mark_stable(serial);
        self.emit(ManagerEvent::Stable { serial });
        Ok(())
    }

    fn send_serial_update(&self) {
        let serial = self.sync.lock().unwrap().serials.server_serial();
        if let Err(e) = self.session.send(&Message::serial_update(serial)) {
            debug!(error = %e, serial, "could not send serial-update");
        }
    }

    async fn replay_history(&self, checkpoint_id: Option<String>) -> SyncResult<u64> {
        {
            let mut sync = self.sync.lock().unwrap();
            sync.replay.get_or_insert_with(Vec::new);
        }
        let result = self
            .session
            .request_reply(Message::history_request(checkpoint_id), self.request_timeout())
            .await;
        let mut sync = self.sync.lock().unwrap();
        match result {
            Ok(reply) => match reply.body {
                MessageBody::HistoryReply { .. } => Ok(sync.serials.server_serial()),
                other => {
                    sync.replay = None;
                    Err(SyncError::Protocol(format!(
                        "expected history-reply, got {}",
                        other.msg_type()
                    )))
                }
            },
            Err(e) => {
                // The next replay covers whatever was buffered.
                sync.replay = None;
                Err(e)
            }
        }
    }

    async fn acquire_store_id(&self) -> SyncResult<StoreId> {
        let id = *self
            .store_id
            .get_or_try_init(|| async {
                let reply = self
                    .session
                    .request_reply(Message::storeid_request(), self.request_timeout())
                    .await?;
                match reply.body {
                    MessageBody::StoreIdReply { store_id } => {
                        info!(%store_id, "acquired store id");
                        Ok(store_id)
                    }
                    other => Err(SyncError::Protocol(format!(
                        "expected storeid-reply, got {}",
                        other.msg_type()
                    ))),
                }
            })
            .await?;
        self.session.set_store_id(id);
        Ok(id)
    }

    fn stop_tasks(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        if let Some(idle) = self.idle.get() {
            idle.stop();
        }
    }
}

impl MessageHandler for ManagerInner {
    fn on_reply(&self, message: &Message) -> SyncResult<()> {
        let result = match &message.body {
            MessageBody::TransactionAck {
                transaction_ids,
                serials,
            } => self.reconcile_ack(transaction_ids, serials),
            MessageBody::HistoryReply {
                checkpoint,
                transactions,
            } => self.apply_history(checkpoint.as_ref(), transactions),
            _ => Ok(()),
        };
        if let Err(e) = &result {
            self.fail(e);
        }
        result
    }

    fn on_notice(&self, message: Message) {
        if self.sync.lock().unwrap().fatal.is_some() {
            return;
        }
        let result = match message.body {
            MessageBody::TransactionBroadcast { transactions } => {
                self.on_remote_broadcast(transactions)
            }
            MessageBody::StateStable { serial } => self.on_state_stable(serial),
            other => {
                debug!(msg_type = other.msg_type(), "ignoring unexpected notice");
                Ok(())
            }
        };
        if let Err(e) = result {
            self.fail(&e);
        }
    }

    fn on_disconnect(&self) {
        self.emit(ManagerEvent::Disconnected);
        if self.closed.load(Ordering::SeqCst) || self.sync.lock().unwrap().fatal.is_some() {
            return;
        }
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let task = tokio::spawn(supervise(self.this.clone()));
        self.tasks.lock().unwrap().push(task);
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        self.stop_tasks();
        self.session.close();
    }
}

async fn supervise(inner: Weak<ManagerInner>) {
    let mut attempt: u32 = 0;
    loop {
        let Some(manager) = inner.upgrade() else {
            return;
        };
        if manager.closed.load(Ordering::SeqCst) || manager.check_fatal().is_err() {
            break;
        }
        if let Some(max) = manager.config.max_reconnect_attempts {
            if attempt >= max {
                manager.fail(&SyncError::Network(format!(
                    "gave up reconnecting after {attempt} attempts"
                )));
                break;
            }
        }
        attempt += 1;
        let delay = manager.config.reconnect_delay();
        drop(manager);
        tokio::time::sleep(delay).await;

        let Some(manager) = inner.upgrade() else {
            return;
        };
        let _gate = manager.send_gate.lock().await;
        manager.sync.lock().unwrap().replay.get_or_insert_with(Vec::new);
        if let Err(e) = manager.session.connect().await {
            warn!(attempt, error = %e, "reconnect failed");
            continue;
        }
        manager.emit(ManagerEvent::Connected);
        let resumed = match manager.replay_history(None).await {
            Ok(_) => manager.resend_pending().await,
            Err(e) => Err(e),
        };
        match resumed {
            Ok(()) => {
                info!(attempt, "sync resumed");
                manager.emit(ManagerEvent::Ready);
                break;
            }
            Err(e) if e.is_fatal() => break,
            Err(e) => warn!(attempt, error = %e, "resume after reconnect failed"),
        }
    }
    if let Some(manager) = inner.upgrade() {
        manager.reconnecting.store(false, Ordering::SeqCst);
    }
}

async fn broadcast_loop(inner: Weak<ManagerInner>, mut queue: mpsc::UnboundedReceiver<Transaction>) {
    while let Some(first) = queue.recv().await {
        let mut batch = vec![first];
        while let Ok(next) = queue.try_recv() {
            batch.push(next);
        }
        let Some(manager) = inner.upgrade() else {
            return;
        };
        if manager.check_fatal().is_err() {
            debug!(dropped = batch.len(), "not broadcasting after fatal error");
            continue;
        }
        let _gate = manager.send_gate.lock().await;
        let dequeued = batch.len();
        let staged = manager.stage(batch, dequeued);
        if !manager.session.is_connected() {
            debug!(count = staged.len(), "offline; holding transactions for resend");
            continue;
        }
        if let Err(e) = manager.send_broadcast(staged).await {
            warn!(error = %e, "broadcast failed; transactions stay pending");
        }
    }
}

/// Keeps a local [`Datastore`] in sync with the datastore server.
#[derive(Clone)]
pub struct SyncManager {
    inner: Arc<ManagerInner>,
    store: Arc<Datastore>,
}

impl SyncManager {
    /// Connects, acquires a store id, builds the store and replays history.
    ///
    /// Returns once the store reflects the server's history and local
    /// writes are being broadcast.
    pub async fn connect(config: SyncConfig, connector: Arc<dyn Connector>) -> SyncResult<Self> {
        let session = Session::new(config.session_config(), connector);
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(256);
        let (progress, _) = watch::channel(Progress::default());

        let inner = Arc::new_cyclic(|this| ManagerInner {
            config,
            session,
            store_id: OnceCell::new(),
            store: OnceLock::new(),
            sync: Mutex::new(SyncState::default()),
            events,
            progress,
            queue: queue_tx,
            send_gate: tokio::sync::Mutex::new(()),
            idle: OnceLock::new(),
            listeners: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            reconnecting: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            this: this.clone(),
        });
        let weak = Arc::downgrade(&inner);
        let handler: Weak<dyn MessageHandler> = weak.clone();
        inner.session.set_handler(handler);

        // Notices that arrive before history has been replayed are buffered.
        inner.sync.lock().unwrap().replay = Some(Vec::new());
        inner.session.connect().await?;
        let store_id = inner.acquire_store_id().await?;
        let store = Arc::new(Datastore::new(store_id, inner.config.schemas.clone()));
        let _ = inner.store.set(Arc::clone(&store));

        let listeners = {
            let (local, remote, failed) = (weak.clone(), weak.clone(), weak.clone());
            vec![
                store.on_transaction(move |transaction| {
                    if let Some(inner) = local.upgrade() {
                        inner.enqueue(transaction.clone());
                    }
                }),
                store.on_change(move |change| {
                    if change.origin != ChangeOrigin::Remote {
                        return;
                    }
                    if let Some(inner) = remote.upgrade() {
                        inner.on_remote_change(&change.transaction_id);
                    }
                }),
                store.on_apply_error(move |failure| {
                    if let Some(inner) = failed.upgrade() {
                        inner.on_deferred_failure(failure);
                    }
                }),
            ]
        };
        *inner.listeners.lock().unwrap() = listeners;

        let server_serial = inner.replay_history(inner.config.checkpoint_id.clone()).await?;
        inner.check_fatal()?;

        let idle = {
            let weak = weak.clone();
            IdleTimer::spawn(inner.config.idle_threshold(), move || {
                if let Some(inner) = weak.upgrade() {
                    inner.send_serial_update();
                }
            })
        };
        let _ = inner.idle.set(idle);
        let broadcaster = tokio::spawn(broadcast_loop(weak, queue_rx));
        inner.tasks.lock().unwrap().push(broadcaster);

        info!(%store_id, server_serial, "sync manager ready");
        inner.emit(ManagerEvent::Ready);
        Ok(Self { inner, store })
    }

    /// The local store.
    pub fn store(&self) -> &Arc<Datastore> {
        &self.store
    }

    pub fn store_id(&self) -> StoreId {
        self.store.store_id()
    }

    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    /// Returns the store id, requesting it only the first time.
    pub async fn acquire_store_id(&self) -> SyncResult<StoreId> {
        self.inner.acquire_store_id().await
    }

    /// Asks the server for this client's permissions. Never cached.
    pub async fn permissions(&self) -> SyncResult<Permissions> {
        let reply = self
            .inner
            .session
            .request_reply(Message::permissions_request(), self.inner.request_timeout())
            .await?;
        match reply.body {
            MessageBody::PermissionsReply(permissions) => Ok(permissions),
            other => Err(SyncError::Protocol(format!(
                "expected permissions-reply, got {}",
                other.msg_type()
            ))),
        }
    }

    /// Replays server history into the store, starting from a checkpoint
    /// if given. Already-applied serials are skipped. Returns the server
    /// serial reached.
    pub async fn replay_history(&self, checkpoint_id: Option<String>) -> SyncResult<u64> {
        self.inner.check_fatal()?;
        self.inner.replay_history(checkpoint_id).await
    }

    /// Broadcasts transactions and waits for the server's acknowledgment.
    ///
    /// Each transaction is branded with the next local serial and held as
    /// pending until acknowledged.
    pub async fn broadcast_transactions(&self, transactions: Vec<Transaction>) -> SyncResult<()> {
        self.inner.check_fatal()?;
        let _gate = self.inner.send_gate.lock().await;
        let staged = self.inner.stage(transactions, 0);
        self.inner.send_broadcast(staged).await
    }

    /// Applies a server transaction through the ordered-apply path.
    ///
    /// Any serial other than the next expected one is fatal.
    pub fn apply_remote(&self, transaction: SerialTransaction) -> SyncResult<()> {
        self.inner.check_fatal()?;
        self.inner.apply_ordered(transaction, false).map_err(|e| {
            self.inner.fail(&e);
            e
        })
    }

    /// Fetches the server's copies of transactions by id.
    pub async fn fetch_transactions(
        &self,
        ids: Vec<TransactionId>,
    ) -> SyncResult<Vec<SerialTransaction>> {
        let reply = self
            .inner
            .session
            .request_reply(Message::transaction_request(ids), self.inner.request_timeout())
            .await?;
        match reply.body {
            MessageBody::TransactionReply { transactions } => Ok(transactions),
            other => Err(SyncError::Protocol(format!(
                "expected transaction-reply, got {}",
                other.msg_type()
            ))),
        }
    }

    /// Fetches the server's transactions by serial.
    pub async fn fetch_serials(&self, serials: Vec<u64>) -> SyncResult<Vec<SerialTransaction>> {
        let reply = self
            .inner
            .session
            .request_reply(Message::serial_request(serials), self.inner.request_timeout())
            .await?;
        match reply.body {
            MessageBody::SerialReply { transactions } => Ok(transactions),
            other => Err(SyncError::Protocol(format!(
                "expected serial-reply, got {}",
                other.msg_type()
            ))),
        }
    }

    /// Waits until every local transaction has been acknowledged.
    pub async fn flush(&self) -> SyncResult<()> {
        let mut progress = self.inner.progress.subscribe();
        let reached = *progress
            .wait_for(|p| p.outstanding == 0 || p.fatal)
            .await
            .map_err(|_| SyncError::ChannelClosed)?;
        if reached.fatal {
            self.inner.check_fatal()?;
        }
        Ok(())
    }

    pub fn server_serial(&self) -> u64 {
        self.inner.sync.lock().unwrap().serials.server_serial()
    }

    pub fn our_serial(&self) -> u64 {
        self.inner.sync.lock().unwrap().serials.our_serial()
    }

    /// Transactions broadcast but not yet acknowledged.
    pub fn pending_count(&self) -> usize {
        self.inner.sync.lock().unwrap().pending.len()
    }

    /// Ids of the transactions awaiting acknowledgment, by local serial.
    pub fn pending_ids(&self) -> Vec<TransactionId> {
        let sync = self.inner.sync.lock().unwrap();
        let mut pending: Vec<&SerialTransaction> = sync.pending.values().collect();
        pending.sort_by_key(|t| t.serial);
        pending.into_iter().map(SerialTransaction::id).collect()
    }

    /// The error that stopped sync, if any.
    pub fn fatal_error(&self) -> Option<String> {
        self.inner.sync.lock().unwrap().fatal.clone()
    }

    /// Subscribes to lifecycle and progress events.
    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.inner.events.subscribe()
    }

    /// Stops syncing and closes the session. The store stays usable
    /// locally.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.listeners.lock().unwrap().clear();
        self.inner.stop_tasks();
        self.inner.session.close();
        info!(store_id = %self.store.store_id(), "sync manager closed");
    }
}

impl std::fmt::Debug for SyncManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncManager")
            .field("store_id", &self.store.store_id())
            .field("session", &self.inner.session)
            .finish_non_exhaustive()
    }
}
