//! The client session: one server connection plus request correlation.
//!
//! Outgoing requests register a one-shot delegate keyed by their `msgId`.
//! A reader task processes incoming frames strictly in arrival order:
//! replies go to the [`MessageHandler::on_reply`] hook and then settle their
//! delegate; everything else goes to [`MessageHandler::on_notice`].

use crate::error::{SyncError, SyncResult};
use crate::protocol::{Message, MessageBody};
use crate::transport::{Connection, Connector};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tessel_types::{MessageId, StoreId};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Where and as whom to connect.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Base URL of the datastore service, e.g. `wss://host/api/datastore`.
    pub service_url: String,
    /// Path segment naming the shared collaboration.
    pub collaboration_id: Option<String>,
    /// Auth token passed as the `token` query parameter.
    pub token: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            service_url: "ws://localhost:8888/api/datastore".into(),
            collaboration_id: None,
            token: None,
        }
    }
}

/// Connection lifecycle as published by [`Session::watch_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// [`Session::close`] was called.
    Closed,
}

/// Receives incoming messages from the reader task.
///
/// Hooks run on the reader task in frame order; they must not block.
pub trait MessageHandler: Send + Sync {
    /// Called for every reply before its delegate is settled. Returning an
    /// error rejects the delegate with that error instead.
    fn on_reply(&self, _message: &Message) -> SyncResult<()> {
        Ok(())
    }

    /// Called for every message that is not a reply.
    fn on_notice(&self, message: Message);

    /// Called once when an established connection ends.
    fn on_disconnect(&self) {}
}

type Delegate = oneshot::Sender<SyncResult<Message>>;

/// Outstanding requests by message id. Each entry settles at most once.
#[derive(Default)]
struct PendingRequests {
    delegates: HashMap<MessageId, Delegate>,
}

impl PendingRequests {
    fn register(&mut self, id: MessageId) -> oneshot::Receiver<SyncResult<Message>> {
        let (tx, rx) = oneshot::channel();
        self.delegates.insert(id, tx);
        rx
    }

    fn settle(&mut self, id: &MessageId, result: SyncResult<Message>) -> bool {
        match self.delegates.remove(id) {
            Some(delegate) => {
                let _ = delegate.send(result);
                true
            }
            None => false,
        }
    }

    fn remove(&mut self, id: &MessageId) {
        self.delegates.remove(id);
    }

    fn reject_all(&mut self) -> usize {
        let n = self.delegates.len();
        for (_, delegate) in self.delegates.drain() {
            let _ = delegate.send(Err(SyncError::ConnectionClosed));
        }
        n
    }
}

struct SessionInner {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    store_id: Mutex<Option<StoreId>>,
    outgoing: Mutex<Option<mpsc::UnboundedSender<String>>>,
    pending: Mutex<PendingRequests>,
    handler: Mutex<Option<Weak<dyn MessageHandler>>>,
    state: watch::Sender<ConnectionState>,
    reader: Mutex<Option<JoinHandle<()>>>,
    /// Bumped per connection so a stale reader cannot tear down a newer one.
    generation: AtomicU64,
}

impl SessionInner {
    fn handler(&self) -> Option<Arc<dyn MessageHandler>> {
        self.handler.lock().unwrap().as_ref().and_then(Weak::upgrade)
    }

    fn dispatch(&self, frame: &str) {
        let message = match Message::decode(frame) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "dropping malformed message");
                return;
            }
        };
        trace!(msg_type = message.msg_type(), msg_id = %message.msg_id, "received");
        let handler = self.handler();

        let Some(parent) = message.parent_id else {
            match handler {
                Some(handler) => handler.on_notice(message),
                None => debug!(msg_type = message.msg_type(), "no handler for notice"),
            }
            return;
        };

        let hooked = match &handler {
            Some(handler) => handler.on_reply(&message),
            None => Ok(()),
        };
        let result = hooked.and_then(|()| match message.body {
            MessageBody::ErrorReply { reason } => Err(SyncError::Remote(reason)),
            _ => Ok(message),
        });
        if !self.pending.lock().unwrap().settle(&parent, result) {
            debug!(%parent, "dropping reply with no pending request");
        }
    }

    /// Tears down the current connection, rejecting outstanding requests.
    fn shutdown(&self) -> usize {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.outgoing.lock().unwrap().take();
        if let Some(reader) = self.reader.lock().unwrap().take() {
            reader.abort();
        }
        self.pending.lock().unwrap().reject_all()
    }

    fn connection_lost(&self, generation: u64) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        self.outgoing.lock().unwrap().take();
        self.reader.lock().unwrap().take();
        let rejected = self.pending.lock().unwrap().reject_all();
        warn!(rejected, "connection lost");
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Closed {
                return false;
            }
            *state = ConnectionState::Disconnected;
            true
        });
        if let Some(handler) = self.handler() {
            handler.on_disconnect();
        }
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get_mut().unwrap().take() {
            reader.abort();
        }
    }
}

async fn read_loop(inner: Weak<SessionInner>, mut incoming: mpsc::UnboundedReceiver<String>, generation: u64) {
    while let Some(frame) = incoming.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.dispatch(&frame);
    }
    if let Some(inner) = inner.upgrade() {
        inner.connection_lost(generation);
    }
}

/// A handle to the server session. Clones share the connection.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Creates a disconnected session.
    pub fn new(config: SessionConfig, connector: Arc<dyn Connector>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(SessionInner {
                config,
                connector,
                store_id: Mutex::new(None),
                outgoing: Mutex::new(None),
                pending: Mutex::new(PendingRequests::default()),
                handler: Mutex::new(None),
                state,
                reader: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Installs the receiver of replies and notices.
    pub fn set_handler(&self, handler: Weak<dyn MessageHandler>) {
        *self.inner.handler.lock().unwrap() = Some(handler);
    }

    /// Records the store id; later connection URLs carry it.
    pub fn set_store_id(&self, store_id: StoreId) {
        *self.inner.store_id.lock().unwrap() = Some(store_id);
    }

    /// The address the next connection will use.
    pub fn url(&self) -> String {
        let config = &self.inner.config;
        let mut url = config.service_url.trim_end_matches('/').to_owned();
        if let Some(collaboration) = &config.collaboration_id {
            url.push('/');
            url.push_str(&urlencoding::encode(collaboration));
        }
        let mut query = Vec::new();
        if let Some(token) = &config.token {
            query.push(format!("token={}", urlencoding::encode(token)));
        }
        if let Some(store_id) = *self.inner.store_id.lock().unwrap() {
            query.push(format!("storeId={store_id}"));
        }
        if !query.is_empty() {
            url.push('?');
            url.push_str(&query.join("&"));
        }
        url
    }

    /// Opens a connection, replacing any existing one.
    pub async fn connect(&self) -> SyncResult<()> {
        let rejected = self.inner.shutdown();
        if rejected > 0 {
            debug!(rejected, "rejected requests of the replaced connection");
        }
        self.inner.state.send_replace(ConnectionState::Connecting);

        let url = self.url();
        let Connection { outgoing, incoming } = match self.inner.connector.connect(&url).await {
            Ok(connection) => connection,
            Err(e) => {
                self.inner.state.send_replace(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        let generation = self.inner.generation.load(Ordering::SeqCst);
        *self.inner.outgoing.lock().unwrap() = Some(outgoing);
        let reader = tokio::spawn(read_loop(Arc::downgrade(&self.inner), incoming, generation));
        *self.inner.reader.lock().unwrap() = Some(reader);
        self.inner.state.send_replace(ConnectionState::Connected);
        info!(%url, "connected");
        Ok(())
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Subscribes to connection state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Waits until the session is connected.
    pub async fn ready(&self) -> SyncResult<()> {
        let mut state = self.inner.state.subscribe();
        let reached = state
            .wait_for(|s| matches!(s, ConnectionState::Connected | ConnectionState::Closed))
            .await
            .map_err(|_| SyncError::ChannelClosed)?;
        match *reached {
            ConnectionState::Connected => Ok(()),
            _ => Err(SyncError::ConnectionClosed),
        }
    }

    /// Sends a message without waiting for a reply.
    pub fn send(&self, message: &Message) -> SyncResult<()> {
        let frame = message.encode()?;
        let outgoing = self.inner.outgoing.lock().unwrap();
        let tx = outgoing.as_ref().ok_or(SyncError::NotConnected)?;
        tx.send(frame).map_err(|_| SyncError::NotConnected)?;
        trace!(msg_type = message.msg_type(), msg_id = %message.msg_id, "sent");
        Ok(())
    }

    /// Sends a request and waits for its reply.
    ///
    /// An `error-reply` rejects with [`SyncError::Remote`]; a lost connection
    /// with [`SyncError::ConnectionClosed`]; expiry with
    /// [`SyncError::Timeout`]. A zero timeout waits indefinitely.
    pub async fn request_reply(&self, message: Message, timeout: Duration) -> SyncResult<Message> {
        let id = message.msg_id;
        let rx = self.inner.pending.lock().unwrap().register(id);
        if let Err(e) = self.send(&message) {
            self.inner.pending.lock().unwrap().remove(&id);
            return Err(e);
        }

        let outcome = if timeout.is_zero() {
            rx.await
        } else {
            match tokio::time::timeout(timeout, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.inner.pending.lock().unwrap().remove(&id);
                    warn!(msg_type = message.msg_type(), %id, "request timed out");
                    return Err(SyncError::Timeout);
                }
            }
        };
        outcome.unwrap_or(Err(SyncError::ConnectionClosed))
    }

    /// Number of requests still awaiting a reply.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.lock().unwrap().delegates.len()
    }

    /// Closes the connection and rejects outstanding requests.
    pub fn close(&self) {
        self.inner.state.send_replace(ConnectionState::Closed);
        let rejected = self.inner.shutdown();
        info!(rejected, "session closed");
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("url", &self.url())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
