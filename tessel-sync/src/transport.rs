//! Transport layer abstraction.
//!
//! A [`Connector`] opens a [`Connection`]: a pair of text-frame channels to
//! the server. The session layer owns framing and correlation; connectors
//! only move strings. [`WebSocketConnector`] bridges a WebSocket through a
//! writer task and a reader task; [`mock`] provides an in-memory server end
//! for tests.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as Frame;
use tracing::{debug, warn};

/// An open connection: outgoing and incoming text frames.
///
/// Dropping `outgoing` closes the connection; `incoming` yields `None` once
/// the server side has gone away.
#[derive(Debug)]
pub struct Connection {
    pub outgoing: mpsc::UnboundedSender<String>,
    pub incoming: mpsc::UnboundedReceiver<String>,
}

/// Opens connections to the datastore server.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connects to `url`.
    async fn connect(&self, url: &str) -> SyncResult<Connection>;
}

/// Connects over WebSocket text frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> SyncResult<Connection> {
        let (stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| SyncError::Network(e.to_string()))?;
        let (mut sink, mut stream) = stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

        // Writer: forward outgoing frames until the session drops its sender.
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = sink.send(Frame::text(text)).await {
                    warn!(error = %e, "websocket write failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // Reader: forward text frames until the socket closes.
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Frame::Text(text)) => {
                        if in_tx.send(text.as_str().to_owned()).is_err() {
                            break;
                        }
                    }
                    Ok(Frame::Close(reason)) => {
                        debug!(?reason, "websocket closed by server");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "websocket read failed");
                        break;
                    }
                }
            }
        });

        Ok(Connection {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}

/// An in-memory transport for testing.
pub mod mock {
    use super::*;
    use crate::protocol::{Message, MessageBody};
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Default)]
    struct MockState {
        urls: Vec<String>,
        refuse: bool,
    }

    /// Hands each connection's server end to a [`MockServer`].
    #[derive(Debug, Clone)]
    pub struct MockConnector {
        state: Arc<Mutex<MockState>>,
        peers: mpsc::UnboundedSender<MockPeer>,
    }

    impl MockConnector {
        /// Creates a connector and the server that accepts its connections.
        pub fn new() -> (Self, MockServer) {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                Self {
                    state: Arc::new(Mutex::new(MockState::default())),
                    peers: tx,
                },
                MockServer { peers: rx },
            )
        }

        /// Makes subsequent connection attempts fail (or succeed again).
        pub fn set_refuse(&self, refuse: bool) {
            self.state.lock().unwrap().refuse = refuse;
        }

        /// Every URL a connection was attempted on, in order.
        pub fn urls(&self) -> Vec<String> {
            self.state.lock().unwrap().urls.clone()
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn connect(&self, url: &str) -> SyncResult<Connection> {
            {
                let mut state = self.state.lock().unwrap();
                state.urls.push(url.to_owned());
                if state.refuse {
                    return Err(SyncError::Network("connection refused".into()));
                }
            }
            let (client_tx, server_rx) = mpsc::unbounded_channel();
            let (server_tx, client_rx) = mpsc::unbounded_channel();
            self.peers
                .send(MockPeer {
                    url: url.to_owned(),
                    to_client: Some(server_tx),
                    from_client: server_rx,
                })
                .map_err(|_| SyncError::Network("mock server is gone".into()))?;
            Ok(Connection {
                outgoing: client_tx,
                incoming: client_rx,
            })
        }
    }

    /// Accepts connections opened through a [`MockConnector`].
    #[derive(Debug)]
    pub struct MockServer {
        peers: mpsc::UnboundedReceiver<MockPeer>,
    }

    impl MockServer {
        /// Waits for the next connection.
        pub async fn accept(&mut self) -> Option<MockPeer> {
            self.peers.recv().await
        }
    }

    /// The server end of one mock connection.
    #[derive(Debug)]
    pub struct MockPeer {
        url: String,
        to_client: Option<mpsc::UnboundedSender<String>>,
        from_client: mpsc::UnboundedReceiver<String>,
    }

    impl MockPeer {
        /// The URL the client connected to.
        pub fn url(&self) -> &str {
            &self.url
        }

        /// Receives the next raw frame from the client.
        pub async fn recv_raw(&mut self) -> Option<String> {
            self.from_client.recv().await
        }

        /// Receives and decodes the next message from the client.
        /// Frames that fail to decode are skipped.
        pub async fn recv(&mut self) -> Option<Message> {
            loop {
                let frame = self.from_client.recv().await?;
                match Message::decode(&frame) {
                    Ok(message) => return Some(message),
                    Err(e) => warn!(error = %e, "mock server skipping undecodable frame"),
                }
            }
        }

        /// Returns a frame that is already waiting, without blocking.
        pub fn try_recv(&mut self) -> Option<Message> {
            let frame = self.from_client.try_recv().ok()?;
            Message::decode(&frame).ok()
        }

        /// Sends a raw frame to the client.
        pub fn send_raw(&self, frame: impl Into<String>) -> SyncResult<()> {
            self.to_client
                .as_ref()
                .ok_or(SyncError::ConnectionClosed)?
                .send(frame.into())
                .map_err(|_| SyncError::ConnectionClosed)
        }

        /// Sends a message to the client.
        pub fn send(&self, message: &Message) -> SyncResult<()> {
            self.send_raw(message.encode()?)
        }

        /// Answers `request` with `body`.
        pub fn reply(&self, request: &Message, body: MessageBody) -> SyncResult<()> {
            self.send(&Message::reply_to(request, body))
        }

        /// Drops the server end, ending the client's incoming stream.
        pub fn disconnect(&mut self) {
            self.to_client = None;
        }
    }
}
