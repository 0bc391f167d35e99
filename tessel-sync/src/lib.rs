//! Server sync core for Tessel.
//!
//! Keeps a local [`Datastore`](tessel_store::Datastore) consistent with a
//! central datastore server that assigns every accepted transaction a
//! strictly increasing serial.
//!
//! ## Components
//!
//! - **Protocol**: JSON messages exchanged with the server
//! - **Transport**: text-frame connections (WebSocket, in-memory mock)
//! - **Session**: one connection plus request/reply correlation
//! - **Serial**: serial ordering checks and the idle heartbeat
//! - **Manager**: bring-up, broadcasting, reconciliation and reconnects
//!
//! ## Sync Process
//!
//! 1. **Connect**: open the session to `{service_url}/{collaboration}`
//! 2. **Identify**: acquire a store id (once per manager)
//! 3. **Replay**: apply the server's history, optionally from a checkpoint
//! 4. **Broadcast**: send local transactions; acks assign server serials
//! 5. **Apply**: apply remote transactions strictly in serial order
//!
//! Any serial gap is fatal: the manager stops and reports the error rather
//! than letting the replica diverge silently.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tessel_store::Schema;
//! use tessel_sync::{SyncConfig, SyncManager, WebSocketConnector};
//!
//! # async fn run() -> tessel_sync::SyncResult<()> {
//! let config = SyncConfig {
//!     service_url: "wss://example.com/api/datastore".into(),
//!     collaboration_id: Some("notebook-1".into()),
//!     schemas: vec![Schema::new("cells").text("source")],
//!     ..Default::default()
//! };
//! let manager = SyncManager::connect(config, Arc::new(WebSocketConnector)).await?;
//! println!("joined as store {}", manager.store_id());
//! # Ok(())
//! # }
//! ```

mod error;
mod manager;
pub mod protocol;
pub mod serial;
pub mod session;
pub mod transport;

pub use error::{SyncError, SyncResult};
pub use manager::{ManagerEvent, SyncConfig, SyncManager};
pub use protocol::{Checkpoint, Message, MessageBody, Permissions};
pub use serial::{IdleTimer, SerialReconciler};
pub use session::{ConnectionState, MessageHandler, Session, SessionConfig};
pub use transport::{Connection, Connector, WebSocketConnector};
