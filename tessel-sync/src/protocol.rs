//! Wire messages exchanged with the datastore server.
//!
//! Every frame is a JSON object `{msgId, msgType, content}`; replies also
//! carry `parentId`, the `msgId` of the request they answer. The set of
//! message types is closed: anything else is rejected at decode time.

use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tessel_types::{MessageId, SerialTransaction, StoreId, TransactionId};

const MSG_ID: &str = "msgId";
const PARENT_ID: &str = "parentId";

/// Read/write access the server grants this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    pub read: bool,
    pub write: bool,
}

/// A server-side snapshot of the store at a given serial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    /// The last serial folded into `state`.
    pub serial: u64,
    /// A `Datastore::snapshot` document.
    pub state: Value,
}

/// The typed content of a message, tagged by `msgType`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msgType", content = "content")]
pub enum MessageBody {
    #[serde(rename = "storeid-request")]
    StoreIdRequest {},

    #[serde(rename = "storeid-reply", rename_all = "camelCase")]
    StoreIdReply { store_id: StoreId },

    #[serde(rename = "permissions-request")]
    PermissionsRequest {},

    #[serde(rename = "permissions-reply")]
    PermissionsReply(Permissions),

    /// Sent by clients with locally serialled transactions, and by the
    /// server with transactions other clients committed.
    #[serde(rename = "transaction-broadcast")]
    TransactionBroadcast { transactions: Vec<SerialTransaction> },

    /// Server serials assigned to a broadcast, pairwise with the ids.
    #[serde(rename = "transaction-ack", rename_all = "camelCase")]
    TransactionAck {
        transaction_ids: Vec<TransactionId>,
        serials: Vec<u64>,
    },

    #[serde(rename = "history-request", rename_all = "camelCase")]
    HistoryRequest {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        checkpoint_id: Option<String>,
    },

    #[serde(rename = "history-reply")]
    HistoryReply {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        checkpoint: Option<Checkpoint>,
        #[serde(default)]
        transactions: Vec<SerialTransaction>,
    },

    #[serde(rename = "transaction-request", rename_all = "camelCase")]
    TransactionRequest { transaction_ids: Vec<TransactionId> },

    #[serde(rename = "transaction-reply")]
    TransactionReply { transactions: Vec<SerialTransaction> },

    #[serde(rename = "serial-request")]
    SerialRequest { serials: Vec<u64> },

    #[serde(rename = "serial-reply")]
    SerialReply { transactions: Vec<SerialTransaction> },

    /// Client heartbeat reporting the last server serial it applied.
    #[serde(rename = "serial-update")]
    SerialUpdate { serial: u64 },

    /// Every connected client has applied history up to `serial`.
    #[serde(rename = "state-stable")]
    StateStable { serial: u64 },

    #[serde(rename = "error-reply")]
    ErrorReply { reason: String },
}

impl MessageBody {
    /// The wire `msgType` of this body.
    #[must_use]
    pub fn msg_type(&self) -> &'static str {
        match self {
            Self::StoreIdRequest {} => "storeid-request",
            Self::StoreIdReply { .. } => "storeid-reply",
            Self::PermissionsRequest {} => "permissions-request",
            Self::PermissionsReply(_) => "permissions-reply",
            Self::TransactionBroadcast { .. } => "transaction-broadcast",
            Self::TransactionAck { .. } => "transaction-ack",
            Self::HistoryRequest { .. } => "history-request",
            Self::HistoryReply { .. } => "history-reply",
            Self::TransactionRequest { .. } => "transaction-request",
            Self::TransactionReply { .. } => "transaction-reply",
            Self::SerialRequest { .. } => "serial-request",
            Self::SerialReply { .. } => "serial-reply",
            Self::SerialUpdate { .. } => "serial-update",
            Self::StateStable { .. } => "state-stable",
            Self::ErrorReply { .. } => "error-reply",
        }
    }
}

/// One protocol frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub msg_id: MessageId,
    /// Present exactly when this message is a reply.
    pub parent_id: Option<MessageId>,
    pub body: MessageBody,
}

impl Message {
    /// Creates a message with a fresh id.
    #[must_use]
    pub fn new(body: MessageBody) -> Self {
        Self {
            msg_id: MessageId::new(),
            parent_id: None,
            body,
        }
    }

    /// Creates a reply to `parent`.
    #[must_use]
    pub fn reply_to(parent: &Message, body: MessageBody) -> Self {
        Self {
            msg_id: MessageId::new(),
            parent_id: Some(parent.msg_id),
            body,
        }
    }

    pub fn storeid_request() -> Self {
        Self::new(MessageBody::StoreIdRequest {})
    }

    pub fn permissions_request() -> Self {
        Self::new(MessageBody::PermissionsRequest {})
    }

    pub fn transaction_broadcast(transactions: Vec<SerialTransaction>) -> Self {
        Self::new(MessageBody::TransactionBroadcast { transactions })
    }

    pub fn history_request(checkpoint_id: Option<String>) -> Self {
        Self::new(MessageBody::HistoryRequest { checkpoint_id })
    }

    pub fn transaction_request(transaction_ids: Vec<TransactionId>) -> Self {
        Self::new(MessageBody::TransactionRequest { transaction_ids })
    }

    pub fn serial_request(serials: Vec<u64>) -> Self {
        Self::new(MessageBody::SerialRequest { serials })
    }

    pub fn serial_update(serial: u64) -> Self {
        Self::new(MessageBody::SerialUpdate { serial })
    }

    pub fn state_stable(serial: u64) -> Self {
        Self::new(MessageBody::StateStable { serial })
    }

    /// Whether this message answers a request.
    #[must_use]
    pub fn is_reply(&self) -> bool {
        self.parent_id.is_some()
    }

    #[must_use]
    pub fn msg_type(&self) -> &'static str {
        self.body.msg_type()
    }

    /// Encodes the message as a JSON text frame.
    pub fn encode(&self) -> SyncResult<String> {
        let mut value = serde_json::to_value(&self.body)?;
        let Value::Object(object) = &mut value else {
            return Err(SyncError::Protocol("message body is not an object".into()));
        };
        object.insert(MSG_ID.into(), serde_json::to_value(self.msg_id)?);
        if let Some(parent) = self.parent_id {
            object.insert(PARENT_ID.into(), serde_json::to_value(parent)?);
        }
        Ok(serde_json::to_string(&value)?)
    }

    /// Decodes and validates a JSON text frame.
    ///
    /// Malformed JSON, a missing envelope field, an unknown `msgType` or
    /// content that does not match its type are all protocol errors.
    pub fn decode(frame: &str) -> SyncResult<Self> {
        let value: Value = serde_json::from_str(frame)
            .map_err(|e| SyncError::Protocol(format!("malformed frame: {e}")))?;
        let Value::Object(mut object) = value else {
            return Err(SyncError::Protocol("frame is not a JSON object".into()));
        };

        let msg_id = object
            .remove(MSG_ID)
            .ok_or_else(|| SyncError::Protocol("missing msgId".into()))?;
        let msg_id: MessageId = serde_json::from_value(msg_id)
            .map_err(|e| SyncError::Protocol(format!("invalid msgId: {e}")))?;
        let parent_id = match object.remove(PARENT_ID) {
            None | Some(Value::Null) => None,
            Some(parent) => Some(
                serde_json::from_value(parent)
                    .map_err(|e| SyncError::Protocol(format!("invalid parentId: {e}")))?,
            ),
        };

        let msg_type = object
            .get("msgType")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| SyncError::Protocol("missing msgType".into()))?;
        let body: MessageBody = serde_json::from_value(Value::Object(object))
            .map_err(|e| SyncError::Protocol(format!("invalid {msg_type} message: {e}")))?;

        Ok(Self {
            msg_id,
            parent_id,
            body,
        })
    }
}
