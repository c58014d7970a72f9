use serde::{Deserialize, Serialize};

/// Identifies a node within a cluster. Nodes are numbered `0..num_peers`.
pub type NodeId = u32;

/// Identifies a coordinated transaction. `-1` is used as a sentinel for
/// "not part of a transaction" (e.g. a bare client request before a
/// coordinator has assigned it one).
pub type Txid = i64;

/// Sentinel `Txid` meaning "no transaction assigned yet".
pub const NO_TXID: Txid = -1;

/// The kind of a message passed between a client, a coordinator node and
/// the participants of a transaction.
///
/// Mirrors the message vocabulary a quorum-replicated key/value store
/// needs: client-facing read/write requests and responses, and the
/// lock/get/put/timestamp/unlock exchange a coordinator runs against its
/// quorum. The election and background-propagation kinds ride the same
/// channel so a single node loop can multiplex all traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    ClientReadRequest,
    ClientWriteRequest,
    ClientStrongWriteRequest,
    ClientReadResponse,
    ClientWriteResponse,

    NodeLockRequest,
    NodeLockRequestNoTimeout,
    NodeLockResponse,
    NodeUnlockRequest,
    NodeUnlockAck,
    NodeGetRequest,
    NodeGetResponse,
    NodePutRequest,
    NodePutResponse,
    NodeTimestampRequest,

    NodeBackgroundWriteRequest,
    NodeBackgroundWriteResponse,

    InternalTimerSignal,
    InternalHeartbeat,
    InternalLeaderQuery,

    ElectionElect,
    ElectionCoordinator,
    ElectionAck,

    ControlFail,
    ControlRecover,
}

/// A single message exchanged between nodes, or between a client and a
/// node. Every handler in the node state machine pattern-matches on
/// `kind` and reads whichever of `key`/`value`/`timestamp`/`ok` that kind
/// defines; the rest are left at their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: u64,
    pub src: NodeId,
    pub dest: NodeId,
    pub txid: Txid,
    pub kind: MessageKind,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl Message {
    /// Builds a message with only the fields every kind needs set;
    /// callers fill in `value`/`timestamp`/`ok`/`idempotency_key` as
    /// their kind requires.
    pub fn new(id: u64, src: NodeId, dest: NodeId, txid: Txid, kind: MessageKind, key: impl Into<String>) -> Self {
        Message {
            id,
            src,
            dest,
            txid,
            kind,
            key: key.into(),
            value: None,
            timestamp: None,
            ok: None,
            idempotency_key: None,
        }
    }

    pub fn with_value(mut self, value: Vec<u8>) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_ok(mut self, ok: bool) -> Self {
        self.ok = Some(ok);
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let msg = Message::new(1, 0, 1, 42, MessageKind::NodeLockRequest, "foo").with_ok(true);
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn optional_fields_are_omitted_when_absent() {
        let msg = Message::new(1, 0, 1, NO_TXID, MessageKind::NodeUnlockAck, "foo");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("value"));
        assert!(!json.contains("timestamp"));
    }
}
