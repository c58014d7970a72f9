//! Wires a set of [`crate::node::Node`] actors together and exposes a
//! single client-facing entry point the HTTP front door (and the
//! in-process simulation harness) use to drive the quorum protocol:
//! allocate a transaction id, pick a random live node, wait for its
//! response, retry on timeout.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, oneshot, Mutex};
use transdb_common::{Message, MessageKind, NodeId, Result, TransDbError, Txid};

/// Sentinel source id the cluster uses for messages it originates on a
/// client's behalf (distinguishing them from inter-node traffic).
pub const CLIENT_SRC: NodeId = NodeId::MAX;

struct PendingMap {
    entries: HashMap<Txid, oneshot::Sender<Message>>,
}

/// Handle to a running cluster of nodes. Cheap to clone; every clone
/// shares the same node inboxes and pending-response table.
#[derive(Clone)]
pub struct ClusterHandle {
    node_inboxes: Arc<Vec<mpsc::Sender<Message>>>,
    next_txid: Arc<AtomicU64>,
    pending: Arc<Mutex<PendingMap>>,
    num_attempts: u32,
    per_attempt_timeout: Duration,
}

impl ClusterHandle {
    /// `per_attempt_timeout` should be at least as long as a node's own
    /// coordinator-write deadline (`lock_timeout * 3`, see `Node`), or a
    /// slow-but-healthy write gets retried out from under itself before the
    /// node that's actually processing it can finish.
    pub fn new(
        node_inboxes: Vec<mpsc::Sender<Message>>,
        client_responses: mpsc::Receiver<Message>,
        num_attempts: u32,
        per_attempt_timeout: Duration,
    ) -> Self {
        let pending = Arc::new(Mutex::new(PendingMap { entries: HashMap::new() }));
        let handle = ClusterHandle {
            node_inboxes: Arc::new(node_inboxes),
            next_txid: Arc::new(AtomicU64::new(1)),
            pending,
            num_attempts: num_attempts.max(1),
            per_attempt_timeout,
        };
        handle.clone().spawn_response_router(client_responses);
        handle
    }

    fn spawn_response_router(self, mut client_responses: mpsc::Receiver<Message>) {
        tokio::spawn(async move {
            while let Some(msg) = client_responses.recv().await {
                let mut pending = self.pending.lock().await;
                if let Some(sender) = pending.entries.remove(&(msg.txid as Txid)) {
                    let _ = sender.send(msg);
                }
            }
        });
    }

    pub fn num_nodes(&self) -> usize {
        self.node_inboxes.len()
    }

    fn random_node(&self) -> NodeId {
        rand::thread_rng().gen_range(0..self.node_inboxes.len() as u32)
    }

    /// Sends `request` to a random node, retrying up to `num_attempts`
    /// times on timeout, transport failure, or (per spec §4.7/§7) a
    /// transient `Ok=false` error response. A `ClientStrongWriteRequest`
    /// is the one exception: its `Ok=false` means the expected timestamp
    /// was stale, which a retry against the same expectation can never
    /// fix, so that response is returned to the caller immediately.
    async fn send_with_retry(&self, mut request: Message) -> Result<Message> {
        let retry_on_reject = request.kind != MessageKind::ClientStrongWriteRequest;
        let mut last_err = TransDbError::Timeout;
        let mut last_rejection: Option<Message> = None;
        for _ in 0..self.num_attempts {
            let dest = self.random_node();
            request.dest = dest;

            let (tx, rx) = oneshot::channel();
            {
                let mut pending = self.pending.lock().await;
                pending.entries.insert(request.txid, tx);
            }

            if self.node_inboxes[dest as usize].send(request.clone()).await.is_err() {
                self.pending.lock().await.entries.remove(&request.txid);
                last_err = TransDbError::NetworkError(format!("node {} unreachable", dest));
                continue;
            }

            match tokio::time::timeout(self.per_attempt_timeout, rx).await {
                Ok(Ok(response)) => {
                    if response.ok == Some(true) || !retry_on_reject {
                        return Ok(response);
                    }
                    last_rejection = Some(response);
                }
                Ok(Err(_)) => {
                    last_err = TransDbError::NetworkError("response channel closed".into());
                }
                Err(_) => {
                    self.pending.lock().await.entries.remove(&request.txid);
                    last_err = TransDbError::Timeout;
                }
            }
        }
        if let Some(response) = last_rejection {
            return Ok(response);
        }
        Err(last_err)
    }

    fn new_txid(&self) -> Txid {
        self.next_txid.fetch_add(1, Ordering::Relaxed) as Txid
    }

    pub async fn get(&self, key: &str) -> Result<(Option<Vec<u8>>, u64)> {
        let txid = self.new_txid();
        let request = Message::new(0, CLIENT_SRC, 0, txid, MessageKind::ClientReadRequest, key);
        let response = self.send_with_retry(request).await?;
        if response.ok != Some(true) {
            return Err(TransDbError::KeyNotFound(key.to_string()));
        }
        let timestamp = response.timestamp.unwrap_or(0);
        let value = response.value.filter(|v| !v.is_empty() || timestamp > 0);
        Ok((value, timestamp))
    }

    pub async fn put(&self, key: &str, value: Vec<u8>, idempotency_key: Option<String>) -> Result<u64> {
        let txid = self.new_txid();
        let mut request = Message::new(0, CLIENT_SRC, 0, txid, MessageKind::ClientWriteRequest, key).with_value(value);
        if let Some(k) = idempotency_key {
            request = request.with_idempotency_key(k);
        }
        let response = self.send_with_retry(request).await?;
        if response.ok != Some(true) {
            return Err(TransDbError::NetworkError("write rejected".into()));
        }
        Ok(response.timestamp.unwrap_or(0))
    }

    pub async fn strong_put(&self, key: &str, value: Vec<u8>, expected_timestamp: u64) -> Result<u64> {
        let txid = self.new_txid();
        let request = Message::new(0, CLIENT_SRC, 0, txid, MessageKind::ClientStrongWriteRequest, key)
            .with_value(value)
            .with_timestamp(expected_timestamp);
        let response = self.send_with_retry(request).await?;
        let actual = response.timestamp.unwrap_or(0);
        if response.ok != Some(true) {
            return Err(TransDbError::StaleWrite { expected: expected_timestamp, actual });
        }
        Ok(actual)
    }
}
