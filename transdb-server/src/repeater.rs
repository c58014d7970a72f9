//! Per-node retry engine: keeps resending a request to its destination
//! until the expected acknowledgement arrives, the retry budget is spent,
//! or the repeater has been told the node has failed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use transdb_common::{Message, MessageKind, NodeId, Txid};

/// Maps a request kind to the kind of message that acknowledges it.
/// `None` means the repeater never expects an ack for that kind — it is
/// not sent through `Repeater::send`.
fn expected_ack(kind: MessageKind) -> Option<MessageKind> {
    use MessageKind::*;
    match kind {
        NodeLockRequest | NodeLockRequestNoTimeout => Some(NodeLockResponse),
        NodeUnlockRequest => Some(NodeUnlockAck),
        NodeGetRequest | NodeTimestampRequest => Some(NodeGetResponse),
        NodePutRequest => Some(NodePutResponse),
        NodeBackgroundWriteRequest => Some(NodeBackgroundWriteResponse),
        _ => None,
    }
}

type UnackedKey = (NodeId, Txid, MessageKind);

struct Inner {
    unacked: HashMap<UnackedKey, ()>,
}

/// Retransmits requests until acknowledged. One instance per node.
pub struct Repeater {
    outgoing: mpsc::Sender<Message>,
    timeout: Duration,
    num_retries: u32,
    disabled: Arc<AtomicBool>,
    inner: Arc<Mutex<Inner>>,
}

impl Repeater {
    pub fn new(outgoing: mpsc::Sender<Message>, timeout: Duration, num_retries: u32) -> Self {
        Repeater {
            outgoing,
            timeout,
            num_retries,
            disabled: Arc::new(AtomicBool::new(false)),
            inner: Arc::new(Mutex::new(Inner { unacked: HashMap::new() })),
        }
    }

    /// Sends `msg` and, if its kind expects an ack, spawns a retry task
    /// that resends it every `timeout` until acked, the disabled flag is
    /// set, or (unless `unlimited`) `num_retries` resends are spent.
    pub fn send(&self, msg: Message, unlimited: bool) {
        let Some(ack_kind) = expected_ack(msg.kind) else {
            let outgoing = self.outgoing.clone();
            tokio::spawn(async move {
                let _ = outgoing.send(msg).await;
            });
            return;
        };

        let key: UnackedKey = (msg.dest, msg.txid, ack_kind);
        let inner = self.inner.clone();
        let outgoing = self.outgoing.clone();
        let disabled = self.disabled.clone();
        let timeout = self.timeout;
        let num_retries = self.num_retries;

        tokio::spawn(async move {
            inner.lock().await.unacked.insert(key, ());

            let mut attempts_left = num_retries;
            loop {
                if outgoing.send(msg.clone()).await.is_err() {
                    return;
                }
                tokio::time::sleep(timeout).await;

                if disabled.load(Ordering::SeqCst) {
                    inner.lock().await.unacked.remove(&key);
                    return;
                }
                if !inner.lock().await.unacked.contains_key(&key) {
                    // Acked while we slept.
                    return;
                }
                if !unlimited {
                    if attempts_left == 0 {
                        inner.lock().await.unacked.remove(&key);
                        return;
                    }
                    attempts_left -= 1;
                }
            }
        });
    }

    /// Clears the unacked entry matching `response`'s src/txid/kind.
    /// A no-op if no matching entry exists (already acked, or never sent).
    pub async fn ack(&self, response: &Message) {
        let key: UnackedKey = (response.src, response.txid, response.kind);
        self.inner.lock().await.unacked.remove(&key);
    }

    /// Stops retrying (non-unlimited sends give up on their next sleep).
    pub fn fail(&self) {
        self.disabled.store(true, Ordering::SeqCst);
    }

    /// Resumes normal retry behaviour.
    pub fn recover(&self) {
        self.disabled.store(false, Ordering::SeqCst);
    }
}
