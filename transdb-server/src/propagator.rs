//! Background fan-out of committed writes to non-quorum replicas, for
//! sloppy-quorum eventual consistency. Drives only the coordinator side
//! of convergence: participant handling of `NodeBackgroundWriteRequest`
//! lives in [`crate::node::Node`].

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc;
use transdb_common::{Message, MessageKind, NodeId, Txid};

struct Transaction {
    key: String,
    value: Vec<u8>,
    timestamp: u64,
    known_nodes: HashSet<NodeId>,
    confirmed_count: usize,
}

struct Inner {
    transactions: HashMap<Txid, Transaction>,
}

/// Tracks in-flight sloppy-quorum propagation for one node.
pub struct Propagator {
    id: NodeId,
    n: u32,
    critical_size: usize,
    outgoing: mpsc::Sender<Message>,
    inner: Mutex<Inner>,
}

impl Propagator {
    /// `critical_size` is `n - read_quorum_size + 1`, the number of nodes
    /// a write must reach before every possible read quorum is
    /// guaranteed to see it.
    pub fn new(id: NodeId, n: u32, read_quorum_size: usize, outgoing: mpsc::Sender<Message>) -> Self {
        Propagator {
            id,
            n,
            critical_size: (n as usize).saturating_sub(read_quorum_size) + 1,
            outgoing,
            inner: Mutex::new(Inner { transactions: HashMap::new() }),
        }
    }

    /// Begins tracking `txid`: the nodes already known to hold the value
    /// are those that acknowledged the write quorum.
    pub fn propagate_transaction(&self, txid: Txid, quorum_members: &[NodeId], key: String, value: Vec<u8>, timestamp: u64) {
        let known_nodes: HashSet<NodeId> = quorum_members.iter().copied().collect();
        let confirmed_count = known_nodes.len();
        let mut inner = self.inner.lock().unwrap();
        if confirmed_count >= self.critical_size {
            return;
        }
        inner.transactions.insert(txid, Transaction { key, value, timestamp, known_nodes, confirmed_count });
        drop(inner);
        self.stream_writes();
    }

    fn stream_writes(&self) {
        let inner = self.inner.lock().unwrap();
        for (&txid, txn) in inner.transactions.iter() {
            if txn.confirmed_count >= self.critical_size {
                continue;
            }
            for dest in 0..self.n {
                if dest == self.id || txn.known_nodes.contains(&dest) {
                    continue;
                }
                let msg = Message::new(0, self.id, dest, txid, MessageKind::NodeBackgroundWriteRequest, txn.key.clone())
                    .with_value(txn.value.clone())
                    .with_timestamp(txn.timestamp);
                let outgoing = self.outgoing.clone();
                tokio::spawn(async move {
                    let _ = outgoing.send(msg).await;
                });
            }
        }
    }

    /// Handles a `NodeBackgroundWriteResponse`. `Ok=true` marks `src` as
    /// now holding the value; `Ok=false` means `src` already has a
    /// strictly newer write and tracking for this transaction is
    /// dropped. The caller (`Node::on_background_write_response`) adopts
    /// that newer value locally before calling this, since this type has
    /// no access to the local store.
    pub fn on_background_write_response(&self, msg: &Message) {
        let mut inner = self.inner.lock().unwrap();
        let Some(txn) = inner.transactions.get_mut(&msg.txid) else { return };

        match msg.ok {
            Some(true) => {
                txn.known_nodes.insert(msg.src);
                txn.confirmed_count += 1;
                if txn.confirmed_count >= self.critical_size {
                    inner.transactions.remove(&msg.txid);
                }
            }
            _ => {
                debug_assert!(
                    msg.timestamp.map(|ts| ts > txn.timestamp).unwrap_or(true),
                    "background-write rejection must carry a strictly newer timestamp"
                );
                inner.transactions.remove(&msg.txid);
            }
        }
    }

    /// Spawns the 1s tick loop that re-streams pending writes to nodes
    /// that still haven't acknowledged them.
    pub fn spawn_tick_loop(self: std::sync::Arc<Self>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                self.stream_writes();
            }
        });
    }
}
