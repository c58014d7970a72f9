//! The coordinator/participant state machine: a single serialising event
//! loop that owns all per-node transaction state. Drives the
//! lock -> read/timestamp -> put -> commit/abort protocol across a
//! quorum of peers.
//!
//! The "next step" a coordinator expects is a plain `Stage` enum field
//! rather than folded into the peer-response map, so a reader can see
//! what's pending without cross-referencing which keys that map holds.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use transdb_common::{decode, encode, Message, MessageKind, NodeId, Txid, NO_TXID};

use crate::config::UNLOCK_TXIDS_WINDOW;
use crate::elector::Elector;
use crate::network::Network;
use crate::propagator::Propagator;
use crate::queue::RequestQueue;
use crate::repeater::Repeater;
use crate::store::{Store, Txid as StoreTxid};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Idle,
    AssemblingQuorum,
    CoordinatingRead,
    CoordinatingWrite,
    CoordinatingFastRead,
    ProcessingRead,
    ProcessingWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    AwaitingLocks,
    AwaitingTimestamps,
    AwaitingGets,
    AwaitingPutAcks,
}

/// Everything a node needs to drive the protocol: its own identity and
/// quorum sizes, the collaborators it's built from, and the mutable
/// per-transaction state listed in spec "Node state".
pub struct Node {
    id: NodeId,
    num_peers: u32,
    read_quorum_size: usize,
    write_quorum_size: usize,
    fast_reads: bool,
    sloppy: bool,
    lock_timeout: Duration,
    coordinator_write_timeout: Duration,

    store: Arc<dyn Store>,
    repeater: Repeater,
    propagator: Arc<Propagator>,
    elector: Arc<dyn Elector>,
    network: Arc<dyn Network>,
    client_responses: mpsc::Sender<Message>,

    next_id: AtomicU64,
    rng: StdRng,

    mode: Mode,
    current_txid: Txid,
    current_key: Option<String>,
    client_request: Option<Message>,
    quorum_members: HashMap<NodeId, Message>,
    responded: HashSet<NodeId>,
    num_waiting_nodes: usize,
    stage: Option<Stage>,
    fast_read_best: Option<(u64, Vec<u8>)>,
    uncommitted_key: Option<String>,
    uncommitted_store_txid: Option<StoreTxid>,
    pending_new_timestamp: Option<u64>,
    unlock_txids: VecDeque<Txid>,
    lock_requests: RequestQueue,
    disabled: bool,
    deadline: Option<Instant>,
    /// The peer that granted us the current processing-mode lock (i.e.
    /// the coordinator for this transaction), so a participant-side
    /// abort knows who to send `NodeUnlockAck(Ok=false)` to.
    coordinator: Option<NodeId>,
}

impl Node {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: NodeId,
        num_peers: u32,
        read_quorum_size: usize,
        write_quorum_size: usize,
        fast_reads: bool,
        sloppy: bool,
        lock_timeout: Duration,
        seed: u64,
        store: Arc<dyn Store>,
        repeater: Repeater,
        propagator: Arc<Propagator>,
        elector: Arc<dyn Elector>,
        network: Arc<dyn Network>,
        client_responses: mpsc::Sender<Message>,
    ) -> Self {
        Node {
            id,
            num_peers,
            read_quorum_size,
            write_quorum_size,
            fast_reads,
            sloppy,
            lock_timeout,
            coordinator_write_timeout: lock_timeout * 3,
            store,
            repeater,
            propagator,
            elector,
            network,
            client_responses,
            next_id: AtomicU64::new(1),
            rng: StdRng::seed_from_u64(seed ^ (id as u64).wrapping_mul(0x9E3779B97F4A7C15)),
            mode: Mode::Idle,
            current_txid: NO_TXID,
            current_key: None,
            client_request: None,
            quorum_members: HashMap::new(),
            responded: HashSet::new(),
            num_waiting_nodes: 0,
            stage: None,
            fast_read_best: None,
            uncommitted_key: None,
            uncommitted_store_txid: None,
            pending_new_timestamp: None,
            unlock_txids: VecDeque::new(),
            lock_requests: RequestQueue::new(),
            disabled: false,
            deadline: None,
            coordinator: None,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    fn next_msg_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn peers(&self) -> Vec<NodeId> {
        (0..self.num_peers).filter(|&p| p != self.id).collect()
    }

    fn choose_random_peers(&mut self, count: usize) -> Vec<NodeId> {
        let mut candidates = self.peers();
        candidates.shuffle(&mut self.rng);
        candidates.truncate(count);
        candidates
    }

    fn local_read(&self, key: &str) -> (u64, Vec<u8>) {
        match self.store.get(key.as_bytes()).and_then(|framed| decode(&framed)) {
            Some((ts, value)) => (ts, value),
            None => (0, Vec::new()),
        }
    }

    fn send_to(&self, dest: NodeId, kind: MessageKind, key: impl Into<String>, unlimited: bool) -> Message {
        let msg = Message::new(self.next_msg_id(), self.id, dest, self.current_txid, kind, key);
        self.repeater.send(msg.clone(), unlimited);
        msg
    }

    fn send_client_response(&self, txid: Txid, kind: MessageKind, value: Option<Vec<u8>>, timestamp: Option<u64>, ok: bool) {
        let mut msg = Message::new(self.next_msg_id(), self.id, self.id, txid, kind, self.current_key.clone().unwrap_or_default()).with_ok(ok);
        if let Some(v) = value {
            msg = msg.with_value(v);
        }
        if let Some(ts) = timestamp {
            msg = msg.with_timestamp(ts);
        }
        let sender = self.client_responses.clone();
        tokio::spawn(async move {
            let _ = sender.send(msg).await;
        });
    }

    /// Entry point: dispatches one message. Called by the event loop
    /// owner (`run`).
    #[instrument(skip(self, msg), fields(node_id = self.id, mode = ?self.mode))]
    pub async fn handle_message(&mut self, msg: Message) {
        if self.disabled && msg.kind != MessageKind::ControlRecover {
            return;
        }

        match msg.kind {
            MessageKind::ControlFail => self.on_control_fail(),
            MessageKind::ControlRecover => self.on_control_recover(),
            MessageKind::InternalTimerSignal => self.on_timer(),
            MessageKind::ClientReadRequest => self.on_client_read_request(msg).await,
            MessageKind::ClientWriteRequest | MessageKind::ClientStrongWriteRequest => self.on_client_write_request(msg).await,
            MessageKind::NodeLockRequest | MessageKind::NodeLockRequestNoTimeout => self.on_node_lock_request(msg).await,
            MessageKind::NodeLockResponse => self.on_node_lock_response(msg).await,
            MessageKind::NodeUnlockRequest => self.on_node_unlock_request(msg).await,
            MessageKind::NodeUnlockAck => self.repeater.ack(&msg).await,
            MessageKind::NodeGetRequest => self.on_node_get_request(msg).await,
            MessageKind::NodeGetResponse => self.on_node_get_response(msg).await,
            MessageKind::NodeTimestampRequest => self.on_node_timestamp_request(msg).await,
            MessageKind::NodePutRequest => self.on_node_put_request(msg).await,
            MessageKind::NodePutResponse => self.on_node_put_response(msg).await,
            MessageKind::NodeBackgroundWriteRequest => self.on_background_write_request(msg).await,
            MessageKind::NodeBackgroundWriteResponse => self.on_background_write_response(msg).await,
            MessageKind::ElectionElect | MessageKind::ElectionCoordinator | MessageKind::ElectionAck => {
                self.elector.process_msg(msg)
            }
            MessageKind::InternalHeartbeat | MessageKind::InternalLeaderQuery => {}
            MessageKind::ClientReadResponse | MessageKind::ClientWriteResponse => {}
        }
    }

    fn on_timer(&mut self) {
        self.elector.on_timer();
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline && self.mode != Mode::Idle {
                warn!(node_id = self.id, txid = self.current_txid, "lock timeout expired, aborting");
                self.abort(None);
            }
        }
        for msg in self.lock_requests.expire(Instant::now()) {
            warn!(node_id = self.id, src = msg.src, txid = msg.txid, "queued lock request timed out");
            let reply = Message::new(self.next_msg_id(), self.id, msg.src, msg.txid, MessageKind::NodeLockResponse, msg.key).with_ok(false);
            self.network.send(reply);
        }
    }

    fn on_control_fail(&mut self) {
        info!(node_id = self.id, "received ControlFail");
        self.disabled = true;
        self.repeater.fail();
        self.elector.process_msg(Message::new(0, self.id, self.id, NO_TXID, MessageKind::ControlFail, ""));
        if !matches!(self.mode, Mode::CoordinatingWrite | Mode::AssemblingQuorum) {
            self.hard_reset();
        }
    }

    fn on_control_recover(&mut self) {
        info!(node_id = self.id, "received ControlRecover");
        self.disabled = false;
        self.repeater.recover();
        self.elector.process_msg(Message::new(0, self.id, self.id, NO_TXID, MessageKind::ControlRecover, ""));
    }

    /// Resets to idle without notifying anyone — used only when a
    /// `ControlFail` interrupts a transaction outside its critical
    /// window; a full `abort` would itself try to send messages a
    /// disabled node shouldn't be emitting.
    fn hard_reset(&mut self) {
        if let Some(store_txid) = self.uncommitted_store_txid.take() {
            self.store.rollback(store_txid);
        }
        self.reset_to_idle();
    }

    fn reset_to_idle(&mut self) {
        self.mode = Mode::Idle;
        self.current_txid = NO_TXID;
        self.current_key = None;
        self.client_request = None;
        self.quorum_members.clear();
        self.responded.clear();
        self.num_waiting_nodes = 0;
        self.stage = None;
        self.fast_read_best = None;
        self.pending_new_timestamp = None;
        self.deadline = None;
        self.coordinator = None;
        if let Some(next) = self.lock_requests.dequeue() {
            self.grant_lock(next);
        }
    }

    fn remember_unlock_txid(&mut self, txid: Txid) {
        self.unlock_txids.push_back(txid);
        while self.unlock_txids.len() > UNLOCK_TXIDS_WINDOW {
            self.unlock_txids.pop_front();
        }
    }

    // ---- Coordinator: read ----------------------------------------------

    async fn on_client_read_request(&mut self, msg: Message) {
        if self.mode != Mode::Idle {
            self.send_reject(msg, MessageKind::ClientReadResponse);
            return;
        }
        self.current_txid = msg.txid;
        self.current_key = Some(msg.key.clone());
        self.client_request = Some(msg.clone());

        if self.read_quorum_size <= 1 {
            let (ts, value) = self.local_read(&msg.key);
            self.send_client_response(msg.txid, MessageKind::ClientReadResponse, Some(value), Some(ts), true);
            self.reset_to_idle();
            return;
        }

        if self.fast_reads {
            self.mode = Mode::CoordinatingFastRead;
            let (local_ts, local_value) = self.local_read(&msg.key);
            self.fast_read_best = Some((local_ts, local_value));
            let peers = self.choose_random_peers(self.read_quorum_size - 1);
            self.num_waiting_nodes = peers.len();
            self.deadline = Some(Instant::now() + self.lock_timeout);
            if peers.is_empty() {
                self.finish_fast_read();
                return;
            }
            for peer in peers {
                self.send_to(peer, MessageKind::NodeGetRequest, msg.key.clone(), false);
            }
        } else {
            self.mode = Mode::CoordinatingRead;
            self.stage = Some(Stage::AwaitingLocks);
            let peers = self.choose_random_peers(self.read_quorum_size - 1);
            self.num_waiting_nodes = peers.len();
            self.deadline = Some(Instant::now() + self.lock_timeout);
            if peers.is_empty() {
                self.advance_read_after_locks();
                return;
            }
            for peer in peers {
                self.send_to(peer, MessageKind::NodeLockRequest, msg.key.clone(), false);
            }
        }
    }

    fn finish_fast_read(&mut self) {
        let (ts, value) = self.fast_read_best.take().unwrap_or((0, Vec::new()));
        if let Some(req) = self.client_request.take() {
            self.send_client_response(req.txid, MessageKind::ClientReadResponse, Some(value), Some(ts), true);
        }
        self.reset_to_idle();
    }

    fn advance_read_after_locks(&mut self) {
        self.stage = Some(Stage::AwaitingGets);
        self.responded.clear();
        let peers: Vec<NodeId> = self.quorum_members.keys().copied().collect();
        self.num_waiting_nodes = peers.len();
        let key = self.current_key.clone().unwrap_or_default();
        self.deadline = Some(Instant::now() + self.lock_timeout);
        if peers.is_empty() {
            self.finish_full_read();
            return;
        }
        for peer in peers {
            self.send_to(peer, MessageKind::NodeGetRequest, key.clone(), false);
        }
    }

    fn finish_full_read(&mut self) {
        let key = self.current_key.clone().unwrap_or_default();
        let (mut best_ts, mut best_value) = self.local_read(&key);
        for resp in self.quorum_members.values() {
            if let Some(ts) = resp.timestamp {
                let value = resp.value.clone().unwrap_or_default();
                if ts > best_ts {
                    best_ts = ts;
                    best_value = value;
                }
            }
        }
        for peer in self.quorum_members.keys().copied().collect::<Vec<_>>() {
            self.send_to(peer, MessageKind::NodeUnlockRequest, key.clone(), false);
        }
        if let Some(req) = self.client_request.take() {
            self.send_client_response(req.txid, MessageKind::ClientReadResponse, Some(best_value), Some(best_ts), true);
        }
        self.reset_to_idle();
    }

    // ---- Coordinator: write ----------------------------------------------

    async fn on_client_write_request(&mut self, msg: Message) {
        if self.mode != Mode::Idle {
            self.send_reject(msg, MessageKind::ClientWriteResponse);
            return;
        }

        if self.write_quorum_size <= 1 {
            self.direct_local_write(msg);
            return;
        }

        if !self.elector.is_noop() {
            let leader = self.elector.leader();
            if leader >= 0 && leader as NodeId != self.id {
                self.elector.forward_to_leader(msg);
                return;
            }
            if leader < 0 {
                self.elector.forward_to_leader(msg);
                return;
            }
        }

        self.current_txid = msg.txid;
        self.current_key = Some(msg.key.clone());
        self.client_request = Some(msg.clone());
        self.mode = Mode::AssemblingQuorum;
        self.stage = Some(Stage::AwaitingLocks);
        let peers = self.choose_random_peers(self.write_quorum_size - 1);
        self.num_waiting_nodes = peers.len();
        self.deadline = Some(Instant::now() + self.coordinator_write_timeout);
        if peers.is_empty() {
            self.advance_write_after_locks();
            return;
        }
        for peer in peers {
            self.send_to(peer, MessageKind::NodeLockRequestNoTimeout, msg.key.clone(), true);
        }
    }

    fn direct_local_write(&mut self, msg: Message) {
        let (local_ts, _) = self.local_read(&msg.key);
        let new_ts = local_ts + 1;

        if msg.kind == MessageKind::ClientStrongWriteRequest {
            if msg.timestamp != Some(new_ts) {
                self.send_client_response(msg.txid, MessageKind::ClientWriteResponse, None, Some(new_ts), false);
                return;
            }
        }

        let value = msg.value.clone().unwrap_or_default();
        let encoded = encode(new_ts, &value);
        let store_txid = self.store.put(msg.key.as_bytes(), &encoded);
        self.store.commit(msg.key.as_bytes(), store_txid);
        self.send_client_response(msg.txid, MessageKind::ClientWriteResponse, None, Some(new_ts), true);
    }

    fn advance_write_after_locks(&mut self) {
        self.mode = Mode::CoordinatingWrite;
        self.stage = Some(Stage::AwaitingTimestamps);
        self.responded.clear();
        let peers: Vec<NodeId> = self.quorum_members.keys().copied().collect();
        self.num_waiting_nodes = peers.len();
        let key = self.current_key.clone().unwrap_or_default();
        self.deadline = Some(Instant::now() + self.coordinator_write_timeout);
        if peers.is_empty() {
            self.advance_write_after_timestamps();
            return;
        }
        for peer in peers {
            self.send_to(peer, MessageKind::NodeTimestampRequest, key.clone(), false);
        }
    }

    fn advance_write_after_timestamps(&mut self) {
        let key = self.current_key.clone().unwrap_or_default();
        let (local_ts, _) = self.local_read(&key);
        let mut latest_ts = local_ts;
        for resp in self.quorum_members.values() {
            if let Some(ts) = resp.timestamp {
                latest_ts = latest_ts.max(ts);
            }
        }
        let new_ts = latest_ts + 1;

        let req = self.client_request.clone().unwrap();
        if req.kind == MessageKind::ClientStrongWriteRequest && req.timestamp != Some(new_ts) {
            self.abort(Some(new_ts));
            return;
        }

        self.pending_new_timestamp = Some(new_ts);
        let value = req.value.clone().unwrap_or_default();
        let encoded = encode(new_ts, &value);
        let store_txid = self.store.put(key.as_bytes(), &encoded);
        self.uncommitted_key = Some(key.clone());
        self.uncommitted_store_txid = Some(store_txid);

        self.stage = Some(Stage::AwaitingPutAcks);
        self.responded.clear();
        let peers: Vec<NodeId> = self.quorum_members.keys().copied().collect();
        self.num_waiting_nodes = peers.len();
        self.deadline = Some(Instant::now() + self.coordinator_write_timeout);
        for peer in peers {
            let m = Message::new(self.next_msg_id(), self.id, peer, self.current_txid, MessageKind::NodePutRequest, key.clone())
                .with_value(encoded.clone())
                .with_timestamp(new_ts);
            self.repeater.send(m, false);
        }
        if self.num_waiting_nodes == 0 {
            self.finish_write();
        }
    }

    fn finish_write(&mut self) {
        let key = self.current_key.clone().unwrap_or_default();
        if let Some(store_txid) = self.uncommitted_store_txid.take() {
            self.store.commit(key.as_bytes(), store_txid);
        }
        self.uncommitted_key = None;
        let new_ts = self.pending_new_timestamp.unwrap_or(0);

        let members: Vec<NodeId> = self.quorum_members.keys().copied().collect();
        for &peer in &members {
            self.send_to(peer, MessageKind::NodeUnlockRequest, key.clone(), false);
        }

        if self.sloppy {
            let req = self.client_request.clone();
            if let Some(req) = req {
                let mut quorum_ids = members.clone();
                quorum_ids.push(self.id);
                let value = req.value.unwrap_or_default();
                let encoded = encode(new_ts, &value);
                self.propagator.propagate_transaction(self.current_txid, &quorum_ids, key.clone(), encoded, new_ts);
            }
        }

        if let Some(req) = self.client_request.take() {
            self.send_client_response(req.txid, MessageKind::ClientWriteResponse, None, Some(new_ts), true);
        }
        self.reset_to_idle();
    }

    fn send_reject(&self, msg: Message, response_kind: MessageKind) {
        let sender = self.client_responses.clone();
        let resp = Message::new(self.next_msg_id(), self.id, self.id, msg.txid, response_kind, msg.key).with_ok(false);
        tokio::spawn(async move {
            let _ = sender.send(resp).await;
        });
    }

    // ---- Coordinator: responses from peers --------------------------------

    async fn on_node_lock_response(&mut self, msg: Message) {
        let stray = !matches!(self.mode, Mode::CoordinatingRead | Mode::AssemblingQuorum) || msg.txid != self.current_txid;
        if stray {
            if msg.ok == Some(true) {
                // We no longer want this peer: release it immediately.
                let m = Message::new(self.next_msg_id(), self.id, msg.src, msg.txid, MessageKind::NodeUnlockRequest, msg.key).with_ok(false);
                self.repeater.send(m, false);
            }
            return;
        }
        self.repeater.ack(&msg).await;
        if msg.ok != Some(true) {
            self.abort(None);
            return;
        }
        if !self.responded.insert(msg.src) {
            return; // duplicate
        }
        self.quorum_members.insert(msg.src, msg.clone());
        if self.responded.len() >= self.num_waiting_nodes {
            match self.mode {
                Mode::CoordinatingRead => self.advance_read_after_locks(),
                Mode::AssemblingQuorum => self.advance_write_after_locks(),
                _ => {}
            }
        }
    }

    async fn on_node_get_response(&mut self, msg: Message) {
        if msg.txid != self.current_txid {
            return;
        }
        self.repeater.ack(&msg).await;

        match self.mode {
            Mode::CoordinatingFastRead => {
                if msg.ok == Some(false) {
                    self.abort(None);
                    return;
                }
                if !self.responded.insert(msg.src) {
                    return;
                }
                if let Some(ts) = msg.timestamp {
                    let value = msg.value.clone().unwrap_or_default();
                    let best = self.fast_read_best.get_or_insert((0, Vec::new()));
                    if ts > best.0 {
                        *best = (ts, value);
                    }
                }
                if self.responded.len() >= self.num_waiting_nodes {
                    self.finish_fast_read();
                }
            }
            Mode::CoordinatingRead => {
                if msg.ok == Some(false) {
                    self.abort(None);
                    return;
                }
                if !self.responded.insert(msg.src) {
                    return;
                }
                self.quorum_members.insert(msg.src, msg.clone());
                if self.responded.len() >= self.num_waiting_nodes {
                    self.finish_full_read();
                }
            }
            Mode::CoordinatingWrite if self.stage == Some(Stage::AwaitingTimestamps) => {
                if msg.ok == Some(false) {
                    self.abort(None);
                    return;
                }
                if !self.responded.insert(msg.src) {
                    return;
                }
                self.quorum_members.insert(msg.src, msg.clone());
                if self.responded.len() >= self.num_waiting_nodes {
                    self.advance_write_after_timestamps();
                }
            }
            _ => {}
        }
    }

    async fn on_node_put_response(&mut self, msg: Message) {
        if msg.txid != self.current_txid || self.mode != Mode::CoordinatingWrite || self.stage != Some(Stage::AwaitingPutAcks) {
            return;
        }
        self.repeater.ack(&msg).await;
        if msg.ok == Some(false) {
            self.abort(None);
            return;
        }
        if !self.responded.insert(msg.src) {
            return;
        }
        if self.responded.len() >= self.num_waiting_nodes {
            self.finish_write();
        }
    }

    fn abort(&mut self, stale_ts: Option<u64>) {
        debug!(node_id = self.id, txid = self.current_txid, "aborting transaction");
        if let Some(store_txid) = self.uncommitted_store_txid.take() {
            self.store.rollback(store_txid);
        }
        self.uncommitted_key = None;
        let key = self.current_key.clone().unwrap_or_default();

        if matches!(self.mode, Mode::ProcessingRead | Mode::ProcessingWrite) {
            // We're a participant here, not a coordinator: the only party
            // owed a response is whoever granted us this lock.
            if let Some(coordinator) = self.coordinator {
                let reply = Message::new(self.next_msg_id(), self.id, coordinator, self.current_txid, MessageKind::NodeUnlockAck, key).with_ok(false);
                self.network.send(reply);
            }
            self.reset_to_idle();
            return;
        }

        for peer in self.quorum_members.keys().copied().collect::<Vec<_>>() {
            let m = Message::new(self.next_msg_id(), self.id, peer, self.current_txid, MessageKind::NodeUnlockRequest, key.clone()).with_ok(false);
            self.repeater.send(m, false);
        }
        if let Some(req) = self.client_request.take() {
            let response_kind = match req.kind {
                MessageKind::ClientReadRequest => MessageKind::ClientReadResponse,
                _ => MessageKind::ClientWriteResponse,
            };
            self.send_client_response(req.txid, response_kind, None, stale_ts, false);
        }
        self.reset_to_idle();
    }

    // ---- Participant -------------------------------------------------------

    fn grant_lock(&mut self, msg: Message) {
        self.mode = if msg.kind == MessageKind::NodeLockRequest { Mode::ProcessingRead } else { Mode::ProcessingWrite };
        self.current_txid = msg.txid;
        self.current_key = Some(msg.key.clone());
        self.coordinator = Some(msg.src);
        self.deadline = Some(Instant::now() + self.lock_timeout);
        let reply = Message::new(self.next_msg_id(), self.id, msg.src, msg.txid, MessageKind::NodeLockResponse, msg.key).with_ok(true);
        let sender_network = self.network.clone();
        tokio::spawn(async move {
            sender_network.send(reply);
        });
    }

    async fn on_node_lock_request(&mut self, msg: Message) {
        if self.unlock_txids.contains(&msg.txid) {
            let reply = Message::new(self.next_msg_id(), self.id, msg.src, msg.txid, MessageKind::NodeLockResponse, msg.key).with_ok(false);
            self.network.send(reply);
            return;
        }
        if self.mode == Mode::Idle {
            self.grant_lock(msg);
        } else {
            let deadline = Instant::now() + self.lock_timeout;
            self.lock_requests.enqueue(msg, deadline);
        }
    }

    async fn on_node_get_request(&mut self, msg: Message) {
        let locked_match = self.mode == Mode::ProcessingRead && msg.txid == self.current_txid;
        let conflicting_pending_write = self.uncommitted_key.as_deref() == Some(msg.key.as_str());

        if !locked_match && conflicting_pending_write {
            let reply = Message::new(self.next_msg_id(), self.id, msg.src, msg.txid, MessageKind::NodeGetResponse, msg.key).with_ok(false);
            self.network.send(reply);
            return;
        }
        let (ts, value) = self.local_read(&msg.key);
        let reply = Message::new(self.next_msg_id(), self.id, msg.src, msg.txid, MessageKind::NodeGetResponse, msg.key)
            .with_value(value)
            .with_timestamp(ts)
            .with_ok(true);
        self.network.send(reply);
    }

    async fn on_node_timestamp_request(&mut self, msg: Message) {
        if self.mode != Mode::ProcessingWrite || msg.txid != self.current_txid {
            let reply = Message::new(self.next_msg_id(), self.id, msg.src, msg.txid, MessageKind::NodeGetResponse, msg.key).with_ok(false);
            self.network.send(reply);
            return;
        }
        let (ts, _) = self.local_read(&msg.key);
        let reply = Message::new(self.next_msg_id(), self.id, msg.src, msg.txid, MessageKind::NodeGetResponse, msg.key)
            .with_timestamp(ts)
            .with_ok(true);
        self.network.send(reply);
    }

    async fn on_node_put_request(&mut self, msg: Message) {
        if self.mode != Mode::ProcessingWrite || msg.txid != self.current_txid {
            let reply = Message::new(self.next_msg_id(), self.id, msg.src, msg.txid, MessageKind::NodePutResponse, msg.key).with_ok(false);
            self.network.send(reply);
            return;
        }
        let value = msg.value.clone().unwrap_or_default();
        let store_txid = self.store.put(msg.key.as_bytes(), &value);
        self.uncommitted_key = Some(msg.key.clone());
        self.uncommitted_store_txid = Some(store_txid);
        let reply = Message::new(self.next_msg_id(), self.id, msg.src, msg.txid, MessageKind::NodePutResponse, msg.key).with_ok(true);
        self.network.send(reply);
    }

    async fn on_node_unlock_request(&mut self, msg: Message) {
        if msg.txid != self.current_txid {
            self.remember_unlock_txid(msg.txid);
            let reply = Message::new(self.next_msg_id(), self.id, msg.src, msg.txid, MessageKind::NodeUnlockAck, msg.key).with_ok(true);
            self.network.send(reply);
            return;
        }

        if msg.ok == Some(true) {
            if let (Some(key), Some(store_txid)) = (self.uncommitted_key.take(), self.uncommitted_store_txid.take()) {
                self.store.commit(key.as_bytes(), store_txid);
            }
        } else if let Some(store_txid) = self.uncommitted_store_txid.take() {
            self.store.rollback(store_txid);
            self.uncommitted_key = None;
        }
        self.remember_unlock_txid(msg.txid);
        let reply = Message::new(self.next_msg_id(), self.id, msg.src, msg.txid, MessageKind::NodeUnlockAck, msg.key).with_ok(true);
        self.network.send(reply);
        self.reset_to_idle();
    }

    /// Handles a `NodeBackgroundWriteResponse`. `Ok=false` means the
    /// responder already holds a strictly newer write for this key; per
    /// spec §4.4 we must adopt that value locally before dropping
    /// propagator tracking for the transaction, otherwise our own stale
    /// copy never converges.
    async fn on_background_write_response(&mut self, msg: Message) {
        if msg.ok == Some(false) {
            if let Some(ts) = msg.timestamp {
                let (local_ts, _) = self.local_read(&msg.key);
                if ts > local_ts {
                    let value = msg.value.clone().unwrap_or_default();
                    let encoded = encode(ts, &value);
                    let store_txid = self.store.put(msg.key.as_bytes(), &encoded);
                    self.store.commit(msg.key.as_bytes(), store_txid);
                }
            }
        }
        self.propagator.on_background_write_response(&msg);
    }

    // ---- Propagator participant side --------------------------------------

    async fn on_background_write_request(&mut self, msg: Message) {
        let key = msg.key.clone();
        let incoming_ts = msg.timestamp.unwrap_or(0);
        let incoming_value = msg.value.clone().unwrap_or_default();
        let (local_ts, local_value) = self.local_read(&key);

        if incoming_ts > local_ts {
            let encoded = encode(incoming_ts, &incoming_value);
            let store_txid = self.store.put(key.as_bytes(), &encoded);
            self.store.commit(key.as_bytes(), store_txid);
            let reply = Message::new(self.next_msg_id(), self.id, msg.src, msg.txid, MessageKind::NodeBackgroundWriteResponse, key).with_ok(true);
            self.network.send(reply);
        } else if incoming_ts == local_ts {
            if incoming_value != local_value {
                // Fatal per spec "Protocol invariant violation": two
                // writers claimed the same timestamp with different
                // values. Surfaced via the `tracing` error channel rather
                // than panicking the whole node process.
                tracing::error!(node_id = self.id, key = %key, ts = incoming_ts, "protocol invariant violated: divergent values at equal timestamp");
            }
        } else {
            let reply = Message::new(self.next_msg_id(), self.id, msg.src, msg.txid, MessageKind::NodeBackgroundWriteResponse, key)
                .with_value(local_value)
                .with_timestamp(local_ts)
                .with_ok(false);
            self.network.send(reply);
        }
    }
}

/// Spawns the internal timer ticking task: posts `InternalTimerSignal`
/// back onto the node's own inbox every `period`, so the node can check
/// deadlines without blocking on incoming messages.
pub fn spawn_timer(self_tx: mpsc::Sender<Message>, id: NodeId, period: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            let msg = Message::new(0, id, id, NO_TXID, MessageKind::InternalTimerSignal, "");
            if self_tx.send(msg).await.is_err() {
                return;
            }
        }
    });
}

/// Drives a node's event loop: reads from `incoming` until the channel
/// closes, dispatching each message serially.
pub async fn run(mut node: Node, mut incoming: mpsc::Receiver<Message>) {
    while let Some(msg) = incoming.recv().await {
        node.handle_message(msg).await;
    }
}
