//! Token-ring leader election. A token visits every node in id order;
//! each hop appends the visiting node's id. Once a node sees its own id
//! already in the token, the ring has gone all the way round and the
//! highest id observed becomes leader. A second lap with an
//! `ElectionCoordinator` token announces that leader to everyone.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use transdb_common::{Message, MessageKind, NodeId, NO_TXID};

/// Capability set the node requires from whichever election strategy is
/// configured. A no-op dummy satisfies it when `write_quorum_size == 1`.
pub trait Elector: Send + Sync {
    /// Current leader id, or -1 if none has been established yet.
    fn leader(&self) -> i64;
    fn process_msg(&self, msg: Message);
    /// Buffers `msg` (rewriting `dest` to the leader) and forwards it
    /// once a leader is known; forwards immediately if one already is.
    fn forward_to_leader(&self, msg: Message);
    /// Called on the node's internal timer tick, for ring re-forwarding.
    /// A no-op for electors that don't need one.
    fn on_timer(&self) {}
    /// True for the no-op elector used when `write_quorum_size == 1`,
    /// where there is nothing to elect and no forwarding should happen.
    fn is_noop(&self) -> bool {
        false
    }
}

fn encode_ids(ids: &[NodeId]) -> Vec<u8> {
    ids.iter().flat_map(|id| id.to_be_bytes()).collect()
}

fn decode_ids(bytes: &[u8]) -> Vec<NodeId> {
    bytes.chunks_exact(4).map(|c| NodeId::from_be_bytes(c.try_into().unwrap())).collect()
}

struct RingState {
    leader: i64,
    next_in_ring: NodeId,
    disabled: bool,
    last_token: Option<Message>,
    last_activity: Instant,
    buffered: Vec<Message>,
}

pub struct RingElector {
    id: NodeId,
    n: u32,
    timeout: Duration,
    outgoing: mpsc::Sender<Message>,
    state: Mutex<RingState>,
}

impl RingElector {
    pub fn new(id: NodeId, n: u32, outgoing: mpsc::Sender<Message>, timeout: Duration) -> Self {
        let elector = RingElector {
            id,
            n,
            timeout,
            outgoing,
            state: Mutex::new(RingState {
                leader: -1,
                next_in_ring: (id + 1) % n.max(1),
                disabled: false,
                last_token: None,
                last_activity: Instant::now(),
                buffered: Vec::new(),
            }),
        };
        elector.start_election();
        elector
    }

    fn send(&self, kind: MessageKind, dest: NodeId, ids: Vec<NodeId>) {
        let msg = Message::new(0, self.id, dest, NO_TXID, kind, "").with_value(encode_ids(&ids));
        let mut state = self.state.lock().unwrap();
        state.last_token = Some(msg.clone());
        state.last_activity = Instant::now();
        let next = state.next_in_ring;
        drop(state);
        let _ = dest; // dest already encoded in msg; kept for clarity at call sites
        let outgoing = self.outgoing.clone();
        let msg = Message { dest: next, ..msg };
        tokio::spawn(async move {
            let _ = outgoing.send(msg).await;
        });
    }

    fn start_election(&self) {
        let mut state = self.state.lock().unwrap();
        state.leader = -1;
        let next = state.next_in_ring;
        drop(state);
        self.send(MessageKind::ElectionElect, next, vec![self.id]);
    }

    fn flush_buffered(&self) {
        let (leader, buffered) = {
            let mut state = self.state.lock().unwrap();
            (state.leader, std::mem::take(&mut state.buffered))
        };
        if leader < 0 {
            let mut state = self.state.lock().unwrap();
            state.buffered = buffered;
            return;
        }
        let outgoing = self.outgoing.clone();
        for msg in buffered {
            let msg = Message { dest: leader as NodeId, ..msg };
            let outgoing = outgoing.clone();
            tokio::spawn(async move {
                let _ = outgoing.send(msg).await;
            });
        }
    }

    /// Called on the node's internal timer tick. Re-forwards the last
    /// token if nothing has been heard for `timeout / 5`, advancing to
    /// the next candidate successor each time (the simulated network is
    /// responsible for actually dropping traffic to dead nodes).
    pub fn on_timer(&self) {
        let mut state = self.state.lock().unwrap();
        if state.disabled {
            return;
        }
        if state.last_activity.elapsed() < self.timeout / 5 {
            return;
        }
        state.next_in_ring = (state.next_in_ring + 1) % self.n.max(1);
        let Some(token) = state.last_token.clone() else { return };
        let next = state.next_in_ring;
        state.last_activity = Instant::now();
        drop(state);
        let outgoing = self.outgoing.clone();
        let msg = Message { dest: next, ..token };
        tokio::spawn(async move {
            let _ = outgoing.send(msg).await;
        });
    }
}

impl Elector for RingElector {
    fn leader(&self) -> i64 {
        self.state.lock().unwrap().leader
    }

    fn process_msg(&self, msg: Message) {
        match msg.kind {
            MessageKind::ElectionElect => {
                let mut ids = decode_ids(msg.value.as_deref().unwrap_or(&[]));
                let mut state = self.state.lock().unwrap();
                state.last_activity = Instant::now();
                if ids.contains(&self.id) {
                    // Lap complete: the highest id in the token is leader.
                    let leader = *ids.iter().max().unwrap_or(&self.id);
                    state.leader = leader as i64;
                    let next = state.next_in_ring;
                    drop(state);
                    self.send(MessageKind::ElectionCoordinator, next, vec![leader, self.id]);
                    self.flush_buffered();
                } else {
                    ids.push(self.id);
                    let next = state.next_in_ring;
                    drop(state);
                    self.send(MessageKind::ElectionElect, next, ids);
                }
            }
            MessageKind::ElectionCoordinator => {
                // Token layout: `[leader, visited_1, visited_2, ...]`.
                let decoded = decode_ids(msg.value.as_deref().unwrap_or(&[]));
                let (leader, mut visited) = match decoded.split_first() {
                    Some((leader, rest)) => (*leader as i64, rest.to_vec()),
                    None => (self.id as i64, Vec::new()),
                };
                let mut state = self.state.lock().unwrap();
                state.last_activity = Instant::now();
                state.leader = leader;
                if visited.contains(&self.id) {
                    drop(state);
                    self.flush_buffered();
                } else {
                    visited.push(self.id);
                    let next = state.next_in_ring;
                    drop(state);
                    let mut token = vec![leader as NodeId];
                    token.extend(visited);
                    self.send(MessageKind::ElectionCoordinator, next, token);
                    self.flush_buffered();
                }
            }
            MessageKind::ElectionAck => {
                self.state.lock().unwrap().last_activity = Instant::now();
            }
            MessageKind::ControlFail => {
                let mut state = self.state.lock().unwrap();
                state.disabled = true;
                state.leader = -1;
            }
            MessageKind::ControlRecover => {
                {
                    let mut state = self.state.lock().unwrap();
                    state.disabled = false;
                }
                self.start_election();
            }
            _ => {}
        }
    }

    fn forward_to_leader(&self, msg: Message) {
        let leader = self.leader();
        if leader >= 0 {
            let outgoing = self.outgoing.clone();
            let msg = Message { dest: leader as NodeId, ..msg };
            tokio::spawn(async move {
                let _ = outgoing.send(msg).await;
            });
        } else {
            self.state.lock().unwrap().buffered.push(msg);
        }
    }

    fn on_timer(&self) {
        RingElector::on_timer(self)
    }
}

/// Always reports the local node as leader. Used when `write_quorum_size
/// == 1`, where the single-replica shortcut means no election is needed.
pub struct NoopElector {
    id: NodeId,
}

impl NoopElector {
    pub fn new(id: NodeId) -> Self {
        NoopElector { id }
    }
}

impl Elector for NoopElector {
    fn leader(&self) -> i64 {
        self.id as i64
    }

    fn process_msg(&self, _msg: Message) {}

    fn forward_to_leader(&self, _msg: Message) {
        // Never invoked: the node only forwards when it isn't leader,
        // and under this elector it always is.
    }

    fn is_noop(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_elector_is_always_leader() {
        let elector = NoopElector::new(3);
        assert_eq!(elector.leader(), 3);
    }

    #[tokio::test]
    async fn ring_elector_completes_on_single_node() {
        let (tx, mut rx) = mpsc::channel(16);
        let elector = RingElector::new(0, 1, tx, Duration::from_millis(50));
        // construction sends the initial token to next_in_ring = (0+1)%1 = 0 (self)
        let token = rx.recv().await.unwrap();
        elector.process_msg(token);
        assert_eq!(elector.leader(), 0);
    }
}
