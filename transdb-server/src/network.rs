//! Simulated network fabric: variable latency, drop-on-overflow, link
//! partitions, and a failure scheduler that periodically fails/recovers
//! nodes or installs/heals partitions.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use tokio::sync::mpsc;
use transdb_common::{Message, MessageKind, NodeId, NO_TXID};

/// Capability a node needs to hand off an outgoing message. `SimNetwork`
/// is the simulated implementation; a direct HTTP bridge could satisfy
/// the same trait for a real deployment.
pub trait Network: Send + Sync {
    fn send(&self, msg: Message);
}

/// Directed pairs of nodes that currently cannot reach each other.
/// Installed/removed atomically under a single `RwLock` so a concurrent
/// `linked` check never races a partition change.
#[derive(Default)]
pub struct Partitions {
    blocked: RwLock<HashSet<(NodeId, NodeId)>>,
}

impl Partitions {
    pub fn new() -> Self {
        Partitions::default()
    }

    pub fn link_available(&self, a: NodeId, b: NodeId) -> bool {
        let blocked = self.blocked.read().unwrap();
        !blocked.contains(&(a, b)) && !blocked.contains(&(b, a))
    }

    pub fn create(&self, a: NodeId, b: NodeId) {
        self.blocked.write().unwrap().insert((a, b));
    }

    pub fn remove(&self, a: NodeId, b: NodeId) {
        let mut blocked = self.blocked.write().unwrap();
        blocked.remove(&(a, b));
        blocked.remove(&(b, a));
    }
}

/// Simulated latency/loss/partition layer sitting in front of `n` node
/// inboxes. Each destination gets a bounded channel; `send` never blocks
/// the caller and silently drops on a full queue or a blocked link,
/// matching the source's non-blocking delivery guidance.
pub struct SimNetwork {
    inboxes: Vec<mpsc::Sender<Message>>,
    partitions: Arc<Partitions>,
    failed: Arc<RwLock<HashSet<NodeId>>>,
    latency: Normal<f64>,
    rng: std::sync::Mutex<StdRng>,
}

impl SimNetwork {
    pub fn new(inboxes: Vec<mpsc::Sender<Message>>, mean_latency_ms: f64, latency_var: f64, seed: u64) -> Self {
        SimNetwork {
            inboxes,
            partitions: Arc::new(Partitions::new()),
            failed: Arc::new(RwLock::new(HashSet::new())),
            latency: Normal::new(mean_latency_ms.max(0.0), latency_var.max(0.0).sqrt()).unwrap(),
            rng: std::sync::Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn partitions(&self) -> Arc<Partitions> {
        self.partitions.clone()
    }

    pub fn num_nodes(&self) -> usize {
        self.inboxes.len()
    }

    fn sample_latency_ms(&self) -> f64 {
        let mut rng = self.rng.lock().unwrap();
        self.latency.sample(&mut *rng).max(0.0)
    }

    pub fn is_failed(&self, node: NodeId) -> bool {
        self.failed.read().unwrap().contains(&node)
    }

    pub fn mark_failed(&self, node: NodeId) {
        self.failed.write().unwrap().insert(node);
    }

    pub fn mark_recovered(&self, node: NodeId) {
        self.failed.write().unwrap().remove(&node);
    }
}

impl Network for SimNetwork {
    fn send(&self, msg: Message) {
        let dest = msg.dest as usize;
        let Some(inbox) = self.inboxes.get(dest) else { return };
        if self.is_failed(msg.dest) && msg.kind != MessageKind::ControlRecover {
            return;
        }
        if !self.partitions.link_available(msg.src, msg.dest) {
            return;
        }
        let delay = Duration::from_secs_f64(self.sample_latency_ms() / 1000.0);
        let inbox = inbox.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // try_send: destination queue full => drop, never block the network.
            let _ = inbox.try_send(msg);
        });
    }
}

/// Periodically fails a random node (scheduling its recovery) or
/// installs a random partition (scheduling its healing), both after a
/// Normal-distributed delay.
pub struct FailureScheduler {
    n: u32,
    mean_rate_per_100s: f64,
    recovery_mean_secs: f64,
    recovery_var_secs: f64,
    network: Arc<SimNetwork>,
    control_inboxes: Vec<mpsc::Sender<Message>>,
    rng: std::sync::Mutex<StdRng>,
}

impl FailureScheduler {
    pub fn new(
        n: u32,
        mean_rate_per_100s: f64,
        recovery_mean_secs: f64,
        recovery_var_secs: f64,
        network: Arc<SimNetwork>,
        control_inboxes: Vec<mpsc::Sender<Message>>,
        seed: u64,
    ) -> Self {
        FailureScheduler {
            n,
            mean_rate_per_100s,
            recovery_mean_secs,
            recovery_var_secs,
            network,
            control_inboxes,
            rng: std::sync::Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn spawn(self: Arc<Self>) {
        if self.mean_rate_per_100s <= 0.0 || self.n == 0 {
            return;
        }
        let mean_interval_secs = 100.0 / self.mean_rate_per_100s;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs_f64(mean_interval_secs.max(0.01))).await;
                self.trigger_one_event().await;
            }
        });
    }

    async fn trigger_one_event(&self) {
        let (node, partner, fail_node) = {
            let mut rng = self.rng.lock().unwrap();
            let node = rng.gen_range(0..self.n);
            let partner = rng.gen_range(0..self.n);
            let fail_node: bool = rng.gen();
            (node, partner, fail_node)
        };

        let normal = Normal::new(self.recovery_mean_secs.max(0.0), self.recovery_var_secs.max(0.0).sqrt()).unwrap();
        let recovery_delay = {
            let mut rng = self.rng.lock().unwrap();
            normal.sample(&mut *rng).max(0.0)
        };

        if fail_node || partner == node {
            self.network.mark_failed(node);
            if let Some(inbox) = self.control_inboxes.get(node as usize) {
                let _ = inbox.send(Message::new(0, node, node, NO_TXID, MessageKind::ControlFail, "")).await;
            }
            let network = self.network.clone();
            let control = self.control_inboxes.get(node as usize).cloned();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs_f64(recovery_delay)).await;
                network.mark_recovered(node);
                if let Some(inbox) = control {
                    let _ = inbox.send(Message::new(0, node, node, NO_TXID, MessageKind::ControlRecover, "")).await;
                }
            });
        } else {
            self.network.partitions().create(node, partner);
            let partitions = self.network.partitions();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs_f64(recovery_delay)).await;
                partitions.remove(node, partner);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_to_correct_destination() {
        let (tx0, mut rx0) = mpsc::channel(8);
        let (tx1, mut rx1) = mpsc::channel(8);
        let net = SimNetwork::new(vec![tx0, tx1], 1.0, 0.0, 1);

        net.send(Message::new(0, 0, 1, NO_TXID, MessageKind::NodeGetRequest, "k"));
        let received = rx1.recv().await.unwrap();
        assert_eq!(received.dest, 1);
        assert!(rx0.try_recv().is_err());
    }

    #[tokio::test]
    async fn partitioned_link_drops_silently() {
        let (tx0, _rx0) = mpsc::channel(8);
        let (tx1, mut rx1) = mpsc::channel(8);
        let net = SimNetwork::new(vec![tx0, tx1], 0.0, 0.0, 1);
        net.partitions().create(0, 1);

        net.send(Message::new(0, 0, 1, NO_TXID, MessageKind::NodeGetRequest, "k"));
        let nothing = tokio::time::timeout(Duration::from_millis(50), rx1.recv()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn failed_node_does_not_receive() {
        let (tx0, _rx0) = mpsc::channel(8);
        let (tx1, mut rx1) = mpsc::channel(8);
        let net = SimNetwork::new(vec![tx0, tx1], 0.0, 0.0, 1);
        net.mark_failed(1);

        net.send(Message::new(0, 0, 1, NO_TXID, MessageKind::NodeGetRequest, "k"));
        let nothing = tokio::time::timeout(Duration::from_millis(50), rx1.recv()).await;
        assert!(nothing.is_err());
    }
}
