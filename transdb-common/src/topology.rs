use serde::{Deserialize, Serialize};

/// The HTTP address(es) a client talks to. This is the shape a
/// `--topology` file on disk takes; it says nothing about quorum sizes or
/// how many nodes participate in the replication protocol behind that
/// address — see [`ClusterConfig`] for that. `replica_addr`, when set, is
/// an alternate front door a client can switch to with `Client::set_target`
/// (e.g. after `primary_addr` stops answering); since every node in this
/// workspace's cluster is interchangeable (there is no primary/replica
/// role in the protocol itself), it's just a second address, not a
/// distinguished fallback role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    pub primary_addr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replica_addr: Option<String>,
}

/// Full description of a replicated cluster: every node's address plus
/// the quorum and replication parameters the coordinator needs to run
/// the lock/get/put protocol. Generalizes [`Topology`]'s single client
/// address to `n` peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Address of every node, indexed by `NodeId`.
    pub node_addrs: Vec<String>,

    /// Number of nodes a read coordinator must hear from before
    /// returning a result to the client.
    pub read_quorum_size: usize,

    /// Number of nodes a write coordinator must hear an unlock ack from
    /// before it is safe to report the write as committed.
    pub write_quorum_size: usize,

    /// When true, a coordinator that cannot reach enough of the
    /// preferred replica set for a key may substitute other live nodes
    /// to still assemble a quorum (sloppy quorum); when false, a
    /// coordinator only ever uses the key's fixed preference list
    /// (strict quorum) and fails the request if it can't be reached.
    #[serde(default)]
    pub sloppy_quorum: bool,

    /// Lock timeout, in milliseconds, a coordinator waits for a
    /// participant's lock grant before giving up and aborting.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Seed for the pseudo-random peer selection a coordinator uses when
    /// assembling a quorum. Fixing it makes simulation runs
    /// reproducible; omit it to seed from entropy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub random_seed: Option<u64>,
}

fn default_lock_timeout_ms() -> u64 {
    1000
}

impl ClusterConfig {
    pub fn num_nodes(&self) -> usize {
        self.node_addrs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_config_defaults_are_strict_quorum() {
        let json = r#"{"node_addrs":["a","b","c"],"read_quorum_size":2,"write_quorum_size":2}"#;
        let cfg: ClusterConfig = serde_json::from_str(json).unwrap();
        assert!(!cfg.sloppy_quorum);
        assert_eq!(cfg.lock_timeout_ms, 1000);
        assert_eq!(cfg.num_nodes(), 3);
    }

    #[test]
    fn cluster_config_roundtrips() {
        let cfg = ClusterConfig {
            node_addrs: vec!["127.0.0.1:4000".into(), "127.0.0.1:4001".into()],
            read_quorum_size: 1,
            write_quorum_size: 2,
            sloppy_quorum: true,
            lock_timeout_ms: 500,
            random_seed: Some(42),
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: ClusterConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg, back);
    }
}
