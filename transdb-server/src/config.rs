use std::time::Duration;

/// How long a tombstone entry lives before the TTL mechanism may expire it (seconds).
pub const TOMBSTONE_TTL_SECS: u64 = 3600;

/// Default timeout a coordinator gives a participant to respond to a
/// lock/get/put/unlock request before it times that step out, used when
/// no `lock_timeout_ms` is configured (e.g. the simulation binary). A
/// running cluster's actual value is `ClusterConfig::lock_timeout_ms`,
/// threaded through `Node`; coordinator client-writes there get 3x this
/// as their timeout, per spec "Lock-timeout semantics".
pub const NODE_LOCK_TIMEOUT: Duration = Duration::from_millis(300);

/// Number of times the repeater resends a request before giving up
/// (unless sent with `unlimited = true`).
pub const DEFAULT_NUM_RETRIES: u32 = 5;

/// How many of the most recent `unlockTxids` entries a node retains, to
/// guard against an unlock arriving before its matching lock.
pub const UNLOCK_TXIDS_WINDOW: usize = 50;

/// Cluster-wide configuration driving the quorum protocol and, when
/// running as a simulation, the simulated network and failure
/// scheduler.
#[derive(Debug, Clone)]
pub struct ClusterParams {
    pub num_nodes: u32,
    pub random_seed: u64,
    pub read_quorum_size: usize,
    pub write_quorum_size: usize,
    pub sloppy: bool,
    pub fast_reads: bool,
    pub persistent: bool,
    pub num_attempts: u32,
    pub mean_latency_ms: f64,
    pub latency_var: f64,
    pub failure_rate_per_100s: f64,
    pub failure_recovery_mean_secs: f64,
    pub failure_recovery_var_secs: f64,
    pub logwrites: bool,
}

impl Default for ClusterParams {
    fn default() -> Self {
        ClusterParams {
            num_nodes: 1,
            random_seed: 0,
            read_quorum_size: 1,
            write_quorum_size: 1,
            sloppy: false,
            fast_reads: false,
            persistent: false,
            num_attempts: 3,
            mean_latency_ms: 0.0,
            latency_var: 0.0,
            failure_rate_per_100s: 0.0,
            failure_recovery_mean_secs: 5.0,
            failure_recovery_var_secs: 1.0,
            logwrites: false,
        }
    }
}

impl ClusterParams {
    /// `vw > n/2` is the well-formedness condition any configuration
    /// must satisfy; strictness (`vr + vw > n`) is a caller choice, not
    /// enforced here.
    pub fn is_well_formed(&self) -> bool {
        self.write_quorum_size as u32 * 2 > self.num_nodes && self.write_quorum_size >= 1 && self.read_quorum_size >= 1
    }

    pub fn is_strict_quorum(&self) -> bool {
        (self.read_quorum_size + self.write_quorum_size) as u32 > self.num_nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_formedness_requires_write_majority() {
        let mut params = ClusterParams { num_nodes: 5, write_quorum_size: 2, ..Default::default() };
        assert!(!params.is_well_formed());
        params.write_quorum_size = 3;
        assert!(params.is_well_formed());
    }

    #[test]
    fn strict_quorum_detection() {
        let params = ClusterParams { num_nodes: 5, read_quorum_size: 3, write_quorum_size: 3, ..Default::default() };
        assert!(params.is_strict_quorum());
        let sloppy = ClusterParams { num_nodes: 5, read_quorum_size: 2, write_quorum_size: 3, ..Default::default() };
        assert!(!sloppy.is_strict_quorum());
    }
}
