use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::process::{Child, Command};
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;
use transdb_common::{ClusterConfig, Topology};

pub struct ServerProcess {
    child: Child,
    pub addr: SocketAddr,
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        self.child.kill().ok();
    }
}

pub struct Cluster {
    pub server: ServerProcess,
    pub topology: Topology,
    pub cluster_config: ClusterConfig,
    // Kept alive so the cluster-config file remains on disk until the process exits.
    _tmpfile: NamedTempFile,
}

/// Reserve `count` free TCP ports by binding to port 0 for each, then
/// releasing them all at once.  Holding all listeners alive until the ports
/// are collected prevents the same port from being issued twice and reduces
/// the TOCTOU window between releasing and the caller binding.
pub fn pick_free_ports(count: usize) -> Vec<u16> {
    let listeners: Vec<std::net::TcpListener> = (0..count)
        .map(|_| std::net::TcpListener::bind("127.0.0.1:0").unwrap())
        .collect();
    let ports = listeners.iter().map(|l| l.local_addr().unwrap().port()).collect();
    drop(listeners);
    ports
}

/// Return the path to the `transdb-server` binary that sits alongside this
/// executable in `target/debug/` (or `target/debug/deps/` when run as a test).
fn server_binary_path() -> PathBuf {
    let mut path = std::env::current_exe().expect("cannot determine own executable path");
    path.pop(); // remove own filename
    if path.file_name().map(|n| n == "deps").unwrap_or(false) {
        path.pop(); // step out of target/debug/deps → target/debug/
    }
    path.push("transdb-server");
    path
}

const READY_TIMEOUT: Duration = Duration::from_secs(30);
/// Nodes in the in-process simulated cluster the spawned server hosts
/// behind its single HTTP listener. `node_addrs` entries are placeholders
/// (the simulated network doesn't dial out over TCP); only their count,
/// via `ClusterConfig::num_nodes`, matters to `Server::build_cluster`.
const SIMULATED_NODE_COUNT: usize = 3;

impl Cluster {
    /// Build the `transdb-server` binary, spawn it fronting an in-process
    /// `SIMULATED_NODE_COUNT`-node quorum cluster, wait until it is ready
    /// to serve HTTP, and return the live `Cluster`.
    ///
    /// Returns `Err` if the build fails, the process cannot be spawned, or
    /// the readiness deadline elapses.  The caller should map this error to
    /// exit code 3 as documented in the CLI spec.
    pub fn build_and_spawn() -> Result<Self, String> {
        // 1. Build the server binary.
        let status = Command::new("cargo")
            .args(["build", "-p", "transdb-server"])
            .status()
            .map_err(|e| format!("Failed to invoke cargo build: {e}"))?;
        if !status.success() {
            return Err(format!("cargo build -p transdb-server failed: {status}"));
        }

        let ports = pick_free_ports(1);
        let addr: SocketAddr = format!("127.0.0.1:{}", ports[0]).parse().unwrap();

        let cluster_config = ClusterConfig {
            node_addrs: (0..SIMULATED_NODE_COUNT).map(|i| format!("sim-node-{i}")).collect(),
            read_quorum_size: 2,
            write_quorum_size: 2,
            sloppy_quorum: true,
            lock_timeout_ms: 1000,
            random_seed: None,
        };

        // 2. Write the cluster config JSON to a temp file; the file stays alive inside Cluster.
        let tmpfile =
            NamedTempFile::new().map_err(|e| format!("Failed to create cluster config tmpfile: {e}"))?;
        serde_json::to_writer(&tmpfile, &cluster_config)
            .map_err(|e| format!("Failed to write cluster config JSON: {e}"))?;

        let server_bin = server_binary_path();
        let config_path = tmpfile.path().to_str().unwrap().to_string();

        // 3. Spawn the server.
        let child = Command::new(&server_bin)
            .args(["--listen", &addr.to_string(), "--cluster", &config_path])
            .spawn()
            .map_err(|e| format!("Failed to spawn transdb-server: {e}"))?;
        let server = ServerProcess { child, addr };

        // 4. Poll for HTTP readiness. If this fails, `server` drops here, killing the process.
        let deadline = Instant::now() + READY_TIMEOUT;
        poll_until_ready(server.addr, deadline).map_err(|e| format!("Server not ready within timeout: {e}"))?;

        let topology = Topology { primary_addr: addr.to_string(), replica_addr: None };

        Ok(Cluster { server, topology, cluster_config, _tmpfile: tmpfile })
    }
}

/// Poll `addr` with a TCP connect attempt until the connection succeeds
/// (server is accepting connections) or `deadline` is reached.
///
/// A successful TCP connection is sufficient to confirm the HTTP server is
/// ready: our axum-based server starts accepting the moment it binds, so
/// a successful `connect` implies it will also answer HTTP requests.
fn poll_until_ready(addr: SocketAddr, deadline: Instant) -> Result<(), String> {
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(format!("timed out waiting for {addr}"));
        }
        let probe = Duration::min(remaining, Duration::from_millis(200));
        if TcpStream::connect_timeout(&addr, probe).is_ok() {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}
