//! `transdb-simulate`: drives the node cluster directly over the
//! simulated network, with no HTTP front door, so the failure scheduler
//! and partitions from the network layer are actually exercised rather
//! than hidden behind a single always-up process. Mirrors the wiring
//! `transdb_server::Server::build_cluster` does for the HTTP server, but
//! adds the latency/failure-injection knobs a live deployment has no use
//! for and a production `Server` therefore never sets.

use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::info;

use transdb_common::{decode, Message};
use transdb_server::config::{ClusterParams, DEFAULT_NUM_RETRIES, NODE_LOCK_TIMEOUT};
use transdb_server::cluster::ClusterHandle;
use transdb_server::elector::{Elector, NoopElector, RingElector};
use transdb_server::network::{FailureScheduler, Network, SimNetwork};
use transdb_server::node;
use transdb_server::propagator::Propagator;
use transdb_server::repeater::Repeater;
use transdb_server::store::{MemoryStore, PersistentStore, Store};

use transdb_stress_tests::history::{History, OpKind, OpOutcome, OpRecord};
use transdb_stress_tests::worker::generate_value;

/// CLI surface covering every field of the simulation parameters table.
#[derive(Parser, Debug)]
#[command(name = "transdb-simulate", about = "Run the quorum protocol directly over a simulated network")]
struct Args {
    /// Number of nodes.
    #[arg(long, default_value_t = 5)]
    n: u32,

    /// PRNG seed shared by the network, failure scheduler, and nodes.
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Mean transaction rate, per second.
    #[arg(long, default_value_t = 100.0)]
    rate: f64,

    /// Mean simulated network latency, in milliseconds.
    #[arg(long, default_value_t = 5.0)]
    latencymean: f64,

    /// Variance of the simulated network latency, in milliseconds.
    #[arg(long, default_value_t = 2.0)]
    latencyvar: f64,

    /// Mean fail events per 100 simulated seconds. 0 disables failure injection.
    #[arg(long, default_value_t = 0.0)]
    failurerate: f64,

    /// Mean recovery delay after a fail event, in seconds.
    #[arg(long, default_value_t = 5.0)]
    failuremean: f64,

    /// Variance of the recovery delay, in seconds.
    #[arg(long, default_value_t = 1.0)]
    failurevar: f64,

    /// Number of transactions to run.
    #[arg(long, default_value_t = 2000)]
    t: u64,

    /// Fraction of transactions that are writes (the rest are reads).
    #[arg(long, default_value_t = 0.3)]
    w: f64,

    /// Use a disk-backed store instead of in-memory.
    #[arg(long, default_value_t = false)]
    persistent: bool,

    /// Read quorum size.
    #[arg(long, default_value_t = 3)]
    vr: usize,

    /// Write quorum size.
    #[arg(long, default_value_t = 3)]
    vw: usize,

    /// Client retry cap.
    #[arg(long, default_value_t = 3)]
    numattempts: u32,

    /// Enable the sloppy-quorum propagator.
    #[arg(long, default_value_t = false)]
    sloppy: bool,

    /// Run the convergence check after the load phase (implies --sloppy).
    #[arg(long, default_value_t = false)]
    convergence: bool,

    /// Log every write as it's issued.
    #[arg(long, default_value_t = false)]
    logwrites: bool,

    /// Distinct keys in the key space driven by the workload.
    #[arg(long, default_value_t = 200)]
    key_space: usize,

    /// How long to wait for the propagator to converge before checking, in seconds.
    #[arg(long, default_value_t = 2.0)]
    convergence_wait_secs: f64,
}

impl Args {
    fn cluster_params(&self) -> ClusterParams {
        ClusterParams {
            num_nodes: self.n,
            random_seed: self.seed,
            read_quorum_size: self.vr,
            write_quorum_size: self.vw,
            sloppy: self.sloppy || self.convergence,
            fast_reads: false,
            persistent: self.persistent,
            num_attempts: self.numattempts,
            mean_latency_ms: self.latencymean,
            latency_var: self.latencyvar,
            failure_rate_per_100s: self.failurerate,
            failure_recovery_mean_secs: self.failuremean,
            failure_recovery_var_secs: self.failurevar,
            logwrites: self.logwrites,
        }
    }
}

/// Everything kept alive for the duration of the run, plus the raw
/// per-node handles the HTTP server has no need for but a simulation
/// does: direct store access (to check propagator convergence) and
/// direct elector access (to check election liveness).
struct SimCluster {
    handle: ClusterHandle,
    network: Arc<SimNetwork>,
    stores: Vec<Arc<dyn Store>>,
    electors: Vec<Arc<dyn Elector>>,
    _persistent_dir: Option<tempfile::TempDir>,
}

fn bridge_to_network(network: Arc<dyn Network>) -> mpsc::Sender<Message> {
    let (tx, mut rx) = mpsc::channel::<Message>(1024);
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            network.send(msg);
        }
    });
    tx
}

fn build_cluster(params: &ClusterParams) -> SimCluster {
    let n = params.num_nodes;
    let (client_tx, client_rx) = mpsc::channel::<Message>(1024);

    let mut node_txs = Vec::with_capacity(n as usize);
    let mut node_rxs = Vec::with_capacity(n as usize);
    for _ in 0..n {
        let (tx, rx) = mpsc::channel(1024);
        node_txs.push(tx);
        node_rxs.push(rx);
    }

    let network = Arc::new(SimNetwork::new(node_txs.clone(), params.mean_latency_ms, params.latency_var, params.random_seed));
    let network_dyn: Arc<dyn Network> = network.clone();

    let persistent_dir = if params.persistent {
        Some(tempfile::tempdir().expect("create persistent-store tempdir"))
    } else {
        None
    };

    let mut stores = Vec::with_capacity(n as usize);
    let mut electors: Vec<Arc<dyn Elector>> = Vec::with_capacity(n as usize);

    for (id, rx) in node_rxs.into_iter().enumerate() {
        let id = id as u32;
        let store: Arc<dyn Store> = match &persistent_dir {
            Some(dir) => Arc::new(PersistentStore::open(dir.path().join(format!("node-{id}"))).expect("open persistent store")),
            None => Arc::new(MemoryStore::new()),
        };
        stores.push(store.clone());

        let repeater = Repeater::new(bridge_to_network(network_dyn.clone()), NODE_LOCK_TIMEOUT, DEFAULT_NUM_RETRIES);

        let propagator = Arc::new(Propagator::new(id, n, params.read_quorum_size, bridge_to_network(network_dyn.clone())));
        propagator.clone().spawn_tick_loop();

        let elector: Arc<dyn Elector> = if params.write_quorum_size <= 1 {
            Arc::new(NoopElector::new(id))
        } else {
            Arc::new(RingElector::new(id, n, bridge_to_network(network_dyn.clone()), NODE_LOCK_TIMEOUT))
        };
        electors.push(elector.clone());

        let node = node::Node::new(
            id,
            n,
            params.read_quorum_size,
            params.write_quorum_size,
            params.fast_reads,
            params.sloppy,
            NODE_LOCK_TIMEOUT,
            params.random_seed,
            store,
            repeater,
            propagator,
            elector,
            network_dyn.clone(),
            client_tx.clone(),
        );

        node::spawn_timer(node_txs[id as usize].clone(), id, NODE_LOCK_TIMEOUT);
        tokio::spawn(node::run(node, rx));
    }

    if params.failure_rate_per_100s > 0.0 {
        Arc::new(FailureScheduler::new(
            n,
            params.failure_rate_per_100s,
            params.failure_recovery_mean_secs,
            params.failure_recovery_var_secs,
            network.clone(),
            node_txs.clone(),
            params.random_seed,
        ))
        .spawn();
    }

    let handle = ClusterHandle::new(node_txs, client_rx, params.num_attempts.max(1), NODE_LOCK_TIMEOUT * 3);

    SimCluster { handle, network, stores, electors, _persistent_dir: persistent_dir }
}

/// Runs `t` transactions, pacing submissions at `rate` per second and
/// letting them complete concurrently, recording each into a `History`
/// for the post-run correctness check.
async fn run_workload(cluster: &SimCluster, args: &Args) -> (History, Option<(String, u64)>) {
    let interval = Duration::from_secs_f64(if args.rate > 0.0 { 1.0 / args.rate } else { 0.0 });
    let mut records: Vec<OpRecord> = Vec::with_capacity(args.t as usize);
    let mut joins = JoinSet::new();

    for i in 0..args.t {
        let handle = cluster.handle.clone();
        let key = format!("key_{}", i as usize % args.key_space);
        let is_write = rand::thread_rng().gen_bool(args.w.clamp(0.0, 1.0));
        let logwrites = args.logwrites;

        joins.spawn(async move {
            let start = std::time::Instant::now();
            let (kind, outcome) = if is_write {
                let value = generate_value(&mut rand::thread_rng());
                let outcome = match handle.put(&key, value.clone(), None).await {
                    Ok(version) => {
                        if logwrites {
                            info!(key = %key, version, "write committed");
                        }
                        OpOutcome::PutOk { version, value }
                    }
                    Err(_) => OpOutcome::Error,
                };
                (OpKind::Put, outcome)
            } else {
                let outcome = match handle.get(&key).await {
                    Ok((Some(value), version)) => OpOutcome::GetOk { version, value },
                    Ok((None, _)) => OpOutcome::NotFound,
                    Err(transdb_common::TransDbError::KeyNotFound(_)) => OpOutcome::NotFound,
                    Err(_) => OpOutcome::Error,
                };
                (OpKind::Get, outcome)
            };
            let end = std::time::Instant::now();
            (key, kind, outcome, start, end)
        });

        if !interval.is_zero() {
            tokio::time::sleep(interval).await;
        }
    }

    while let Some(joined) = joins.join_next().await {
        let Ok((key, kind, outcome, start, end)) = joined else { continue };
        records.push(OpRecord { client_start_ts: start, client_ack_ts: end, key, kind, outcome });
    }

    // The write whose ack landed last, by wall-clock time, is the one
    // "no newer Put follows" refers to for the convergence check.
    let last_write = records
        .iter()
        .filter(|r| matches!(r.outcome, OpOutcome::PutOk { .. }))
        .max_by_key(|r| r.client_ack_ts)
        .map(|r| match &r.outcome {
            OpOutcome::PutOk { version, .. } => (r.key.clone(), *version),
            _ => unreachable!(),
        });

    (History(records), last_write)
}

/// Property 4: once a Put is acknowledged and no newer Put follows, every
/// live node should eventually store a value at timestamp >= T. Reads
/// every node's raw local store directly rather than through the quorum
/// protocol, since that's the only way to observe a single node's view.
async fn check_convergence(cluster: &SimCluster, key: &str, expected_ts: u64, wait: Duration) -> bool {
    tokio::time::sleep(wait).await;
    let mut ok = true;
    for (id, store) in cluster.stores.iter().enumerate() {
        if cluster.network.is_failed(id as u32) {
            continue;
        }
        let seen = store.get(key.as_bytes()).and_then(|framed| decode(&framed));
        match seen {
            Some((ts, _)) if ts >= expected_ts => {}
            other => {
                tracing::warn!(node_id = id, ?other, expected_ts, "node has not converged on latest write");
                ok = false;
            }
        }
    }
    ok
}

/// Property 5: with fewer than all nodes failed, every live node's
/// elector should agree on the same non-negative leader id within a
/// bounded number of polls.
async fn check_election_liveness(cluster: &SimCluster) -> bool {
    if cluster.electors.len() <= 1 {
        return true;
    }
    for _ in 0..20 {
        let live: Vec<i64> = cluster
            .electors
            .iter()
            .enumerate()
            .filter(|(id, _)| !cluster.network.is_failed(*id as u32))
            .map(|(_, e)| e.leader())
            .collect();
        if !live.is_empty() && live.iter().all(|&l| l == live[0]) && live[0] >= 0 {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let params = args.cluster_params();

    if !params.is_well_formed() {
        eprintln!("Configuration is not well-formed: write quorum {} must exceed n/2 for n={}", params.write_quorum_size, params.num_nodes);
        process::exit(3);
    }
    if args.vr > params.num_nodes as usize || args.vw > params.num_nodes as usize {
        eprintln!("vr and vw must each be <= n");
        process::exit(3);
    }

    println!(
        "Simulating {} nodes, vr={} vw={} sloppy={} strict={} seed={}",
        params.num_nodes,
        params.read_quorum_size,
        params.write_quorum_size,
        params.sloppy,
        params.is_strict_quorum(),
        params.random_seed,
    );

    let cluster = build_cluster(&params);

    println!("Running {} transactions at ~{}/s ({}% writes)", args.t, args.rate, (args.w * 100.0) as u32);
    let (history, last_write) = run_workload(&cluster, &args).await;

    let violations = history.check_correctness();
    let fatal_violations: Vec<_> = violations
        .iter()
        .filter(|v| !matches!(v.kind, transdb_stress_tests::history::ViolationKind::StaleDataReturned { .. }))
        .collect();

    println!("Transactions completed: {}", history.0.len());
    println!("Correctness violations: {} (fatal: {})", violations.len(), fatal_violations.len());
    for v in &fatal_violations {
        println!("  VIOLATION key={} version={}", v.key, v.version);
    }

    let mut exit_code = if fatal_violations.is_empty() { 0 } else { 2 };

    if args.convergence {
        match last_write {
            Some((key, version)) => {
                let wait = Duration::from_secs_f64(args.convergence_wait_secs);
                let converged = check_convergence(&cluster, &key, version, wait).await;
                println!("Convergence check: {}", if converged { "PASS" } else { "FAIL" });
                if !converged && exit_code == 0 {
                    exit_code = 1;
                }
            }
            None => println!("Convergence check: skipped (no writes were issued)"),
        }
    }

    if params.write_quorum_size > 1 {
        let elected = check_election_liveness(&cluster).await;
        println!("Election liveness check: {}", if elected { "PASS" } else { "FAIL" });
        if !elected && exit_code == 0 {
            exit_code = 1;
        }
    }

    println!("Result: {}", if exit_code == 0 { "PASS" } else { "FAIL" });
    process::exit(exit_code);
}
