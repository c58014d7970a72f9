use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use transdb_common::ClusterConfig;
use transdb_server::{Server, ServerConfig};

/// Runs one HTTP-fronted node cluster: reads the quorum/replication
/// topology from `--cluster`, then serves GET/PUT/DELETE /keys/:key on
/// `--listen`, submitting each request to an in-process quorum of nodes.
#[derive(Parser, Debug)]
#[command(name = "transdb-server")]
struct Args {
    /// Address the HTTP front door binds to.
    #[arg(long)]
    listen: SocketAddr,

    /// Path to a JSON file containing the cluster's `ClusterConfig`
    /// (node addresses, read/write quorum sizes, sloppy-quorum flag).
    #[arg(long)]
    cluster: PathBuf,

    /// Serve reads via the fast-read path (best value seen within the
    /// lock-free reply window) instead of always locking a full quorum.
    #[arg(long, default_value_t = false)]
    fast_reads: bool,

    /// Directory to persist committed writes under (one subdirectory per
    /// node). Omit for an in-memory-only cluster.
    #[arg(long)]
    persistent_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let cluster: ClusterConfig = serde_json::from_str(&std::fs::read_to_string(&args.cluster)?)?;

    let config = ServerConfig {
        address: args.listen,
        cluster,
        fast_reads: args.fast_reads,
        persistent_dir: args.persistent_dir,
    };

    let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();

    // Print "Listening on <addr>" once the server signals it is bound.
    tokio::spawn(async move {
        if let Ok(addr) = ready_rx.await {
            println!("Listening on {}", addr);
        }
    });

    Server::new(config).run(ready_tx).await?;
    Ok(())
}
