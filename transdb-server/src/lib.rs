use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, RwLock};
use transdb_common::{ClusterConfig, ErrorResponse, TransDbError, MAX_KEY_SIZE, MAX_VALUE_SIZE};

pub mod cluster;
pub mod config;
pub mod elector;
pub mod network;
pub mod node;
pub mod propagator;
pub mod queue;
pub mod repeater;
pub mod store;

use cluster::ClusterHandle;
use config::TOMBSTONE_TTL_SECS;
use elector::{Elector, NoopElector, RingElector};
use network::{Network, SimNetwork};
use propagator::Propagator;
use repeater::Repeater;
use store::{MemoryStore, PersistentStore, Store};

/// Abstraction over current time for testability.
pub trait Clock: Send + Sync {
    fn unix_now_secs(&self) -> u64;
}

/// Production clock backed by `SystemTime`.
pub struct SystemClock;

impl Clock for SystemClock {
    fn unix_now_secs(&self) -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum HttpMethod {
    Put,
    Delete,
}

#[derive(Clone, Debug)]
pub struct IdempotencyRecord {
    pub method: HttpMethod,
    pub key_path: String,
    pub etag: Option<u64>,
    pub created_at: Instant,
}

/// HTTP-boundary metadata that rides alongside the quorum-replicated
/// value but isn't itself replicated: a key marked `deleted` answers GET
/// with 404 regardless of what the cluster still holds for it, and
/// `expires_at` (set via `X-TTL`) makes GET add `X-Expired: true` once
/// past due. Kept as a coordinator-local convenience on top of the
/// distributed store rather than folded into the replicated value.
#[derive(Clone, Debug, Default)]
struct SideMeta {
    deleted: bool,
    expires_at: Option<u64>,
}

#[derive(Clone)]
pub struct AppState {
    cluster: ClusterHandle,
    clock: Arc<dyn Clock>,
    idempotency_cache: Arc<RwLock<HashMap<String, IdempotencyRecord>>>,
    side: Arc<RwLock<HashMap<String, SideMeta>>>,
}

impl AppState {
    /// Test-only constructor: a single-node, in-memory, no-latency cluster
    /// (`vr = vw = 1`, so every client request takes the direct local-write
    /// shortcut in `node::Node` rather than touching the simulated
    /// network), with an injectable clock for TTL assertions.
    pub fn new_for_test(clock: Arc<dyn Clock>) -> Self {
        let mut state = Server::build_cluster(&ServerConfig {
            address: "127.0.0.1:0".parse().unwrap(),
            cluster: ClusterConfig {
                node_addrs: vec!["127.0.0.1:0".to_string()],
                read_quorum_size: 1,
                write_quorum_size: 1,
                sloppy_quorum: false,
                lock_timeout_ms: 1000,
                random_seed: Some(1),
            },
            fast_reads: false,
            persistent_dir: None,
        });
        state.clock = clock;
        state
    }
}

/// Server-wide configuration: HTTP listen address plus the cluster's
/// quorum/replication parameters.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub address: SocketAddr,
    pub cluster: ClusterConfig,
    pub fast_reads: bool,
    pub persistent_dir: Option<std::path::PathBuf>,
}

/// TransDB server: hosts an in-process cluster of [`node::Node`] actors
/// (wired together over [`SimNetwork`], giving every deployment the same
/// failure-injection hooks used by the stress/simulation harness) behind
/// one HTTP listener. Splitting the cluster across real OS processes is
/// explicitly out of scope here — see `DESIGN.md`.
pub struct Server {
    config: ServerConfig,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    pub fn address(&self) -> SocketAddr {
        self.config.address
    }

    /// Spins up the node cluster (stores, repeaters, propagators,
    /// electors, the simulated network) and returns an `AppState` whose
    /// `cluster` handle fans client requests out across it.
    pub fn build_cluster(config: &ServerConfig) -> AppState {
        let n = config.cluster.num_nodes() as u32;
        let (client_tx, client_rx) = mpsc::channel::<transdb_common::Message>(1024);

        let mut node_txs = Vec::with_capacity(n as usize);
        let mut node_rxs = Vec::with_capacity(n as usize);
        for _ in 0..n {
            let (tx, rx) = mpsc::channel(1024);
            node_txs.push(tx);
            node_rxs.push(rx);
        }

        let network: Arc<dyn Network> = Arc::new(SimNetwork::new(node_txs.clone(), 0.0, 0.0, config.cluster.random_seed.unwrap_or(0)));
        let lock_timeout = std::time::Duration::from_millis(config.cluster.lock_timeout_ms);

        for (id, rx) in node_rxs.into_iter().enumerate() {
            let id = id as u32;
            let store: Arc<dyn Store> = match &config.persistent_dir {
                Some(dir) => {
                    let node_dir = dir.join(format!("node-{id}"));
                    Arc::new(PersistentStore::open(node_dir).expect("open persistent store"))
                }
                None => Arc::new(MemoryStore::new()),
            };

            let repeater = Repeater::new(bridge_to_network(network.clone()), lock_timeout, config::DEFAULT_NUM_RETRIES);

            let propagator = Arc::new(Propagator::new(id, n, config.cluster.read_quorum_size, bridge_to_network(network.clone())));
            propagator.clone().spawn_tick_loop();

            let elector: Arc<dyn Elector> = if config.cluster.write_quorum_size <= 1 {
                Arc::new(NoopElector::new(id))
            } else {
                Arc::new(RingElector::new(id, n, bridge_to_network(network.clone()), lock_timeout))
            };

            let node = node::Node::new(
                id,
                n,
                config.cluster.read_quorum_size,
                config.cluster.write_quorum_size,
                config.fast_reads,
                config.cluster.sloppy_quorum,
                lock_timeout,
                config.cluster.random_seed.unwrap_or(0),
                store,
                repeater,
                propagator,
                elector,
                network.clone(),
                client_tx.clone(),
            );

            node::spawn_timer(node_txs[id as usize].clone(), id, lock_timeout);
            tokio::spawn(node::run(node, rx));
        }

        let cluster = ClusterHandle::new(
            node_txs,
            client_rx,
            config.cluster.read_quorum_size.max(1) as u32 + 2,
            lock_timeout * 3,
        );

        AppState {
            cluster,
            clock: Arc::new(SystemClock),
            idempotency_cache: Arc::new(RwLock::new(HashMap::new())),
            side: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn create_router_with_state(state: AppState) -> Router {
        Router::new()
            .route("/keys/:key", get(handle_get).put(handle_put).delete(handle_delete))
            // Allow bodies up to MAX_VALUE_SIZE + 1 so our handler can validate and return 400;
            // axum's default 2MB limit would otherwise return 413 for oversized values.
            .layer(DefaultBodyLimit::max(MAX_VALUE_SIZE + 1))
            .with_state(state)
    }

    pub async fn run(self, ready_tx: tokio::sync::oneshot::Sender<SocketAddr>) -> Result<(), Box<dyn std::error::Error>> {
        let state = Self::build_cluster(&self.config);
        let app = Self::create_router_with_state(state);
        let listener = tokio::net::TcpListener::bind(self.config.address).await?;
        let local_addr = listener.local_addr()?;
        ready_tx.send(local_addr).ok();
        axum::serve(listener, app).await?;
        Ok(())
    }
}

/// Repeater/propagator/elector each hand off outgoing messages through a
/// plain `mpsc::Sender`; `Network::send` is a synchronous call. This bridges
/// the two by draining the channel into the network on a background task.
fn bridge_to_network(network: Arc<dyn Network>) -> mpsc::Sender<transdb_common::Message> {
    let (tx, mut rx) = mpsc::channel::<transdb_common::Message>(1024);
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            network.send(msg);
        }
    });
    tx
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ErrorResponse { error: message.into() })).into_response()
}

fn etag_value(version: u64) -> HeaderValue {
    HeaderValue::from_str(&format!("\"{}\"", version)).expect("valid ETag header value")
}

fn translate_error(err: TransDbError) -> Response {
    match err {
        TransDbError::KeyNotFound(k) => error_response(StatusCode::NOT_FOUND, format!("Key not found: {}", k)),
        TransDbError::Timeout => error_response(StatusCode::SERVICE_UNAVAILABLE, "Request timed out with no response"),
        TransDbError::LockDenied(k) => error_response(StatusCode::SERVICE_UNAVAILABLE, format!("Lock could not be acquired for key: {}", k)),
        TransDbError::StaleWrite { expected, actual } => {
            let mut response = error_response(
                StatusCode::CONFLICT,
                format!("Strong write rejected: expected timestamp {}, next is {}", expected, actual),
            );
            response.headers_mut().insert(header::ETAG, etag_value(actual));
            response
        }
        other => error_response(StatusCode::SERVICE_UNAVAILABLE, other.to_string()),
    }
}

fn extract_idempotency_key(headers: &HeaderMap) -> Result<String, Response> {
    headers
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .ok_or_else(|| error_response(StatusCode::BAD_REQUEST, "Idempotency-Key header is required"))
}

fn verify_and_build_cached(record: &IdempotencyRecord, key: &str, method: HttpMethod) -> Response {
    if record.method != method || record.key_path != key {
        return error_response(
            StatusCode::UNPROCESSABLE_ENTITY,
            "Idempotency-Key was already used for a different method or key path",
        );
    }
    let mut response = StatusCode::OK.into_response();
    if let Some(etag) = record.etag {
        response.headers_mut().insert(header::ETAG, etag_value(etag));
    }
    response
}

/// Handler for GET /keys/:key.
pub async fn handle_get(State(state): State<AppState>, Path(key): Path<String>) -> Response {
    if key.len() > MAX_KEY_SIZE {
        return error_response(StatusCode::BAD_REQUEST, format!("Key exceeds maximum size of {} bytes", MAX_KEY_SIZE));
    }

    let side = state.side.read().await.get(&key).cloned().unwrap_or_default();
    if side.deleted {
        return error_response(StatusCode::NOT_FOUND, format!("Key not found: {}", key));
    }

    match state.cluster.get(&key).await {
        Ok((Some(value), version)) => {
            let mut response = (StatusCode::OK, value).into_response();
            response.headers_mut().insert(header::ETAG, etag_value(version));
            if let Some(expires_at) = side.expires_at {
                if state.clock.unix_now_secs() >= expires_at {
                    response.headers_mut().insert("x-expired", HeaderValue::from_static("true"));
                }
            }
            response
        }
        Ok((None, _)) => error_response(StatusCode::NOT_FOUND, format!("Key not found: {}", key)),
        Err(TransDbError::KeyNotFound(_)) => error_response(StatusCode::NOT_FOUND, format!("Key not found: {}", key)),
        Err(e) => translate_error(e),
    }
}

/// Handler for PUT /keys/:key. Requires Idempotency-Key; accepts an
/// optional X-TTL header (absolute Unix epoch seconds) and an optional
/// `If-Match` header (expected current ETag) that turns the write into a
/// compare-and-swap dispatched as a `ClientStrongWriteRequest` — the HTTP
/// expression of the protocol's `StrongPut`.
pub async fn handle_put(State(state): State<AppState>, Path(key): Path<String>, headers: HeaderMap, body: Bytes) -> Response {
    if key.len() > MAX_KEY_SIZE {
        return error_response(StatusCode::BAD_REQUEST, format!("Key exceeds maximum size of {} bytes", MAX_KEY_SIZE));
    }
    if body.len() > MAX_VALUE_SIZE {
        return error_response(StatusCode::BAD_REQUEST, format!("Value exceeds maximum size of {} bytes", MAX_VALUE_SIZE));
    }

    let expires_at = match headers.get("x-ttl") {
        None => None,
        Some(v) => match v.to_str().ok().and_then(|s| s.parse::<u64>().ok()) {
            Some(ts) => Some(ts),
            None => return error_response(StatusCode::BAD_REQUEST, "X-TTL must be a non-negative integer"),
        },
    };

    let expected_version = match headers.get(header::IF_MATCH) {
        None => None,
        Some(v) => match v.to_str().ok().map(|s| s.trim_matches('"')).and_then(|s| s.parse::<u64>().ok()) {
            Some(ts) => Some(ts),
            None => return error_response(StatusCode::BAD_REQUEST, "If-Match must carry a numeric ETag"),
        },
    };

    let idempotency_key = match extract_idempotency_key(&headers) {
        Ok(k) => k,
        Err(r) => return r,
    };

    {
        let cache = state.idempotency_cache.read().await;
        if let Some(record) = cache.get(&idempotency_key) {
            return verify_and_build_cached(record, &key, HttpMethod::Put);
        }
    }

    let write = match expected_version {
        Some(expected) => state.cluster.strong_put(&key, body.to_vec(), expected).await,
        None => state.cluster.put(&key, body.to_vec(), Some(idempotency_key.clone())).await,
    };
    let version = match write {
        Ok(v) => v,
        Err(e) => return translate_error(e),
    };

    state.side.write().await.insert(key.clone(), SideMeta { deleted: false, expires_at });

    let record = IdempotencyRecord { method: HttpMethod::Put, key_path: key, etag: Some(version), created_at: Instant::now() };
    state.idempotency_cache.write().await.insert(idempotency_key, record);

    let mut response = StatusCode::OK.into_response();
    response.headers_mut().insert(header::ETAG, etag_value(version));
    response
}

/// Handler for DELETE /keys/:key (no-op if absent). Requires
/// Idempotency-Key. Marks the key tombstoned in the coordinator-local
/// side table; the underlying quorum-replicated value is left as-is
/// (the protocol proper has no delete primitive — see `DESIGN.md`).
pub async fn handle_delete(State(state): State<AppState>, Path(key): Path<String>, headers: HeaderMap) -> Response {
    if key.len() > MAX_KEY_SIZE {
        return error_response(StatusCode::BAD_REQUEST, format!("Key exceeds maximum size of {} bytes", MAX_KEY_SIZE));
    }

    let idempotency_key = match extract_idempotency_key(&headers) {
        Ok(k) => k,
        Err(r) => return r,
    };

    {
        let cache = state.idempotency_cache.read().await;
        if let Some(record) = cache.get(&idempotency_key) {
            return verify_and_build_cached(record, &key, HttpMethod::Delete);
        }
    }

    let already_deleted = state.side.read().await.get(&key).map(|m| m.deleted).unwrap_or(false);
    if already_deleted {
        return StatusCode::NO_CONTENT.into_response();
    }

    match state.cluster.get(&key).await {
        Ok((None, _)) | Err(TransDbError::KeyNotFound(_)) => return StatusCode::NO_CONTENT.into_response(),
        Ok(_) => {}
        Err(e) => return translate_error(e),
    }

    let version = match state.cluster.put(&key, Vec::new(), None).await {
        Ok(v) => v,
        Err(e) => return translate_error(e),
    };
    let now = state.clock.unix_now_secs();
    state.side.write().await.insert(key.clone(), SideMeta { deleted: true, expires_at: Some(now + TOMBSTONE_TTL_SECS) });

    let record = IdempotencyRecord { method: HttpMethod::Delete, key_path: key, etag: Some(version), created_at: Instant::now() };
    state.idempotency_cache.write().await.insert(idempotency_key, record);

    let mut response = StatusCode::OK.into_response();
    response.headers_mut().insert(header::ETAG, etag_value(version));
    response
}
