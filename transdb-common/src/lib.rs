mod codec;
mod errors;
mod message;
mod topology;

pub use codec::{decode, encode};
pub use errors::{Result, TransDbError};
pub use message::{Message, MessageKind, NodeId, Txid, NO_TXID};
pub use topology::{ClusterConfig, Topology};

/// Maximum key size in bytes.
pub const MAX_KEY_SIZE: usize = 1024;

/// Maximum value size in bytes (4 MiB).
pub const MAX_VALUE_SIZE: usize = 4 * 1024 * 1024;

/// Simple error payload shape returned by the HTTP layer.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
