use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error types for TransDB operations.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransDbError {
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("HTTP {0}: {1}")]
    HttpError(u16, String),

    #[error("Key exceeds maximum size of {0} bytes")]
    KeyTooLarge(usize),

    #[error("Value exceeds maximum size of {0} bytes")]
    ValueTooLarge(usize),

    #[error("Server response missing ETag header")]
    MissingETag,

    /// The coordinator could not assemble a quorum before the client's retry
    /// budget or request timeout was exhausted.
    #[error("Lock could not be acquired for key: {0}")]
    LockDenied(String),

    /// No response was received from any contacted node within the client's
    /// per-attempt deadline. Distinct from `NetworkError`: the request may
    /// still have been applied server-side.
    #[error("Request timed out with no response")]
    Timeout,

    /// A StrongPut was rejected because the caller's expected timestamp did
    /// not match the timestamp the coordinator was about to assign.
    #[error("Strong write rejected: expected timestamp {expected}, next is {actual}")]
    StaleWrite { expected: u64, actual: u64 },

    /// An invariant the protocol relies on (e.g. two quorum members
    /// disagreeing on the value stored at an identical timestamp) was
    /// violated. Fatal to the transaction; never expected in a correct
    /// deployment.
    #[error("Protocol invariant violated: {0}")]
    ProtocolViolation(String),
}

/// Result type for TransDB operations.
pub type Result<T> = std::result::Result<T, TransDbError>;
