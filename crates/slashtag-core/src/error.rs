//! Error types for slashtags

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Slashtag error types
///
/// Peer unreachability is deliberately absent: a connection that cannot be
/// established reports `false` from its `opened()` future instead.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed key, URL or unregistered local id
    #[error("invalid reference: {0}")]
    InvalidReference(String),

    /// Local id already bound to a different key
    #[error("local id already taken: {0}")]
    NameTaken(String),

    /// Protocol name registered twice
    #[error("protocol already registered: {0}")]
    DuplicateProtocol(String),

    /// Channel requested for a protocol that was never registered
    #[error("unknown protocol: {0}")]
    UnknownProtocol(String),

    /// Operation attempted after close
    #[error("closed")]
    Closed,

    /// Write attempted on a store without the secret key
    #[error("read-only")]
    ReadOnly,

    /// Path or document absent
    #[error("not found: {0}")]
    NotFound(String),

    /// Replication or discovery exceeded its bound
    #[error("timed out")]
    Timeout,

    /// Drive paths must be absolute
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Value does not match the declared message encoding
    #[error("encoding mismatch: expected {expected}, got {actual}")]
    EncodingMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    /// Block or message signature failed verification
    #[error("invalid signature")]
    InvalidSignature,

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    /// JSON document error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Backing storage failure
    #[error("storage error: {0}")]
    Storage(String),

    /// Overlay or stream failure surfaced to a caller
    #[error("transport error: {0}")]
    Transport(String),
}
