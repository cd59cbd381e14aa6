//! Error kinds surfaced by DHT operations.
//!
//! Only [`DhtError::NotFound`] and [`DhtError::Unimplemented`] escape the
//! top-level calls. The remaining kinds describe failures of a single peer
//! exchange; both lookups contain them and treat the peer as having yielded
//! no data, so a search degrades to fewer results instead of failing.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DhtError {
    /// The target peer could not be located after exhausting all candidates.
    #[error("peer not found")]
    NotFound,

    /// The operation is not supported by this node.
    #[error("not implemented")]
    Unimplemented,

    /// A wire message could not be decoded, or a stream ended mid-message.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// A single peer exchange exceeded its time budget.
    #[error("query timed out")]
    Timeout,

    /// Dialing or talking to a peer failed at the transport level.
    #[error("connection failure: {0}")]
    ConnectionFailure(anyhow::Error),
}
