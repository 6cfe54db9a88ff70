//! # Error Taxonomy
//!
//! Fatal failure classes of the client. Every variant terminates the download:
//! nothing is retried and no connection is re-established.
//!
//! A piece whose hash does not match is deliberately absent from this list. It
//! is reported as a warning and the download goes on.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LeechError {
    /// Malformed torrent descriptor.
    #[error("invalid torrent: {0}")]
    Parse(String),

    /// Tracker failure reason, tracker protocol mismatch or unsupported scheme.
    #[error("tracker error: {0}")]
    Tracker(String),

    /// None of the candidate peers accepted a connection.
    #[error("could not connect to any peer: {0}")]
    Connect(String),

    /// Malformed or unexpected peer wire data.
    #[error("peer protocol error: {0}")]
    Protocol(String),
}
