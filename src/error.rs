//! Crate-wide error type.
//!
//! Consensus disagreements are not errors; they are handled inside the
//! protocol (`success=false` replies, vote denials). This type covers the
//! failures that escape a handler: I/O on the wire, frames we cannot parse,
//! and misuse of the node by whatever is driving it. The dispatcher and the
//! periodic loops log these and keep going; only a broken internal invariant
//! (a panic) terminates the process.

use std::io;

use crate::types::NodeId;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Misuse of the node by a peer or the harness: double init, a message
    /// before init, a reply nobody is waiting for, a request without msg_id.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("no handler registered for message type '{0}'")]
    UnknownType(String),

    #[error("handler already registered for message type '{0}'")]
    DuplicateHandler(&'static str),

    #[error("node id not assigned yet; dropping frame for {0}")]
    Uninitialized(NodeId),
}

pub type Result<T> = std::result::Result<T, Error>;
