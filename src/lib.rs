//! Raft consensus over a line-delimited JSON wire.
//!
//! Based on:
//! - "In Search of an Understandable Consensus Algorithm" (Ongaro & Ousterhout)
//! - Diego Ongaro's PhD dissertation
//!
//! One process is one node of a replicated key-value store. A test harness
//! assigns identity with an init message on stdin and then drives the
//! cluster by exchanging frames between nodes and clients; this crate
//! implements everything in between: elections, log replication, commit
//! tracking, and a deterministic key-value state machine answering `read`,
//! `write`, and `cas`.
//!
//! State is held in memory only; a node that dies takes its term, vote,
//! and log with it.

pub mod clock;
pub mod cluster;
pub mod error;
pub mod kv;
pub mod log;
pub mod message;
pub mod node;
pub mod server;
pub mod state;
pub mod transport;
pub mod types;

pub use error::{Error, Result};
pub use log::{Entry, Log};
pub use message::{
    AppendEntries, AppendEntriesResponse, Body, ClientOp, Envelope, OpKind, Payload, RequestVote,
    RequestVoteResponse,
};
pub use node::{majority, Node, TimerConfig};
pub use types::{LogIndex, NodeId, Term};
