//! Core type definitions shared across the crate.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Monotonically increasing term number.
///
/// Terms act as logical clocks in Raft and are used to detect stale information.
/// Term 0 represents the initial state before any election.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Term(u64);

impl Term {
    pub const ZERO: Self = Self(0);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub const fn increment(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

impl From<u64> for Term {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// 1-based index into the replicated log.
///
/// Index 0 represents "before the first entry" and is used as the
/// `prev_log_index` of an AppendEntries that starts at the head of the log.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogIndex(u64);

impl LogIndex {
    pub const ZERO: Self = Self(0);
    pub const FIRST: Self = Self(1);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    pub const fn prev(self) -> Self {
        Self(self.0.saturating_sub(1))
    }

    /// Step back one index without ever going below 1.
    ///
    /// Used for AppendEntries back-off: a leader probing for the match point
    /// must keep index 1 in range, since that is the first entry any log has.
    pub const fn retreat(self) -> Self {
        if self.0 <= 1 {
            Self(1)
        } else {
            Self(self.0 - 1)
        }
    }

    /// Index `count` entries past this one.
    pub const fn advance(self, count: u64) -> Self {
        Self(self.0 + count)
    }

    /// Create from an array length (0-based length becomes 1-based index).
    pub fn from_length(len: usize) -> Self {
        Self(len as u64)
    }

    /// Convert to a 0-based array index. Returns `None` for index 0.
    pub const fn to_array_index(self) -> Option<usize> {
        if self.0 == 0 {
            None
        } else {
            Some((self.0 - 1) as usize)
        }
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "I{}", self.0)
    }
}

impl From<u64> for LogIndex {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Unique identifier for a peer on the wire.
///
/// Peers are named by the harness that drives the cluster: nodes look like
/// `"n1"`, clients like `"c3"`. The id is opaque to the consensus core.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}
