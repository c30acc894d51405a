//! The replicated log.
//!
//! Indices are 1-based as in the Raft paper; index 0 means "before the log".
//! Every log starts with a term-0 entry at index 1 that carries no operation,
//! so `prev_log_index = 0` and `prev_log_index = 1` always have something to
//! compare against. That first entry is never truncated away.

use serde::{Deserialize, Serialize};

use crate::message::ClientOp;
use crate::types::{LogIndex, Term};

/// A single entry in the replicated log.
///
/// `op` is `None` only for the seed entry at index 1.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub term: Term,
    pub op: Option<ClientOp>,
}

impl Entry {
    fn seed() -> Self {
        Self {
            term: Term::ZERO,
            op: None,
        }
    }
}

/// Ordered sequence of entries with the 1-based access discipline.
#[derive(Clone, Debug)]
pub struct Log {
    entries: Vec<Entry>,
}

impl Log {
    pub fn new() -> Self {
        Self {
            entries: vec![Entry::seed()],
        }
    }

    /// Entry at 1-based index `i`, or `None` when `i` is 0 or past the tail.
    pub fn get(&self, i: LogIndex) -> Option<&Entry> {
        self.entries.get(i.to_array_index()?)
    }

    /// Term of the entry at `i`. Index 0 reports term 0, the virtual entry
    /// before the log, so AppendEntries consistency checks need no special
    /// case at the head. Returns `None` past the tail.
    pub fn term_at(&self, i: LogIndex) -> Option<Term> {
        match i.to_array_index() {
            None => Some(Term::ZERO),
            Some(idx) => self.entries.get(idx).map(|e| e.term),
        }
    }

    pub fn append_one(&mut self, entry: Entry) {
        self.entries.push(entry);
    }

    pub fn append_many(&mut self, entries: Vec<Entry>) {
        self.entries.extend(entries);
    }

    /// Keep only the first `len` entries.
    ///
    /// A no-op when `len ≥ size`. Callers only ever pass a leader's
    /// `prev_log_index`, so the seed entry survives any truncation that is
    /// immediately followed by appending the leader's entries from index 1.
    pub fn truncate_to(&mut self, len: LogIndex) {
        let len = len.get() as usize;
        if len < self.entries.len() {
            self.entries.truncate(len);
        }
    }

    /// Entries at indices `i..=size`. Empty when `i == size + 1`.
    pub fn from(&self, i: LogIndex) -> Vec<Entry> {
        let idx = i
            .to_array_index()
            .unwrap_or_else(|| panic!("log range must start at index 1 or later, got {i}"));
        self.entries.get(idx..).unwrap_or_default().to_vec()
    }

    /// Number of entries, counting the seed entry.
    pub fn size(&self) -> LogIndex {
        LogIndex::from_length(self.entries.len())
    }

    pub fn last_term(&self) -> Term {
        self.entries.last().map_or(Term::ZERO, |e| e.term)
    }
}

impl Default for Log {
    fn default() -> Self {
        Self::new()
    }
}
