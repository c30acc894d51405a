//! Role state.
//!
//! Each role carries exactly the bookkeeping that is only meaningful while
//! holding that role. Promotion creates it, demotion drops it, and there
//! is no way to read a `next_index` on a node that is not the leader.

use std::collections::{HashMap, HashSet};

use crate::types::{LogIndex, NodeId};

/// Candidate state - actively collecting votes.
pub struct Candidate {
    /// Peers that granted their vote this term, ourselves included.
    pub votes: HashSet<NodeId>,
}

/// Leader state - replication bookkeeping per peer.
pub struct Leader {
    /// Next log index to send to each peer.
    pub next_index: HashMap<NodeId, LogIndex>,
    /// Highest log index known replicated on each peer.
    pub match_index: HashMap<NodeId, LogIndex>,
}

/// The node's role, with role-specific state attached.
pub enum Role {
    /// Pre-init: identity not assigned yet, all traffic is premature.
    Nascent,
    Follower,
    Candidate(Candidate),
    Leader(Leader),
}

impl Role {
    pub fn name(&self) -> &'static str {
        match self {
            Role::Nascent => "nascent",
            Role::Follower => "follower",
            Role::Candidate(_) => "candidate",
            Role::Leader(_) => "leader",
        }
    }

    pub fn is_leader(&self) -> bool {
        matches!(self, Role::Leader(_))
    }
}
