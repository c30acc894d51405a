//! The Raft consensus core.
//!
//! Based on:
//! - "In Search of an Understandable Consensus Algorithm" (Ongaro & Ousterhout)
//! - Diego Ongaro's PhD dissertation
//!
//! One node of a replicated key-value store. The node reacts to inbound
//! frames (votes, appends, client operations) and to two periodic drivers:
//! a maintenance tick that replicates, advances the commit index, and
//! applies committed entries, and an election tick that starts an election
//! when the randomized deadline passes without contact from a leader.
//!
//! All state lives behind a single non-reentrant mutex. A handler or tick
//! holds it for one logical transition (read, decide, write, emit), which
//! is safe because `Transport::send` is a local enqueue and never waits on
//! a peer. RPC callbacks that fire after a role or term change are filtered
//! by re-checking `(role, term)` under the same mutex.
//!
//! There is no durable storage: term, vote, and log all live in memory, and
//! a crashed node must rejoin as a fresh process at the harness's risk.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::kv::KvStore;
use crate::log::{Entry, Log};
use crate::message::{
    code, AppendEntries, AppendEntriesResponse, Body, ClientOp, Envelope, OpKind, Payload,
    RequestVote, RequestVoteResponse,
};
use crate::state::{Candidate, Leader, Role};
use crate::transport::Transport;
use crate::types::{LogIndex, NodeId, Term};

/// Timer configuration.
///
/// The election timeout is a base value T; actual deadlines are drawn
/// uniformly from `[T, 2T)` so concurrent candidates rarely collide twice.
#[derive(Clone, Copy)]
pub struct TimerConfig {
    pub election_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub tick_interval: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            election_timeout: Duration::from_millis(2000),
            heartbeat_interval: Duration::from_millis(1000),
            tick_interval: Duration::from_millis(200),
        }
    }
}

/// Smallest number of peers that constitutes a majority of `n`.
pub fn majority(n: usize) -> usize {
    n / 2 + 1
}

/// The value a majority of the cluster has reached: sort and take the
/// lower-biased middle. With `n` values, a majority of them are `>=` the
/// element at index `n - majority(n)`.
fn median(mut indices: Vec<LogIndex>) -> LogIndex {
    indices.sort_unstable();
    indices[indices.len() - majority(indices.len())]
}

struct State {
    role: Role,
    node_id: NodeId,
    node_ids: Vec<NodeId>,
    current_term: Term,
    voted_for: Option<NodeId>,
    log: Log,
    commit_index: LogIndex,
    /// Highest index applied to the key-value store. Starts at 1: the seed
    /// entry carries no operation and needs no application.
    last_applied: LogIndex,
    kv: KvStore,
    election_deadline: Instant,
    heartbeat_deadline: Instant,
}

impl State {
    fn new(now: Instant) -> Self {
        Self {
            role: Role::Nascent,
            node_id: NodeId::from(""),
            node_ids: Vec::new(),
            current_term: Term::ZERO,
            voted_for: None,
            log: Log::new(),
            commit_index: LogIndex::ZERO,
            last_applied: LogIndex::FIRST,
            kv: KvStore::new(),
            election_deadline: now,
            heartbeat_deadline: now,
        }
    }

    /// Every peer except ourselves.
    fn peers(&self) -> Vec<NodeId> {
        self.node_ids
            .iter()
            .filter(|id| **id != self.node_id)
            .cloned()
            .collect()
    }

    /// Raise the term. Votes are per-term, so the old vote is void.
    fn advance_term(&mut self, term: Term) {
        debug_assert!(term > self.current_term);
        self.current_term = term;
        self.voted_for = None;
    }

    /// If a peer has seen a higher term, adopt it and fall back to
    /// follower, dropping any candidate or leader bookkeeping.
    fn maybe_step_down(&mut self, remote_term: Term) {
        if remote_term > self.current_term {
            info!(
                term = %remote_term,
                was = self.role.name(),
                "saw higher term, stepping down to follower"
            );
            self.advance_term(remote_term);
            self.role = Role::Follower;
        }
    }
}

/// A single Raft node wired to a transport and a clock.
pub struct Node {
    transport: Arc<Transport>,
    clock: Arc<dyn Clock>,
    config: TimerConfig,
    state: Mutex<State>,
}

impl Node {
    pub fn new(transport: Arc<Transport>, clock: Arc<dyn Clock>, config: TimerConfig) -> Self {
        let now = clock.now();
        Self {
            transport,
            clock,
            config,
            state: Mutex::new(State::new(now)),
        }
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// Register this node's handlers on its transport.
    pub fn register(self: &Arc<Self>) -> Result<()> {
        let node = Arc::clone(self);
        self.transport
            .on("raft_init", Arc::new(move |frame| node.handle_init(frame)))?;

        let node = Arc::clone(self);
        self.transport.on(
            "request_vote",
            Arc::new(move |frame| node.handle_request_vote(frame)),
        )?;

        let node = Arc::clone(self);
        self.transport.on(
            "append_entries",
            Arc::new(move |frame| node.handle_append_entries(frame)),
        )?;

        for op in ["read", "write", "cas"] {
            let node = Arc::clone(self);
            self.transport
                .on(op, Arc::new(move |frame| node.handle_client_request(frame)))?;
        }
        Ok(())
    }

    // === Introspection ===

    pub fn is_leader(&self) -> bool {
        self.state.lock().role.is_leader()
    }

    pub fn is_candidate(&self) -> bool {
        matches!(self.state.lock().role, Role::Candidate(_))
    }

    pub fn current_term(&self) -> Term {
        self.state.lock().current_term
    }

    pub fn commit_index(&self) -> LogIndex {
        self.state.lock().commit_index
    }

    pub fn log_length(&self) -> LogIndex {
        self.state.lock().log.size()
    }

    /// Time left before the election deadline, saturating at zero.
    pub fn until_election_deadline(&self) -> Duration {
        let deadline = self.state.lock().election_deadline;
        deadline.saturating_duration_since(self.clock.now())
    }

    // === Inbound handlers ===

    /// Bootstrap: learn our identity and the cluster membership, then start
    /// life as a follower. Arriving twice is a protocol error.
    fn handle_init(&self, frame: Envelope) -> Result<()> {
        let Payload::RaftInit { node_id, node_ids } = &frame.body.payload else {
            return Err(unexpected("raft_init", &frame));
        };

        let mut guard = self.state.lock();
        let s = &mut *guard;
        if !matches!(s.role, Role::Nascent) {
            return Err(Error::Protocol(format!(
                "raft_init received twice (from {})",
                frame.src
            )));
        }

        self.transport.set_node_id(node_id.clone())?;
        s.node_id = node_id.clone();
        s.node_ids = node_ids.clone();
        s.role = Role::Follower;
        self.reset_election_deadline(s);

        info!(node = %s.node_id, cluster = s.node_ids.len(), "initialized, becoming follower");
        self.transport.reply(&frame, Body::new(Payload::RaftInitOk))
    }

    fn handle_request_vote(&self, frame: Envelope) -> Result<()> {
        let Payload::RequestVote(req) = &frame.body.payload else {
            return Err(unexpected("request_vote", &frame));
        };

        let mut guard = self.state.lock();
        let s = &mut *guard;
        if matches!(s.role, Role::Nascent) {
            return Err(premature(&frame));
        }

        s.maybe_step_down(req.term);

        // Grant iff the candidate's term is current, we have not voted for
        // anyone else this term, and its log is at least as up to date as
        // ours: a later last term wins outright, an equal last term needs at
        // least our log length.
        let up_to_date = req.last_log_term > s.log.last_term()
            || (req.last_log_term == s.log.last_term() && req.last_log_index >= s.log.size());
        let grant = req.term >= s.current_term
            && s.voted_for.as_ref().is_none_or(|v| *v == req.candidate_id)
            && up_to_date;

        if grant {
            s.voted_for = Some(req.candidate_id.clone());
            self.reset_election_deadline(s);
            info!(candidate = %req.candidate_id, term = %s.current_term, "granting vote");
        } else {
            debug!(candidate = %req.candidate_id, term = %req.term, "denying vote");
        }

        let response = RequestVoteResponse {
            term: s.current_term,
            vote_granted: grant,
        };
        self.transport
            .reply(&frame, Body::new(Payload::RequestVoteRes(response)))
    }

    fn handle_append_entries(&self, frame: Envelope) -> Result<()> {
        let Payload::AppendEntries(req) = &frame.body.payload else {
            return Err(unexpected("append_entries", &frame));
        };

        let mut guard = self.state.lock();
        let s = &mut *guard;
        if matches!(s.role, Role::Nascent) {
            return Err(premature(&frame));
        }

        s.maybe_step_down(req.term);

        // A stale leader gets a refusal and must not suppress our election
        // timer; only current leaders buy themselves quiet.
        if req.term < s.current_term {
            return self.reply_append(&frame, s.current_term, false);
        }
        self.reset_election_deadline(s);

        // We must agree on the entry preceding the batch.
        if req.prev_log_index > LogIndex::ZERO
            && s.log.term_at(req.prev_log_index) != Some(req.prev_log_term)
        {
            return self.reply_append(&frame, s.current_term, false);
        }

        // We agree on the prefix: everything after it is the leader's.
        s.log.truncate_to(req.prev_log_index);
        s.log.append_many(req.entries.clone());
        if !req.entries.is_empty() {
            debug!(
                leader = %req.leader_id,
                count = req.entries.len(),
                from = %req.prev_log_index.next(),
                "accepted entries"
            );
        }

        if req.leader_commit > s.commit_index {
            s.commit_index = req.leader_commit.min(s.log.size());
        }

        self.reply_append(&frame, s.current_term, true)
    }

    /// Client operations only make sense on the leader; everyone else sends
    /// the client back to look for one. The leader appends the stamped
    /// operation and answers later, once the entry commits and applies.
    fn handle_client_request(&self, frame: Envelope) -> Result<()> {
        let mut guard = self.state.lock();
        let s = &mut *guard;
        if !s.role.is_leader() {
            return self
                .transport
                .reply(&frame, Body::error(code::NOT_LEADER, "not a leader"));
        }

        let msg_id = frame.body.msg_id.ok_or_else(|| {
            Error::Protocol(format!(
                "client request '{}' from {} has no msg_id",
                frame.body.payload.type_name(),
                frame.src
            ))
        })?;
        let Some(kind) = OpKind::from_payload(&frame.body.payload) else {
            return Err(unexpected("read, write or cas", &frame));
        };

        let entry = Entry {
            term: s.current_term,
            op: Some(ClientOp {
                client: frame.src.clone(),
                msg_id,
                kind,
            }),
        };
        s.log.append_one(entry);
        debug!(client = %frame.src, index = %s.log.size(), "accepted client operation");
        Ok(())
    }

    // === Election ===

    /// Called by the election loop. Starts an election if the deadline has
    /// passed and we are in a role that may stand; leaders and uninitialized
    /// nodes just push the deadline out.
    pub fn election_tick(self: &Arc<Self>) -> Result<()> {
        let mut guard = self.state.lock();
        let s = &mut *guard;
        if self.clock.now() < s.election_deadline {
            return Ok(());
        }
        match s.role {
            Role::Follower | Role::Candidate(_) => self.become_candidate(s),
            Role::Leader(_) | Role::Nascent => {
                self.reset_election_deadline(s);
                Ok(())
            }
        }
    }

    fn become_candidate(self: &Arc<Self>, s: &mut State) -> Result<()> {
        let term = s.current_term.increment();
        s.advance_term(term);
        s.voted_for = Some(s.node_id.clone());

        let mut votes = HashSet::new();
        votes.insert(s.node_id.clone());
        s.role = Role::Candidate(Candidate { votes });
        self.reset_election_deadline(s);
        info!(term = %term, "election deadline passed, standing for election");

        let request = RequestVote {
            term,
            candidate_id: s.node_id.clone(),
            last_log_index: s.log.size(),
            last_log_term: s.log.last_term(),
        };
        for peer in s.peers() {
            let node = Arc::clone(self);
            self.transport.rpc(
                peer,
                Body::new(Payload::RequestVote(request.clone())),
                Box::new(move |frame| node.handle_vote_response(frame, term)),
            )?;
        }

        // A cluster of one is its own majority.
        if let Role::Candidate(candidate) = &s.role {
            if candidate.votes.len() >= majority(s.node_ids.len()) {
                self.become_leader(s);
            }
        }
        Ok(())
    }

    /// Fires once per vote request we sent. `vote_term` is the term we were
    /// campaigning in; anything that arrives after that term is over is
    /// stale and ignored.
    fn handle_vote_response(self: &Arc<Self>, frame: Envelope, vote_term: Term) -> Result<()> {
        let Payload::RequestVoteRes(res) = &frame.body.payload else {
            return Err(unexpected("request_vote_res", &frame));
        };

        let mut guard = self.state.lock();
        let s = &mut *guard;
        s.maybe_step_down(res.term);
        if vote_term != s.current_term || res.term != s.current_term {
            return Ok(());
        }

        let won = {
            let Role::Candidate(candidate) = &mut s.role else {
                return Ok(());
            };
            if !res.vote_granted {
                return Ok(());
            }
            candidate.votes.insert(frame.src.clone());
            debug!(from = %frame.src, votes = candidate.votes.len(), "vote received");
            candidate.votes.len() >= majority(s.node_ids.len())
        };
        if won {
            self.become_leader(s);
        }
        Ok(())
    }

    fn become_leader(&self, s: &mut State) {
        debug_assert!(matches!(s.role, Role::Candidate(_)));

        let next = s.log.size().next();
        let mut leader = Leader {
            next_index: Default::default(),
            match_index: Default::default(),
        };
        for peer in s.peers() {
            leader.next_index.insert(peer.clone(), next);
            leader.match_index.insert(peer, LogIndex::ZERO);
        }
        s.role = Role::Leader(leader);
        // Assert leadership on the next maintenance tick.
        s.heartbeat_deadline = self.clock.now();

        info!(term = %s.current_term, "won election, becoming leader");
    }

    // === Replication and application ===

    /// Called by the maintenance loop at every tick: push entries to peers,
    /// heartbeat if due, advance the commit index, apply what committed.
    pub fn maintenance_tick(self: &Arc<Self>) -> Result<()> {
        let mut guard = self.state.lock();
        let s = &mut *guard;
        self.replicate_log(s, false)?;
        if s.role.is_leader() && self.clock.now() >= s.heartbeat_deadline {
            self.replicate_log(s, true)?;
        }
        self.advance_commit_index(s);
        self.advance_state_machine(s)
    }

    /// Send AppendEntries to every peer that is behind, or to all of them
    /// when `force` is set, which is how heartbeats happen.
    fn replicate_log(self: &Arc<Self>, s: &mut State, force: bool) -> Result<()> {
        let mut batches = Vec::new();
        {
            let Role::Leader(leader) = &s.role else {
                return Ok(());
            };
            for peer in s.peers() {
                let Some(&ni) = leader.next_index.get(&peer) else {
                    continue;
                };
                if force || ni <= s.log.size() {
                    batches.push((peer, ni, s.log.from(ni)));
                }
            }
        }

        let sent = !batches.is_empty();
        for (peer, ni, entries) in batches {
            let count = entries.len() as u64;
            let request = AppendEntries {
                term: s.current_term,
                leader_id: s.node_id.clone(),
                prev_log_index: ni.prev(),
                prev_log_term: s.log.term_at(ni.prev()).unwrap_or(Term::ZERO),
                entries,
                leader_commit: s.commit_index,
            };
            debug!(peer = %peer, from = %ni, count, force, "replicating");

            let node = Arc::clone(self);
            let dest = peer.clone();
            let sent_term = s.current_term;
            self.transport.rpc(
                peer,
                Body::new(Payload::AppendEntries(request)),
                Box::new(move |frame| node.handle_append_response(frame, dest, ni, count, sent_term)),
            )?;
        }

        if sent {
            s.heartbeat_deadline = self.clock.now() + self.config.heartbeat_interval;
        }
        Ok(())
    }

    /// Fires once per AppendEntries we sent to `peer` starting at `ni` with
    /// `count` entries. Success moves the peer's indices forward; refusal
    /// walks `next_index` back one step, never below 1.
    fn handle_append_response(
        &self,
        frame: Envelope,
        peer: NodeId,
        ni: LogIndex,
        count: u64,
        sent_term: Term,
    ) -> Result<()> {
        let Payload::AppendEntriesRes(res) = &frame.body.payload else {
            return Err(unexpected("append_entries_res", &frame));
        };

        let mut guard = self.state.lock();
        let s = &mut *guard;
        s.maybe_step_down(res.term);
        if sent_term != s.current_term || res.term != s.current_term {
            return Ok(());
        }
        let Role::Leader(leader) = &mut s.role else {
            return Ok(());
        };

        if res.success {
            let next = leader.next_index.entry(peer.clone()).or_insert(LogIndex::FIRST);
            *next = (*next).max(ni.advance(count));
            let matched = leader.match_index.entry(peer.clone()).or_insert(LogIndex::ZERO);
            *matched = (*matched).max(ni.prev().advance(count));
            let matched = *matched;
            debug!(peer = %peer, matched = %matched, "replication acknowledged");
        } else if let Some(next) = leader.next_index.get_mut(&peer) {
            *next = next.retreat();
            let next = *next;
            debug!(peer = %peer, next = %next, "peer refused entries, backing off");
        }
        Ok(())
    }

    /// An index is committed once a majority of the cluster holds it. Per
    /// the Raft safety rule, only entries from the current term commit
    /// directly; older ones ride along beneath them.
    fn advance_commit_index(&self, s: &mut State) {
        let Role::Leader(leader) = &s.role else {
            return;
        };
        let mut indices: Vec<LogIndex> = leader.match_index.values().copied().collect();
        indices.push(s.log.size());

        let n = median(indices);
        if n > s.commit_index && s.log.term_at(n) == Some(s.current_term) {
            debug!(commit = %n, "advancing commit index");
            s.commit_index = n;
        }
    }

    /// Apply every committed-but-unapplied entry to the key-value store, in
    /// log order. Every node applies; only the leader answers clients.
    fn advance_state_machine(&self, s: &mut State) -> Result<()> {
        while s.last_applied < s.commit_index {
            s.last_applied = s.last_applied.next();
            let Some(entry) = s.log.get(s.last_applied) else {
                break;
            };
            let Some(op) = entry.op.clone() else {
                continue;
            };

            let response = s.kv.apply(&op.kind);
            debug!(index = %s.last_applied, client = %op.client, "applied");

            if s.role.is_leader() {
                let mut body = Body::new(response);
                body.in_reply_to = Some(op.msg_id);
                self.transport.send(op.client, body)?;
            }
        }
        Ok(())
    }

    // === Helpers ===

    fn reply_append(&self, frame: &Envelope, term: Term, success: bool) -> Result<()> {
        let response = AppendEntriesResponse { term, success };
        self.transport
            .reply(frame, Body::new(Payload::AppendEntriesRes(response)))
    }

    /// New randomized deadline in `[T, 2T)` from now.
    fn reset_election_deadline(&self, s: &mut State) {
        let base = self.config.election_timeout;
        let jitter = rand::rng().random_range(0..base.as_millis().max(1) as u64);
        s.election_deadline = self.clock.now() + base + Duration::from_millis(jitter);
    }

    #[cfg(test)]
    fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        f(&mut self.state.lock())
    }
}

fn unexpected(wanted: &str, frame: &Envelope) -> Error {
    Error::Protocol(format!(
        "expected {wanted}, got '{}' from {}",
        frame.body.payload.type_name(),
        frame.src
    ))
}

fn premature(frame: &Envelope) -> Error {
    Error::Protocol(format!(
        "'{}' from {} before raft_init",
        frame.body.payload.type_name(),
        frame.src
    ))
}
