//! Simulated cluster for testing.
//!
//! Runs several nodes in one process with no threads and no real time:
//! every node writes frames into a captured sink, the cluster routes them
//! by `dest`, and a shared [`ManualClock`] stands in for the wall clock.
//! Election and maintenance ticks only run when a test calls them, so
//! every scenario (elections, failover, log repair, split votes) plays
//! out deterministically.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use tracing::warn;

use crate::clock::{Clock, ManualClock};
use crate::error::{Error, Result};
use crate::message::{Body, Envelope, Payload};
use crate::node::{Node, TimerConfig};
use crate::transport::{MemorySink, Transport};
use crate::types::NodeId;

struct Member {
    id: NodeId,
    node: Arc<Node>,
    sink: MemorySink,
}

/// An in-process cluster of `n1..nN` driven entirely by hand.
pub struct Cluster {
    members: Vec<Member>,
    clock: Arc<ManualClock>,
    config: TimerConfig,
    /// Members currently cut off from the network: frames to or from them
    /// are dropped on the floor.
    partitioned: HashSet<usize>,
    /// Frames addressed to peers outside the cluster, i.e. client replies.
    client_inbox: Vec<Envelope>,
    next_msg_id: u64,
}

impl Cluster {
    /// Build and initialize a cluster of `size` nodes.
    pub fn new(size: usize) -> Result<Self> {
        let clock = Arc::new(ManualClock::new());
        let config = TimerConfig::default();
        let ids: Vec<NodeId> = (1..=size).map(|i| NodeId::new(format!("n{i}"))).collect();

        let mut members = Vec::new();
        for id in &ids {
            let sink = MemorySink::new();
            let transport = Arc::new(Transport::new(Box::new(sink.clone())));
            let node = Arc::new(Node::new(
                transport,
                Arc::clone(&clock) as Arc<dyn Clock>,
                config,
            ));
            node.register()?;
            members.push(Member {
                id: id.clone(),
                node,
                sink,
            });
        }

        let mut cluster = Self {
            members,
            clock,
            config,
            partitioned: HashSet::new(),
            client_inbox: Vec::new(),
            next_msg_id: 0,
        };

        for index in 0..cluster.members.len() {
            let msg_id = cluster.fresh_msg_id();
            let id = cluster.members[index].id.clone();
            cluster.inject(
                index,
                Body {
                    msg_id: Some(msg_id),
                    in_reply_to: None,
                    payload: Payload::RaftInit {
                        node_id: id,
                        node_ids: ids.clone(),
                    },
                },
            )?;
        }
        cluster.deliver_all()?;
        cluster.client_inbox.clear(); // the raft_init_ok acks

        Ok(cluster)
    }

    pub fn node(&self, index: usize) -> &Arc<Node> {
        &self.members[index].node
    }

    /// Index of the current leader, if any member holds that role.
    pub fn leader(&self) -> Option<usize> {
        self.members.iter().position(|m| m.node.is_leader())
    }

    /// Count members in each role: (followers, candidates, leaders).
    pub fn role_counts(&self) -> (usize, usize, usize) {
        let mut counts = (0, 0, 0);
        for member in &self.members {
            if member.node.is_leader() {
                counts.2 += 1;
            } else if member.node.is_candidate() {
                counts.1 += 1;
            } else {
                counts.0 += 1;
            }
        }
        counts
    }

    /// Cut a member off: nothing in, nothing out, until healed.
    pub fn partition(&mut self, index: usize) {
        self.partitioned.insert(index);
    }

    pub fn heal(&mut self, index: usize) {
        self.partitioned.remove(&index);
    }

    /// Expire every election deadline and let member `index` campaign.
    /// Nobody else's timer fires; the cluster only moves when told to.
    pub fn elect(&mut self, index: usize) -> Result<()> {
        self.clock.advance(self.config.election_timeout * 2);
        self.members[index].node.election_tick()?;
        self.deliver_all()
    }

    /// Run one maintenance tick on every member, then route the fallout.
    pub fn tick_all(&mut self) -> Result<()> {
        for member in &self.members {
            member.node.maintenance_tick()?;
        }
        self.deliver_all()
    }

    /// Send a client operation to member `index` and pump the cluster until
    /// its response arrives, advancing the clock one heartbeat per round.
    pub fn client_request(&mut self, index: usize, payload: Payload) -> Result<Body> {
        let msg_id = self.fresh_msg_id();
        self.inject(
            index,
            Body {
                msg_id: Some(msg_id),
                in_reply_to: None,
                payload,
            },
        )?;
        self.deliver_all()?;

        for _ in 0..20 {
            if let Some(pos) = self
                .client_inbox
                .iter()
                .position(|f| f.body.in_reply_to == Some(msg_id))
            {
                return Ok(self.client_inbox.remove(pos).body);
            }
            self.clock.advance(self.config.heartbeat_interval);
            self.tick_all()?;
        }
        Err(Error::Protocol(format!(
            "no response to client request {msg_id}"
        )))
    }

    /// Route frames until the network is quiet. Handler errors are the
    /// dispatcher's business, not the router's: log and keep going, the way
    /// the production loop does.
    pub fn deliver_all(&mut self) -> Result<()> {
        loop {
            let mut in_flight = VecDeque::new();
            for (index, member) in self.members.iter().enumerate() {
                let frames = member.sink.drain()?;
                if self.partitioned.contains(&index) {
                    continue;
                }
                in_flight.extend(frames);
            }
            if in_flight.is_empty() {
                return Ok(());
            }

            while let Some(frame) = in_flight.pop_front() {
                match self.member_index(&frame.dest) {
                    Some(index) if self.partitioned.contains(&index) => {}
                    Some(index) => {
                        if let Err(e) = self.members[index].node.transport().dispatch(frame) {
                            warn!(error = %e, "frame dropped by handler");
                        }
                    }
                    None => self.client_inbox.push(frame),
                }
            }
        }
    }

    fn inject(&self, index: usize, body: Body) -> Result<()> {
        let member = &self.members[index];
        member.node.transport().dispatch(Envelope {
            src: NodeId::from("c1"),
            dest: member.id.clone(),
            body,
        })
    }

    fn member_index(&self, id: &NodeId) -> Option<usize> {
        self.members.iter().position(|m| m.id == *id)
    }

    fn fresh_msg_id(&mut self) -> u64 {
        self.next_msg_id += 1;
        self.next_msg_id
    }
}
