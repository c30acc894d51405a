//! Wire message model.
//!
//! Every frame on stdin/stdout is one line of JSON:
//!
//! ```json
//! {"src":"n1","dest":"n2","body":{"type":"request_vote","msg_id":7,...}}
//! ```
//!
//! Bodies arrive untyped; they are parsed at the boundary into the closed
//! [`Payload`] enum so the consensus core only ever sees typed values.
//! `msg_id` is set on requests initiated by the sender, `in_reply_to` on
//! replies, and the pair is what the transport uses to correlate RPCs.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::log::Entry;
use crate::types::{LogIndex, NodeId, Term};

/// Error codes reported to clients.
pub mod code {
    /// The request landed on a node that is not the leader.
    pub const NOT_LEADER: u64 = 11;
    /// The key does not exist.
    pub const KEY_NOT_FOUND: u64 = 20;
    /// A compare-and-set found a value other than the expected one.
    pub const PRECONDITION_FAILED: u64 = 22;
}

/// One framed message: source peer, destination peer, body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub src: NodeId,
    pub dest: NodeId,
    pub body: Body,
}

/// A message body: optional correlation ids plus the typed payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Body {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<u64>,
    #[serde(flatten)]
    pub payload: Payload,
}

impl Body {
    /// A body with no correlation ids. The transport fills `msg_id` for
    /// RPCs and `in_reply_to` for replies.
    pub fn new(payload: Payload) -> Self {
        Self {
            msg_id: None,
            in_reply_to: None,
            payload,
        }
    }

    pub fn error(code: u64, text: impl Into<String>) -> Self {
        Self::new(Payload::Error {
            code,
            text: text.into(),
        })
    }
}

/// All message types that cross the wire, tagged by `body.type`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    RaftInit {
        node_id: NodeId,
        node_ids: Vec<NodeId>,
    },
    RaftInitOk,
    RequestVote(RequestVote),
    RequestVoteRes(RequestVoteResponse),
    AppendEntries(AppendEntries),
    AppendEntriesRes(AppendEntriesResponse),
    Read {
        key: String,
    },
    ReadOk {
        value: Value,
    },
    Write {
        key: String,
        value: Value,
    },
    WriteOk,
    Cas {
        key: String,
        from: Value,
        to: Value,
    },
    CasOk,
    Error {
        code: u64,
        text: String,
    },
}

impl Payload {
    /// The `type` tag this payload serializes under.
    pub fn type_name(&self) -> &'static str {
        match self {
            Payload::RaftInit { .. } => "raft_init",
            Payload::RaftInitOk => "raft_init_ok",
            Payload::RequestVote(_) => "request_vote",
            Payload::RequestVoteRes(_) => "request_vote_res",
            Payload::AppendEntries(_) => "append_entries",
            Payload::AppendEntriesRes(_) => "append_entries_res",
            Payload::Read { .. } => "read",
            Payload::ReadOk { .. } => "read_ok",
            Payload::Write { .. } => "write",
            Payload::WriteOk => "write_ok",
            Payload::Cas { .. } => "cas",
            Payload::CasOk => "cas_ok",
            Payload::Error { .. } => "error",
        }
    }
}

/// RequestVote RPC arguments.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestVote {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

/// RequestVote RPC response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

/// AppendEntries RPC arguments.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppendEntries {
    pub term: Term,
    pub leader_id: NodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<Entry>,
    pub leader_commit: LogIndex,
}

/// AppendEntries RPC response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
}

/// A client operation stamped into the log.
///
/// The leader records who asked (`client`) and which request this was
/// (`msg_id`) so the state machine can address the response once the entry
/// commits, possibly many ticks later.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientOp {
    pub client: NodeId,
    pub msg_id: u64,
    #[serde(flatten)]
    pub kind: OpKind,
}

/// The three operations the key-value store understands.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OpKind {
    Read {
        key: String,
    },
    Write {
        key: String,
        value: Value,
    },
    Cas {
        key: String,
        from: Value,
        to: Value,
    },
}

impl OpKind {
    /// Extract the operation from a client request payload, if it is one.
    pub fn from_payload(payload: &Payload) -> Option<Self> {
        match payload {
            Payload::Read { key } => Some(OpKind::Read { key: key.clone() }),
            Payload::Write { key, value } => Some(OpKind::Write {
                key: key.clone(),
                value: value.clone(),
            }),
            Payload::Cas { key, from, to } => Some(OpKind::Cas {
                key: key.clone(),
                from: from.clone(),
                to: to.clone(),
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_raft_init_frame() {
        let line = r#"{"src":"c0","dest":"n1","body":{"type":"raft_init","msg_id":1,"node_id":"n1","node_ids":["n1","n2","n3"]}}"#;
        let env: Envelope = serde_json::from_str(line).unwrap();

        assert_eq!(env.src, NodeId::from("c0"));
        assert_eq!(env.dest, NodeId::from("n1"));
        assert_eq!(env.body.msg_id, Some(1));
        let Payload::RaftInit { node_id, node_ids } = env.body.payload else {
            panic!("wrong variant");
        };
        assert_eq!(node_id, NodeId::from("n1"));
        assert_eq!(node_ids.len(), 3);
    }

    #[test]
    fn serializes_reply_with_in_reply_to() {
        let env = Envelope {
            src: NodeId::from("n1"),
            dest: NodeId::from("c2"),
            body: Body {
                msg_id: None,
                in_reply_to: Some(5),
                payload: Payload::WriteOk,
            },
        };

        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(
            value,
            json!({
                "src": "n1",
                "dest": "c2",
                "body": {"in_reply_to": 5, "type": "write_ok"}
            })
        );
    }

    #[test]
    fn append_entries_round_trip_with_ops() {
        let entry = Entry {
            term: Term::from(2),
            op: Some(ClientOp {
                client: NodeId::from("c1"),
                msg_id: 9,
                kind: OpKind::Cas {
                    key: "k".to_string(),
                    from: json!(1),
                    to: json!(2),
                },
            }),
        };
        let payload = Payload::AppendEntries(AppendEntries {
            term: Term::from(2),
            leader_id: NodeId::from("n1"),
            prev_log_index: LogIndex::from(3),
            prev_log_term: Term::from(1),
            entries: vec![entry],
            leader_commit: LogIndex::from(3),
        });

        let text = serde_json::to_string(&Body::new(payload)).unwrap();
        let back: Body = serde_json::from_str(&text).unwrap();
        let Payload::AppendEntries(ae) = back.payload else {
            panic!("wrong variant");
        };
        assert_eq!(ae.entries.len(), 1);
        let op = ae.entries[0].op.as_ref().unwrap();
        assert_eq!(op.client, NodeId::from("c1"));
        assert_eq!(op.msg_id, 9);
    }

    #[test]
    fn seed_entries_cross_the_wire() {
        let text = serde_json::to_string(&Entry {
            term: Term::ZERO,
            op: None,
        })
        .unwrap();
        let back: Entry = serde_json::from_str(&text).unwrap();
        assert_eq!(back.term, Term::ZERO);
        assert!(back.op.is_none());
    }

    #[test]
    fn type_names_match_wire_tags() {
        let payload = Payload::Read {
            key: "x".to_string(),
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["type"], payload.type_name());
    }
}
