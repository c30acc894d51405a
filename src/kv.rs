//! The key-value state machine.
//!
//! This is what Raft replicates: every node applies the same committed
//! operations in the same order and converges to the same map. Application
//! is total: an operation that cannot be satisfied produces an `error`
//! response body, never a failure.

use std::collections::HashMap;

use serde_json::Value;

use crate::message::{code, OpKind, Payload};

/// In-memory map from string keys to opaque JSON values.
#[derive(Default)]
pub struct KvStore {
    data: HashMap<String, Value>,
}

impl KvStore {
    pub fn new() -> Self {
        Self {
            data: HashMap::new(),
        }
    }

    /// Apply one operation, returning the response body payload for the
    /// client that issued it.
    pub fn apply(&mut self, op: &OpKind) -> Payload {
        match op {
            OpKind::Read { key } => match self.data.get(key) {
                Some(value) => Payload::ReadOk {
                    value: value.clone(),
                },
                None => not_found(),
            },
            OpKind::Write { key, value } => {
                self.data.insert(key.clone(), value.clone());
                Payload::WriteOk
            }
            OpKind::Cas { key, from, to } => match self.data.get(key) {
                None => not_found(),
                Some(actual) if actual != from => Payload::Error {
                    code: code::PRECONDITION_FAILED,
                    text: format!("expected {}, had {}", plain(from), plain(actual)),
                },
                Some(_) => {
                    self.data.insert(key.clone(), to.clone());
                    Payload::CasOk
                }
            },
        }
    }
}

fn not_found() -> Payload {
    Payload::Error {
        code: code::KEY_NOT_FOUND,
        text: "not found".to_string(),
    }
}

/// Render a JSON value the way a client wrote it, without quoting strings,
/// so a CAS mismatch on `"old"` reads `expected old, had new`.
fn plain(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
