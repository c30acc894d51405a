//! Frame transport over line-delimited JSON.
//!
//! Outbound frames are one JSON object per line on the injected writer
//! (stdout in production). Writes are serialized by a lock, so a frame is
//! never interleaved with another; `send` only ever blocks on the local
//! write buffer, which is why callers may hold the node lock across it.
//!
//! Inbound frames are handed to [`Transport::dispatch`] by whoever owns the
//! read side. Dispatch resolves a frame in priority order: a pending RPC
//! callback keyed by `in_reply_to`, then a handler registered for the
//! body's `type`, otherwise the frame is a protocol error. Callbacks and
//! handlers run with no transport lock held.

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::trace;

use crate::error::{Error, Result};
use crate::message::{Body, Envelope};
use crate::types::NodeId;

/// Handler for a message type. Registered once, fires for every frame of
/// that type.
pub type TypeHandler = Arc<dyn Fn(Envelope) -> Result<()> + Send + Sync>;

/// Callback for one RPC response. Fires exactly once, then is dropped.
pub type RpcCallback = Box<dyn FnOnce(Envelope) -> Result<()> + Send>;

pub struct Transport {
    /// Our own peer id; assigned once by the init message.
    node_id: OnceLock<NodeId>,
    next_msg_id: AtomicU64,
    out: Mutex<Box<dyn Write + Send>>,
    pending: Mutex<HashMap<u64, RpcCallback>>,
    handlers: Mutex<HashMap<&'static str, TypeHandler>>,
}

impl Transport {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            node_id: OnceLock::new(),
            next_msg_id: AtomicU64::new(0),
            out: Mutex::new(out),
            pending: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
        }
    }

    /// Record this node's identity. Set exactly once, during init.
    pub fn set_node_id(&self, id: NodeId) -> Result<()> {
        self.node_id
            .set(id)
            .map_err(|id| Error::Protocol(format!("node id already assigned, rejecting {id}")))
    }

    /// Register a handler for a message type. Registering the same type
    /// twice is a bug in the caller.
    pub fn on(&self, type_name: &'static str, handler: TypeHandler) -> Result<()> {
        let mut handlers = self.handlers.lock();
        if handlers.contains_key(type_name) {
            return Err(Error::DuplicateHandler(type_name));
        }
        handlers.insert(type_name, handler);
        Ok(())
    }

    /// Enqueue one outbound frame.
    pub fn send(&self, dest: NodeId, body: Body) -> Result<()> {
        let src = match self.node_id.get() {
            Some(id) => id.clone(),
            None => return Err(Error::Uninitialized(dest)),
        };
        self.write_frame(&Envelope { src, dest, body })
    }

    /// Send `body` to the sender of `req`, correlated by its `msg_id`.
    pub fn reply(&self, req: &Envelope, mut body: Body) -> Result<()> {
        let msg_id = req.body.msg_id.ok_or_else(|| {
            Error::Protocol(format!(
                "cannot reply to '{}' from {}: request has no msg_id",
                req.body.payload.type_name(),
                req.src
            ))
        })?;
        body.in_reply_to = Some(msg_id);
        self.send(req.src.clone(), body)
    }

    /// Send a request with a fresh `msg_id` and register `callback` to fire
    /// when the matching response arrives.
    pub fn rpc(&self, dest: NodeId, mut body: Body, callback: RpcCallback) -> Result<()> {
        let msg_id = self.next_msg_id.fetch_add(1, Ordering::Relaxed) + 1;
        body.msg_id = Some(msg_id);
        self.pending.lock().insert(msg_id, callback);

        if let Err(e) = self.send(dest, body) {
            // Never fire a callback for a request that was never sent.
            self.pending.lock().remove(&msg_id);
            return Err(e);
        }
        Ok(())
    }

    /// Route one inbound frame to its callback or handler.
    pub fn dispatch(&self, frame: Envelope) -> Result<()> {
        if let Some(reply_to) = frame.body.in_reply_to {
            let callback = self.pending.lock().remove(&reply_to);
            if let Some(callback) = callback {
                trace!(msg_id = reply_to, "rpc response");
                return callback(frame);
            }
        }

        let type_name = frame.body.payload.type_name();
        let handler = self.handlers.lock().get(type_name).cloned();
        match handler {
            Some(handler) => handler(frame),
            None => Err(Error::UnknownType(type_name.to_string())),
        }
    }

    fn write_frame(&self, frame: &Envelope) -> Result<()> {
        let line = serde_json::to_string(frame)?;
        let mut out = self.out.lock();
        out.write_all(line.as_bytes())?;
        out.write_all(b"\n")?;
        out.flush()?;
        Ok(())
    }
}

/// A `Write` sink that captures frames in memory.
///
/// The simulated cluster and the unit tests hand one of these to
/// [`Transport::new`] and read the frames back out, exercising the same
/// serialization path that production uses for stdout.
#[derive(Clone, Default)]
pub struct MemorySink {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and drain every complete frame written so far.
    pub fn drain(&self) -> Result<Vec<Envelope>> {
        let bytes = std::mem::take(&mut *self.buf.lock());
        let text = String::from_utf8_lossy(&bytes);
        text.lines()
            .filter(|line| !line.is_empty())
            .map(|line| serde_json::from_str(line).map_err(Error::from))
            .collect()
    }
}

impl Write for MemorySink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buf.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
