//! Process orchestration: wire the transport, node, and timers together.
//!
//! Three activities cooperate, all serialized on the node's mutex:
//! the stdin dispatcher (this thread), the maintenance loop, and the
//! election loop. The loops never exit; the dispatcher runs until stdin
//! closes, which is how the harness retires a node.

use std::io::{self, BufRead};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use crate::clock::SystemClock;
use crate::error::Result;
use crate::message::Envelope;
use crate::node::{Node, TimerConfig};
use crate::transport::Transport;

/// How often the election loop re-checks a deadline that moved while it
/// was asleep.
const ELECTION_POLL: Duration = Duration::from_millis(50);

/// A running node: frames on stdin/stdout, periodic loops on threads.
pub struct Server {
    node: Arc<Node>,
    config: TimerConfig,
}

impl Server {
    pub fn start(config: TimerConfig) -> Result<Self> {
        let transport = Arc::new(Transport::new(Box::new(io::stdout())));
        let node = Arc::new(Node::new(transport, Arc::new(SystemClock), config));
        node.register()?;
        Ok(Self { node, config })
    }

    /// Run until stdin closes. Individual frame failures (unparseable
    /// lines, protocol misuse) are logged and skipped; the node carries on.
    pub fn run(&self) -> Result<()> {
        self.spawn_maintenance_loop();
        self.spawn_election_loop();

        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Envelope>(&line) {
                Ok(frame) => {
                    if let Err(e) = self.node.transport().dispatch(frame) {
                        warn!(error = %e, "inbound frame dropped");
                    }
                }
                Err(e) => warn!(error = %e, "unparseable frame"),
            }
        }

        info!("stdin closed, dispatcher exiting");
        Ok(())
    }

    fn spawn_maintenance_loop(&self) {
        let node = Arc::clone(&self.node);
        let interval = self.config.tick_interval;
        thread::spawn(move || loop {
            thread::sleep(interval);
            if let Err(e) = node.maintenance_tick() {
                warn!(error = %e, "maintenance tick failed");
            }
        });
    }

    fn spawn_election_loop(&self) {
        let node = Arc::clone(&self.node);
        thread::spawn(move || loop {
            let wait = node.until_election_deadline();
            if wait.is_zero() {
                if let Err(e) = node.election_tick() {
                    warn!(error = %e, "election tick failed");
                }
            } else {
                // Deadlines can be re-randomized to an earlier instant, so
                // never sleep past a short poll interval.
                thread::sleep(wait.min(ELECTION_POLL));
            }
        });
    }
}
