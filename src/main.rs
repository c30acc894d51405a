use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use raft_kv::node::TimerConfig;
use raft_kv::server::Server;

/// One node of a Raft-replicated key-value store, speaking line-delimited
/// JSON on stdin/stdout. Identity arrives in the harness's init message;
/// flags only tune the timers.
#[derive(Parser)]
struct Args {
    /// Base election timeout in milliseconds. Deadlines are drawn
    /// uniformly from [T, 2T).
    #[arg(long, default_value_t = 2000)]
    election_timeout_ms: u64,

    /// Leader heartbeat interval in milliseconds.
    #[arg(long, default_value_t = 1000)]
    heartbeat_interval_ms: u64,

    /// Maintenance tick interval in milliseconds.
    #[arg(long, default_value_t = 200)]
    tick_interval_ms: u64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Stdout belongs to the wire; all diagnostics go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = TimerConfig {
        election_timeout: Duration::from_millis(args.election_timeout_ms),
        heartbeat_interval: Duration::from_millis(args.heartbeat_interval_ms),
        tick_interval: Duration::from_millis(args.tick_interval_ms),
    };

    Server::start(config)?.run()?;
    Ok(())
}
