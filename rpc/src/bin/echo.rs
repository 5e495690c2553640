//! Demo echo RPC client.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use clap::Parser;
use rpc::config::LoggingConfig;
use rpc::{Messenger, Proxy, logging};
use tracing::info;

#[derive(Parser)]
#[command(name = "echo")]
#[command(about = "Echo RPC client")]
struct Args {
    /// Server address
    server: SocketAddr,

    /// Payload to send
    #[arg(long, default_value = "hello")]
    message: String,

    /// Number of calls to make
    #[arg(long, default_value_t = 1)]
    count: usize,

    /// Per-call timeout in milliseconds (0 means no deadline)
    #[arg(long, default_value_t = 10_000)]
    timeout_ms: u64,
}

fn main() {
    let args = Args::parse();
    logging::init(&LoggingConfig::default());

    if let Err(e) = run(&args) {
        eprintln!("Call failed: {}", e);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let messenger = Messenger::builder("echo-client").num_reactors(1).build()?;
    let proxy = Proxy::new(&messenger, args.server, "echo");
    let timeout = Duration::from_millis(args.timeout_ms);

    for i in 0..args.count {
        let start = Instant::now();
        let reply = proxy.call("echo", args.message.as_bytes(), timeout)?;
        info!(
            "call {}: {} bytes echoed in {:?}",
            i,
            reply.len(),
            start.elapsed()
        );
    }

    messenger.shutdown();
    Ok(())
}
