//! Demo echo RPC server.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use rpc::config::MessengerConfig;
use rpc::{EchoService, ServicePool, logging};
use tracing::info;

#[derive(Parser)]
#[command(name = "echod")]
#[command(about = "Echo RPC server")]
struct Args {
    /// Path to configuration file
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:7050")]
    listen: SocketAddr,

    /// Service worker threads
    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Service queue length
    #[arg(long, default_value_t = 256)]
    queue: usize,
}

fn main() {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => match MessengerConfig::load(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Failed to load config: {}", e);
                std::process::exit(1);
            }
        },
        None => MessengerConfig::default(),
    };

    logging::init(&config.logging);

    if let Err(e) = run(&config, &args) {
        eprintln!("Server error: {}", e);
        std::process::exit(1);
    }
}

fn run(config: &MessengerConfig, args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let messenger = config.builder().build()?;
    messenger.register_service(
        "echo",
        ServicePool::new(Arc::new(EchoService), args.queue, args.workers),
    );
    let bound = messenger.add_acceptor(args.listen)?;
    info!(
        "{}: serving echo on {} with {} reactors",
        messenger.name(),
        bound,
        config.num_reactors
    );

    // The reactors carry all the work; this thread just reports liveness.
    loop {
        std::thread::sleep(Duration::from_secs(60));
        let metrics = messenger.metrics()?;
        info!(
            "{}: {} accepted, {} server connections open",
            messenger.name(),
            metrics.connections_accepted,
            metrics.num_server_connections
        );
    }
}
