//! Courier: a reactor-based RPC messenger.
//!
//! A [`Messenger`] owns a set of reactors, each pairing a thread-safe façade
//! with a single-threaded event loop that owns every socket assigned to it.
//! Foreign threads (acceptors, client proxies, metrics callers) submit work
//! as tasks on a reactor's pending queue and wake the loop; the loop drains
//! tasks in submission order, drives non-blocking connection I/O, and ages
//! out idle server connections on a coarse timer. Connection negotiation is
//! the one blocking step and runs on a dedicated worker pool, re-entering
//! the loop with its outcome.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use rpc::{EchoService, Messenger, Proxy, ServicePool};
//!
//! # fn main() -> rpc::Result<()> {
//! let server = Messenger::builder("server").build()?;
//! server.register_service("echo", ServicePool::new(Arc::new(EchoService), 64, 2));
//! let addr = server.add_acceptor("127.0.0.1:0".parse().unwrap())?;
//!
//! let client = Messenger::builder("client").build()?;
//! let proxy = Proxy::new(&client, addr, "echo");
//! let reply = proxy.call("echo", b"hello", Duration::from_secs(10))?;
//! assert_eq!(&reply[..], b"hello");
//!
//! client.shutdown();
//! server.shutdown();
//! # Ok(())
//! # }
//! ```

mod acceptor;
pub mod call;
mod connection;
pub mod config;
pub mod error;
mod executor;
mod frame;
pub mod logging;
pub mod messenger;
pub mod metrics;
mod negotiation;
mod reactor;
pub mod service;

pub use call::{CallHandle, ConnectionId, InboundCall, Proxy, UserCredentials};
pub use config::MessengerConfig;
pub use error::{Result, RpcError};
pub use messenger::{Messenger, MessengerBuilder};
pub use metrics::{MessengerMetrics, ReactorMetrics};
pub use service::{EchoService, Service, ServicePool};
