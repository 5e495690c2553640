//! The messenger: owner of reactors, the negotiation pool, acceptors, and
//! the service registry.

use std::collections::HashMap;
use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::info;

use crate::acceptor::AcceptorPool;
use crate::call::OutboundCall;
use crate::error::{Result, RpcError};
use crate::executor::ThreadPool;
use crate::metrics::{CONNECTIONS_ACCEPTED, MessengerMetrics};
use crate::reactor::{Reactor, ReactorOptions};
use crate::service::ServicePool;

/// Cap on negotiation jobs waiting for a pool worker. Submissions beyond
/// this fail fast instead of piling up behind slow handshakes.
const NEGOTIATION_QUEUE_DEPTH: usize = 1024;

/// Configures and builds a [`Messenger`].
pub struct MessengerBuilder {
    name: String,
    num_reactors: usize,
    connection_keepalive_time: Duration,
    coarse_timer_granularity: Duration,
    server_negotiation_timeout: Duration,
    negotiation_threads: usize,
}

impl MessengerBuilder {
    pub fn new(name: impl Into<String>) -> MessengerBuilder {
        MessengerBuilder {
            name: name.into(),
            num_reactors: 4,
            connection_keepalive_time: Duration::from_secs(65),
            coarse_timer_granularity: Duration::from_millis(100),
            server_negotiation_timeout: Duration::from_millis(3000),
            negotiation_threads: 4,
        }
    }

    /// Number of reactor threads; connections are spread across them.
    pub fn num_reactors(mut self, n: usize) -> Self {
        self.num_reactors = n;
        self
    }

    /// How long a server connection may sit idle before the loop closes it.
    pub fn connection_keepalive_time(mut self, keepalive: Duration) -> Self {
        self.connection_keepalive_time = keepalive;
        self
    }

    /// Period of the loop's coarse tick. Bounds both idle-scan latency and
    /// the precision of the loop's cached clock.
    pub fn coarse_timer_granularity(mut self, granularity: Duration) -> Self {
        self.coarse_timer_granularity = granularity;
        self
    }

    /// Cap on how long the server negotiates with a new client.
    pub fn server_negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.server_negotiation_timeout = timeout;
        self
    }

    /// Worker threads performing blocking connection negotiation.
    pub fn negotiation_threads(mut self, n: usize) -> Self {
        self.negotiation_threads = n;
        self
    }

    pub fn build(self) -> Result<Messenger> {
        if self.num_reactors == 0 {
            return Err(RpcError::illegal_state("num_reactors must be at least 1"));
        }
        let core = Arc::new(MessengerCore {
            name: self.name.clone(),
            negotiation_pool: ThreadPool::new(
                &format!("{}-negotiator", self.name),
                self.negotiation_threads.max(1),
                NEGOTIATION_QUEUE_DEPTH,
            )
            .map_err(RpcError::from)?,
            services: Mutex::new(HashMap::new()),
            reactors: OnceLock::new(),
            acceptors: Mutex::new(Vec::new()),
            inbound_rr: AtomicUsize::new(0),
            closing: Mutex::new(false),
        });

        let options = ReactorOptions {
            connection_keepalive_time: self.connection_keepalive_time,
            coarse_timer_granularity: self.coarse_timer_granularity,
            server_negotiation_timeout: self.server_negotiation_timeout,
        };
        let mut reactors = Vec::with_capacity(self.num_reactors);
        for i in 0..self.num_reactors {
            let name = format!("{}_r{:03}", self.name, i);
            reactors.push(
                Reactor::new(name, core.clone(), options.clone()).map_err(RpcError::from)?,
            );
        }
        let _ = core.reactors.set(reactors);

        Ok(Messenger { core })
    }
}

/// Shared state owned by the messenger handle and, transitively, by every
/// reactor loop thread (each holds a strong reference it releases on exit).
pub(crate) struct MessengerCore {
    name: String,
    negotiation_pool: ThreadPool,
    services: Mutex<HashMap<String, ServicePool>>,
    reactors: OnceLock<Vec<Reactor>>,
    acceptors: Mutex<Vec<AcceptorPool>>,
    inbound_rr: AtomicUsize,
    closing: Mutex<bool>,
}

impl MessengerCore {
    pub(crate) fn negotiation_pool(&self) -> &ThreadPool {
        &self.negotiation_pool
    }

    pub(crate) fn service(&self, name: &str) -> Option<ServicePool> {
        self.services.lock().get(name).cloned()
    }

    fn reactors(&self) -> &[Reactor] {
        self.reactors.get().map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Cheap-to-clone handle to an RPC messenger.
///
/// A messenger must be shut down explicitly: reactor loop threads (and any
/// acceptors) keep the shared core alive until [`Messenger::shutdown`] runs.
#[derive(Clone)]
pub struct Messenger {
    core: Arc<MessengerCore>,
}

impl fmt::Debug for Messenger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Messenger").field("name", &self.core.name).finish()
    }
}

impl Messenger {
    pub fn builder(name: impl Into<String>) -> MessengerBuilder {
        MessengerBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Bind `addr` and start accepting inbound connections, spreading them
    /// across the reactors. Returns the bound address (useful with port 0).
    pub fn add_acceptor(&self, addr: SocketAddr) -> Result<SocketAddr> {
        if *self.core.closing.lock() {
            return Err(RpcError::illegal_state("messenger is shutting down"));
        }
        let pool = AcceptorPool::new(
            format!("{}-acceptor", self.core.name),
            addr,
            self.clone(),
        )?;
        let bound = pool.bind_address();
        self.core.acceptors.lock().push(pool);
        Ok(bound)
    }

    /// Make `pool` serve calls addressed to `service_name`.
    pub fn register_service(&self, service_name: impl Into<String>, pool: ServicePool) {
        self.core.services.lock().insert(service_name.into(), pool);
    }

    /// Stop routing calls to `service_name`. The pool itself keeps running
    /// until its own shutdown.
    pub fn unregister_service(&self, service_name: &str) -> Result<()> {
        match self.core.services.lock().remove(service_name) {
            Some(_) => Ok(()),
            None => Err(RpcError::illegal_state(format!(
                "service {service_name} not registered"
            ))),
        }
    }

    /// Aggregate connection metrics across all reactors.
    pub fn metrics(&self) -> Result<MessengerMetrics> {
        let mut totals = MessengerMetrics {
            connections_accepted: CONNECTIONS_ACCEPTED.value(),
            ..Default::default()
        };
        for reactor in self.core.reactors() {
            let m = reactor.get_metrics()?;
            totals.num_client_connections += m.num_client_connections;
            totals.num_server_connections += m.num_server_connections;
        }
        Ok(totals)
    }

    /// Route an outbound call to the reactor owning its ConnectionId.
    pub(crate) fn queue_outbound_call(&self, call: OutboundCall) {
        let reactors = self.core.reactors();
        let mut hasher = DefaultHasher::new();
        call.conn_id().hash(&mut hasher);
        let reactor = &reactors[(hasher.finish() as usize) % reactors.len()];
        reactor.queue_outbound_call(call);
    }

    /// Hand an accepted socket to the next reactor, round-robin.
    pub(crate) fn register_inbound_socket(&self, socket: std::net::TcpStream, remote: SocketAddr) {
        let reactors = self.core.reactors();
        let idx = self.core.inbound_rr.fetch_add(1, Ordering::Relaxed) % reactors.len();
        reactors[idx].register_inbound_socket(socket, remote);
    }

    pub(crate) fn reactors(&self) -> &[Reactor] {
        self.core.reactors()
    }

    /// Tear the messenger down. Idempotent; returns once every acceptor,
    /// pool worker, and reactor loop thread has exited.
    pub fn shutdown(&self) {
        {
            let mut closing = self.core.closing.lock();
            if *closing {
                return;
            }
            *closing = true;
        }
        info!("{}: shutting down messenger", self.core.name);

        // Stop the intake first so no new inbound sockets appear.
        let acceptors = std::mem::take(&mut *self.core.acceptors.lock());
        for acceptor in acceptors {
            acceptor.shutdown();
        }

        // Flip every reactor to closing and abort what never reached a loop.
        for reactor in self.core.reactors() {
            reactor.shutdown();
        }

        // In-flight handshakes finish against closed reactors; their
        // completion tasks abort and drop the sockets.
        self.core.negotiation_pool.shutdown();

        let services: Vec<ServicePool> = {
            let mut map = self.core.services.lock();
            map.drain().map(|(_, pool)| pool).collect()
        };
        for pool in services {
            pool.shutdown();
        }

        for reactor in self.core.reactors() {
            reactor.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_rejects_zero_reactors() {
        let err = Messenger::builder("bad").num_reactors(0).build().unwrap_err();
        assert!(err.is_illegal_state());
    }

    #[test]
    fn test_unregister_unknown_service() {
        let messenger = Messenger::builder("svc").num_reactors(1).build().unwrap();
        let err = messenger.unregister_service("nope").unwrap_err();
        assert!(err.to_string().contains("not registered"));
        messenger.shutdown();
    }

    #[test]
    fn test_add_acceptor_after_shutdown_fails() {
        let messenger = Messenger::builder("late").num_reactors(1).build().unwrap();
        messenger.shutdown();
        let err = messenger
            .add_acceptor("127.0.0.1:0".parse().unwrap())
            .unwrap_err();
        assert!(err.is_illegal_state());
    }
}
