//! Reactor: a foreign-thread façade paired with a single-threaded event loop.
//!
//! The loop thread owns every socket assigned to it. Other threads never
//! touch loop state; they push a [`ReactorTask`] onto the reactor's pending
//! queue and wake the loop through a `mio::Waker`. The loop interleaves task
//! drains, per-connection readiness, and a coarse periodic tick that ages out
//! idle server connections.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::Sender;
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use slab::Slab;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, trace, warn};

use crate::call::{InboundCall, OutboundCall};
use crate::connection::{Connection, Direction};
use crate::error::{Result, RpcError};
use crate::frame::Frame;
use crate::messenger::MessengerCore;
use crate::metrics::{CLIENT_CONNECTIONS, ReactorMetrics, SERVER_CONNECTIONS};
use crate::negotiation::{self, NegotiatedIdentity};

/// Reserved token for the cross-thread waker; connection tokens are slab
/// keys and stay far below this.
const WAKER_TOKEN: Token = Token(1 << 30);

/// Knobs the messenger builder hands to each reactor.
#[derive(Debug, Clone)]
pub(crate) struct ReactorOptions {
    pub(crate) connection_keepalive_time: Duration,
    pub(crate) coarse_timer_granularity: Duration,
    pub(crate) server_negotiation_timeout: Duration,
}

/// A unit of deferred work handed to a reactor by a foreign thread.
///
/// Exactly one of `run` or `abort` is invoked for every task accepted by
/// [`Reactor::schedule`]: `run` on the loop thread in submission order, or
/// `abort` when the reactor refuses or discards the task during shutdown.
pub(crate) trait ReactorTask: Send {
    fn run(self: Box<Self>, thread: &mut ReactorThread);
    fn abort(self: Box<Self>, status: RpcError);
}

struct ReactorState {
    /// Monotonic: once set it never clears.
    closing: bool,
    pending_tasks: VecDeque<Box<dyn ReactorTask>>,
}

struct ReactorInner {
    name: String,
    state: Mutex<ReactorState>,
    waker: Waker,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// Thread-safe handle to one reactor. Cheap to clone.
#[derive(Clone)]
pub(crate) struct Reactor {
    inner: Arc<ReactorInner>,
}

impl Reactor {
    /// Build the loop and spawn its worker thread.
    pub(crate) fn new(
        name: String,
        messenger: Arc<MessengerCore>,
        options: ReactorOptions,
    ) -> io::Result<Reactor> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let inner = Arc::new(ReactorInner {
            name: name.clone(),
            state: Mutex::new(ReactorState {
                closing: false,
                pending_tasks: VecDeque::new(),
            }),
            waker,
            thread: Mutex::new(None),
        });
        let reactor = Reactor {
            inner: inner.clone(),
        };
        let mut thread = ReactorThread::new(reactor.clone(), messenger, poll, options);
        let handle = std::thread::Builder::new()
            .name(name)
            .spawn(move || thread.run())?;
        *inner.thread.lock() = Some(handle);
        Ok(reactor)
    }

    pub(crate) fn name(&self) -> &str {
        &self.inner.name
    }

    pub(crate) fn closing(&self) -> bool {
        self.inner.state.lock().closing
    }

    /// Enqueue a task and wake the loop, or abort it if the reactor is
    /// closing. Abort never runs under the reactor lock.
    pub(crate) fn schedule(&self, task: Box<dyn ReactorTask>) {
        {
            let mut state = self.inner.state.lock();
            if !state.closing {
                state.pending_tasks.push_back(task);
                drop(state);
                if let Err(e) = self.inner.waker.wake() {
                    warn!("{}: failed to wake reactor thread: {}", self.name(), e);
                }
                return;
            }
        }
        task.abort(RpcError::shutdown());
    }

    /// Move the pending queue into `out`. Returns false when the reactor is
    /// closing; the loop tears down instead of running tasks.
    fn drain_task_queue(&self, out: &mut VecDeque<Box<dyn ReactorTask>>) -> bool {
        let mut state = self.inner.state.lock();
        if state.closing {
            return false;
        }
        std::mem::swap(out, &mut state.pending_tasks);
        true
    }

    /// Flip the reactor to closing, wake the loop so it tears down, and
    /// abort any tasks still pending on the foreign side. Idempotent.
    pub(crate) fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.closing {
                return;
            }
            state.closing = true;
        }
        debug!("{}: shutting down reactor thread", self.name());
        if let Err(e) = self.inner.waker.wake() {
            warn!("{}: failed to wake reactor for shutdown: {}", self.name(), e);
        }
        // Tasks enqueued before closing became visible are finalized here;
        // the loop refuses the queue once closing is set.
        let residual = std::mem::take(&mut self.inner.state.lock().pending_tasks);
        for task in residual {
            task.abort(RpcError::shutdown());
        }
    }

    /// Wait for the loop thread to exit. Call after `shutdown`.
    pub(crate) fn join(&self) {
        let handle = self.inner.thread.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// Synchronous connection-count snapshot, taken on the loop thread.
    pub(crate) fn get_metrics(&self) -> Result<ReactorMetrics> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.schedule(Box::new(GetMetricsTask { tx }));
        match rx.recv() {
            Ok(result) => result,
            Err(_) => Err(RpcError::shutdown()),
        }
    }

    /// Hand an accepted socket to this reactor as a SERVER connection.
    pub(crate) fn register_inbound_socket(&self, socket: std::net::TcpStream, remote: SocketAddr) {
        trace!("{}: new inbound connection from {}", self.name(), remote);
        let conn = Connection::inbound(socket, remote);
        self.schedule(Box::new(RegisterConnectionTask { conn }));
    }

    /// Route an outbound call onto this reactor's loop.
    pub(crate) fn queue_outbound_call(&self, call: OutboundCall) {
        trace!("{}: queueing outbound call {}", self.name(), call);
        self.schedule(Box::new(AssignOutboundCallTask { call }));
    }

    /// Route a service response back to the connection it was read from.
    pub(crate) fn send_call_response(
        &self,
        token: usize,
        serial: u64,
        call_id: u32,
        result: Result<Bytes>,
    ) {
        self.schedule(Box::new(SendResponseTask {
            token,
            serial,
            call_id,
            result,
        }));
    }
}

/// The loop-thread half of a reactor. Everything here is confined to the
/// worker thread; nothing is shared.
pub(crate) struct ReactorThread {
    reactor: Reactor,
    /// Strong reference released when the loop exits, sequencing messenger
    /// teardown after every loop has stopped.
    messenger: Arc<MessengerCore>,
    poll: Poll,
    options: ReactorOptions,
    conns: Slab<Connection>,
    client_conns: HashMap<crate::call::ConnectionId, usize>,
    server_conns: Vec<usize>,
    /// Cached coarse time, refreshed once per tick. Deadlines use the fine
    /// clock directly.
    cur_time: Instant,
    next_serial: u64,
    done: bool,
}

impl ReactorThread {
    fn new(
        reactor: Reactor,
        messenger: Arc<MessengerCore>,
        poll: Poll,
        options: ReactorOptions,
    ) -> ReactorThread {
        ReactorThread {
            reactor,
            messenger,
            poll,
            options,
            conns: Slab::new(),
            client_conns: HashMap::new(),
            server_conns: Vec::new(),
            cur_time: Instant::now(),
            next_serial: 1,
            done: false,
        }
    }

    fn name(&self) -> &str {
        self.reactor.name()
    }

    fn run(&mut self) {
        debug!("{}: reactor thread running", self.name());
        let mut events = Events::with_capacity(256);
        let mut ready: Vec<(Token, bool, bool, bool)> = Vec::with_capacity(256);
        let mut next_tick = Instant::now() + self.options.coarse_timer_granularity;

        while !self.done {
            let timeout = next_tick.saturating_duration_since(Instant::now());
            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!("{}: poll failed, stopping reactor: {}", self.name(), e);
                break;
            }

            ready.clear();
            let mut woken = false;
            for event in events.iter() {
                let token = event.token();
                if token == WAKER_TOKEN {
                    woken = true;
                    continue;
                }
                ready.push((
                    token,
                    event.is_readable(),
                    event.is_writable(),
                    event.is_read_closed() || event.is_write_closed() || event.is_error(),
                ));
            }

            // The shutdown check must precede connection work so a racing
            // enqueue never outlives a shutdown request.
            if woken {
                self.async_handler();
            }
            if self.done {
                break;
            }

            for &(token, readable, writable, closed) in ready.iter() {
                self.handle_ready(token, readable, writable, closed);
            }

            let now = Instant::now();
            if now >= next_tick {
                self.timer_handler(now);
                next_tick = now + self.options.coarse_timer_granularity;
            }
        }
        debug!("{}: reactor thread exiting", self.name());
    }

    /// A foreign thread woke us: either shut down or drain and run tasks.
    fn async_handler(&mut self) {
        if self.reactor.closing() {
            self.shutdown_internal();
            return;
        }
        let mut tasks = VecDeque::new();
        if !self.reactor.drain_task_queue(&mut tasks) {
            self.shutdown_internal();
            return;
        }
        while let Some(task) = tasks.pop_front() {
            task.run(self);
        }
    }

    /// Periodic coarse tick: refresh the cached time, let connections
    /// enforce their call deadlines, and age out idle server connections.
    fn timer_handler(&mut self, now: Instant) {
        self.cur_time = now;
        trace!("{}: timer tick", self.name());

        let fine_now = Instant::now();
        let client_tokens: Vec<usize> = self.client_conns.values().copied().collect();
        for idx in client_tokens {
            if let Some(conn) = self.conns.get_mut(idx) {
                conn.expire_calls(fine_now);
            }
        }

        self.scan_idle_connections();
    }

    /// Close server connections that have been idle past the keepalive.
    /// Client connections are not aged out here.
    fn scan_idle_connections(&mut self) {
        let keepalive = self.options.connection_keepalive_time;
        let mut timed_out = 0u64;
        let mut i = 0;
        while i < self.server_conns.len() {
            let idx = self.server_conns[i];
            let conn = &self.conns[idx];
            if !conn.idle() {
                trace!("{}: {} not idle", self.name(), conn);
                i += 1;
                continue;
            }
            let idle_for = self.cur_time.saturating_duration_since(conn.last_activity());
            if idle_for > keepalive {
                debug!(
                    "{}: timing out {} - it has been idle for {:?}",
                    self.name(),
                    conn,
                    idle_for
                );
                // Removes entry i from server_conns; do not advance.
                self.destroy_connection(
                    idx,
                    RpcError::network(format!(
                        "connection timed out after {} seconds",
                        keepalive.as_secs_f64()
                    )),
                );
                timed_out += 1;
            } else {
                i += 1;
            }
        }
        if timed_out > 0 {
            debug!("{}: timed out {} TCP connections", self.name(), timed_out);
        }
    }

    fn get_metrics_internal(&self) -> ReactorMetrics {
        ReactorMetrics {
            num_client_connections: self.client_conns.len(),
            num_server_connections: self.server_conns.len(),
        }
    }

    fn alloc_serial(&mut self) -> u64 {
        let serial = self.next_serial;
        self.next_serial += 1;
        serial
    }

    /// Register an accepted SERVER connection and kick off its negotiation.
    fn register_connection(&mut self, mut conn: Connection) {
        // Bound how long we will negotiate with a new client.
        let deadline = Instant::now() + self.options.server_negotiation_timeout;
        conn.set_serial(self.alloc_serial());
        let idx = self.conns.insert(conn);
        match self.start_connection_negotiation(idx, Some(deadline)) {
            Ok(()) => {
                self.server_conns.push(idx);
                SERVER_CONNECTIONS.increment();
            }
            Err(status) => {
                error!(
                    "{}: server connection negotiation failed: {}",
                    self.name(),
                    status
                );
                let mut conn = self.conns.remove(idx);
                conn.shutdown(&status, self.poll.registry());
            }
        }
    }

    /// Attach an outbound call to its (possibly new) connection.
    fn assign_outbound_call(&mut self, call: OutboundCall) {
        let deadline = if call.timeout().is_zero() {
            warn!("{}: call {} has no timeout set", self.name(), call);
            None
        } else {
            Some(Instant::now() + call.timeout())
        };

        let idx = match self.find_or_start_connection(call.conn_id().clone(), deadline) {
            Ok(idx) => idx,
            Err(status) => {
                call.set_failed(status);
                return;
            }
        };

        let conn = &mut self.conns[idx];
        conn.queue_outbound_call(call, deadline);
        if conn.negotiation_complete() {
            if let Err(status) = conn.flush() {
                self.destroy_connection(idx, status);
            }
        }
    }

    /// Look up (or create and start negotiating) the CLIENT connection for
    /// `conn_id`. On any error the connection is dropped and never enters
    /// the client map.
    fn find_or_start_connection(
        &mut self,
        conn_id: crate::call::ConnectionId,
        deadline: Option<Instant>,
    ) -> Result<usize> {
        if let Some(&idx) = self.client_conns.get(&conn_id) {
            return Ok(idx);
        }

        debug!(
            "{}: FindOrStartConnection: creating new connection for {}",
            self.name(),
            conn_id
        );
        let (socket, _in_progress) = start_connect(conn_id.remote())?;
        let mut conn = Connection::outbound(socket, &conn_id);
        conn.set_serial(self.alloc_serial());
        let idx = self.conns.insert(conn);

        match self.start_connection_negotiation(idx, deadline) {
            Ok(()) => {
                self.client_conns.insert(conn_id, idx);
                CLIENT_CONNECTIONS.increment();
                Ok(idx)
            }
            Err(status) => {
                // The socket already moved into the rejected job and closed
                // with it; no calls have been attached yet.
                self.conns.remove(idx);
                if status.is_illegal_state() {
                    // Friendlier than the raw pool status.
                    Err(RpcError::service_unavailable(
                        "Client RPC Messenger shutting down",
                    ))
                } else {
                    Err(status.prepend("Unable to start connection negotiation thread"))
                }
            }
        }
    }

    /// Loan the connection's socket to the negotiation pool. The handshake
    /// blocks, so it never runs on this thread.
    fn start_connection_negotiation(&mut self, idx: usize, deadline: Option<Instant>) -> Result<()> {
        let conn = &mut self.conns[idx];
        let socket = conn.take_socket_for_negotiation()?;
        let direction = conn.direction();
        let serial = conn.serial();
        let service_name = conn.service_name().to_string();
        let user = conn.user().clone();
        let reactor = self.reactor.clone();
        self.messenger.negotiation_pool().submit(Box::new(move || {
            negotiation::run_negotiation(
                reactor,
                idx,
                serial,
                socket,
                direction,
                service_name,
                user,
                deadline,
            );
        }))
    }

    /// Negotiation finished off-loop; absorb the outcome.
    fn complete_connection_negotiation(
        &mut self,
        idx: usize,
        serial: u64,
        socket: std::net::TcpStream,
        outcome: Result<NegotiatedIdentity>,
    ) {
        {
            // The connection may have been reaped while negotiating; in that
            // case dropping the socket here is what closes the fd.
            let Some(conn) = self.conns.get(idx) else {
                return;
            };
            if conn.serial() != serial {
                return;
            }
        }

        let identity = match outcome {
            Ok(identity) => identity,
            Err(status) => {
                debug!("{}: connection negotiation failed: {}", self.name(), status);
                self.destroy_connection(idx, status);
                return;
            }
        };
        if let Some((service_name, user)) = identity {
            self.conns[idx].set_negotiated_identity(service_name, user);
        }

        if self.conns[idx].service_name().is_empty() {
            let status = RpcError::illegal_state("failed to set connection service name");
            error!(
                "{}: unexpected connection negotiation error: {}",
                self.name(),
                status
            );
            self.destroy_connection(idx, status);
            return;
        }

        // Back to non-blocking for normal loop-driven I/O.
        if let Err(e) = socket.set_nonblocking(true) {
            let status = RpcError::from(e).prepend("unable to set connection to non-blocking mode");
            error!("{}: {}", self.name(), status);
            self.destroy_connection(idx, status);
            return;
        }
        let mut stream = mio::net::TcpStream::from_std(socket);
        if let Err(e) = self.poll.registry().register(
            &mut stream,
            Token(idx),
            Interest::READABLE | Interest::WRITABLE,
        ) {
            self.destroy_connection(idx, e.into());
            return;
        }

        self.conns[idx].mark_negotiation_complete(stream);
        trace!("{}: negotiation complete for {}", self.name(), self.conns[idx]);
        if let Err(status) = self.conns[idx].flush() {
            self.destroy_connection(idx, status);
        }
    }

    /// Write a service response on the connection the request arrived on.
    /// Dropped silently if the connection is already gone.
    fn send_response(&mut self, idx: usize, serial: u64, call_id: u32, result: Result<Bytes>) {
        let Some(conn) = self.conns.get_mut(idx) else {
            return;
        };
        if conn.serial() != serial || !conn.negotiation_complete() {
            return;
        }
        let wire_result = result.map_err(|status| status.to_string());
        conn.complete_inflight();
        conn.queue_response(call_id, &wire_result);
        if let Err(status) = conn.flush() {
            self.destroy_connection(idx, status);
        }
    }

    /// Readiness dispatch for one connection token.
    fn handle_ready(&mut self, token: Token, readable: bool, writable: bool, closed: bool) {
        let idx = token.0;
        let Some(conn) = self.conns.get_mut(idx) else {
            // Stale event for a slot already vacated this batch.
            return;
        };
        if !conn.negotiation_complete() {
            return;
        }

        if writable {
            conn.mark_writable();
            if let Err(status) = conn.flush() {
                self.destroy_connection(idx, status);
                return;
            }
        }

        if readable {
            match self.conns[idx].fill_read_buf() {
                Ok(false) => {}
                Ok(true) => {
                    self.destroy_connection(idx, RpcError::network("got EOF from remote"));
                    return;
                }
                Err(status) => {
                    self.destroy_connection(idx, status);
                    return;
                }
            }
            loop {
                let frame = match self.conns[idx].next_frame() {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(status) => {
                        self.destroy_connection(idx, status);
                        return;
                    }
                };
                self.dispatch_frame(idx, frame);
                if !self.conns.contains(idx) {
                    return;
                }
            }
        }

        if closed && self.conns.contains(idx) {
            self.destroy_connection(idx, RpcError::network("got EOF from remote"));
        }
    }

    fn dispatch_frame(&mut self, idx: usize, frame: Frame) {
        let direction = self.conns[idx].direction();
        match (direction, frame) {
            (Direction::Client, Frame::Response { call_id, result }) => {
                self.conns[idx].complete_call(call_id, result);
            }
            (Direction::Server, Frame::Request { call_id, method, payload }) => {
                let conn = &self.conns[idx];
                let service_name = conn.service_name().to_string();
                let call = InboundCall::new(
                    self.reactor.clone(),
                    idx,
                    conn.serial(),
                    call_id,
                    method,
                    payload,
                    conn.remote(),
                );
                let outcome = match self.messenger.service(&service_name) {
                    Some(pool) => pool.enqueue(call),
                    None => Err(RpcError::service_unavailable(format!(
                        "service {service_name} not registered"
                    ))),
                };
                match outcome {
                    Ok(()) => self.conns[idx].note_call_dispatched(),
                    Err(status) => {
                        debug!(
                            "{}: rejecting call {} on {}: {}",
                            self.name(),
                            call_id,
                            self.conns[idx],
                            status
                        );
                        self.conns[idx].queue_response(call_id, &Err(status.to_string()));
                        if let Err(status) = self.conns[idx].flush() {
                            self.destroy_connection(idx, status);
                        }
                    }
                }
            }
            (Direction::Client, Frame::Request { .. }) => {
                self.destroy_connection(idx, RpcError::network("unexpected request frame from server"));
            }
            (Direction::Server, Frame::Response { .. }) => {
                self.destroy_connection(idx, RpcError::network("unexpected response frame from client"));
            }
        }
    }

    /// Shut the connection down with `status` and unlink it from the tables.
    fn destroy_connection(&mut self, idx: usize, status: RpcError) {
        let Some(mut conn) = self.conns.try_remove(idx) else {
            return;
        };
        conn.shutdown(&status, self.poll.registry());
        match conn.direction() {
            Direction::Client => {
                let conn_id = conn.connection_id();
                let removed = self.client_conns.remove(&conn_id);
                assert!(removed.is_some(), "couldn't find connection {conn_id}");
                CLIENT_CONNECTIONS.decrement();
            }
            Direction::Server => {
                if let Some(pos) = self.server_conns.iter().position(|&t| t == idx) {
                    self.server_conns.remove(pos);
                    SERVER_CONNECTIONS.decrement();
                }
            }
        }
    }

    /// Runs on the loop once closing has been observed: tear down every
    /// connection and stop the loop.
    fn shutdown_internal(&mut self) {
        let status = RpcError::shutdown();

        debug!("{}: tearing down outbound TCP connections", self.name());
        let client_tokens: Vec<usize> = self.client_conns.values().copied().collect();
        for idx in client_tokens {
            self.destroy_connection(idx, status.clone());
        }

        debug!("{}: tearing down inbound TCP connections", self.name());
        let server_tokens = std::mem::take(&mut self.server_conns);
        for idx in server_tokens {
            if let Some(mut conn) = self.conns.try_remove(idx) {
                conn.shutdown(&status, self.poll.registry());
                SERVER_CONNECTIONS.decrement();
            }
        }

        self.done = true;
    }
}

/// Create a non-blocking socket with NO_DELAY and begin connecting.
/// "In progress" and transient errors count as success with the flag set.
fn start_connect(remote: SocketAddr) -> Result<(std::net::TcpStream, bool)> {
    let domain = match remote {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(|e| {
        warn!(
            "failed to create an outbound connection because a new socket could not be created: {}",
            e
        );
        RpcError::from(e)
    })?;
    socket.set_nonblocking(true)?;
    socket.set_nodelay(true)?;
    match socket.connect(&remote.into()) {
        Ok(()) => Ok((socket.into(), false)),
        Err(ref e) if connect_in_progress(e) => Ok((socket.into(), true)),
        Err(e) => {
            warn!(
                "failed to create an outbound connection to {} because connect failed: {}",
                remote, e
            );
            Err(e.into())
        }
    }
}

fn connect_in_progress(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(libc::EINPROGRESS | libc::EAGAIN))
        || e.kind() == io::ErrorKind::WouldBlock
}

// Task to snapshot connection counts on the loop thread. The caller blocks
// on the reply channel; abort delivers the failure status instead.
struct GetMetricsTask {
    tx: Sender<Result<ReactorMetrics>>,
}

impl ReactorTask for GetMetricsTask {
    fn run(self: Box<Self>, thread: &mut ReactorThread) {
        let _ = self.tx.send(Ok(thread.get_metrics_internal()));
    }

    fn abort(self: Box<Self>, status: RpcError) {
        let _ = self.tx.send(Err(status));
    }
}

struct RegisterConnectionTask {
    conn: Connection,
}

impl ReactorTask for RegisterConnectionTask {
    fn run(self: Box<Self>, thread: &mut ReactorThread) {
        thread.register_connection(self.conn);
    }

    fn abort(self: Box<Self>, _status: RpcError) {
        // The connection was never registered, so no calls can be queued on
        // it; dropping it closes the fd.
    }
}

struct AssignOutboundCallTask {
    call: OutboundCall,
}

impl ReactorTask for AssignOutboundCallTask {
    fn run(self: Box<Self>, thread: &mut ReactorThread) {
        thread.assign_outbound_call(self.call);
    }

    fn abort(self: Box<Self>, status: RpcError) {
        self.call.set_failed(status);
    }
}

/// Re-enters the loop with a negotiation outcome and the loaned socket.
pub(crate) struct CompleteNegotiationTask {
    token: usize,
    serial: u64,
    socket: std::net::TcpStream,
    outcome: Result<NegotiatedIdentity>,
}

impl CompleteNegotiationTask {
    pub(crate) fn new(
        token: usize,
        serial: u64,
        socket: std::net::TcpStream,
        outcome: Result<NegotiatedIdentity>,
    ) -> Self {
        CompleteNegotiationTask {
            token,
            serial,
            socket,
            outcome,
        }
    }
}

impl ReactorTask for CompleteNegotiationTask {
    fn run(self: Box<Self>, thread: &mut ReactorThread) {
        let this = *self;
        thread.complete_connection_negotiation(this.token, this.serial, this.socket, this.outcome);
    }

    fn abort(self: Box<Self>, _status: RpcError) {
        // Dropping the task closes the socket; the loop-side connection (if
        // any survives) is torn down by the reactor's own shutdown.
    }
}

struct SendResponseTask {
    token: usize,
    serial: u64,
    call_id: u32,
    result: Result<Bytes>,
}

impl ReactorTask for SendResponseTask {
    fn run(self: Box<Self>, thread: &mut ReactorThread) {
        thread.send_response(self.token, self.serial, self.call_id, self.result);
    }

    fn abort(self: Box<Self>, _status: RpcError) {
        // The connection is going away with the reactor; the peer sees the
        // reset instead of a response.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messenger::Messenger;
    use std::sync::Mutex as StdMutex;

    struct ProbeTask {
        id: usize,
        log: Arc<StdMutex<Vec<usize>>>,
        events: Sender<(usize, &'static str)>,
    }

    impl ReactorTask for ProbeTask {
        fn run(self: Box<Self>, _thread: &mut ReactorThread) {
            self.log.lock().unwrap().push(self.id);
            let _ = self.events.send((self.id, "run"));
        }

        fn abort(self: Box<Self>, _status: RpcError) {
            let _ = self.events.send((self.id, "abort"));
        }
    }

    fn test_messenger(name: &str) -> Messenger {
        Messenger::builder(name).num_reactors(1).build().unwrap()
    }

    #[test]
    fn test_tasks_run_in_fifo_order() {
        let messenger = test_messenger("fifo");
        let reactor = messenger.reactors()[0].clone();
        let log = Arc::new(StdMutex::new(Vec::new()));
        let (tx, _rx) = crossbeam_channel::unbounded();

        for id in 0..16 {
            reactor.schedule(Box::new(ProbeTask {
                id,
                log: log.clone(),
                events: tx.clone(),
            }));
        }
        // GetMetrics is itself a task, so it doubles as a drain barrier.
        reactor.get_metrics().unwrap();

        assert_eq!(*log.lock().unwrap(), (0..16).collect::<Vec<_>>());
        messenger.shutdown();
    }

    #[test]
    fn test_every_task_runs_or_aborts_exactly_once() {
        let messenger = test_messenger("once");
        let reactor = messenger.reactors()[0].clone();
        let log = Arc::new(StdMutex::new(Vec::new()));
        let (tx, rx) = crossbeam_channel::unbounded();

        const N: usize = 64;
        for id in 0..N {
            reactor.schedule(Box::new(ProbeTask {
                id,
                log: log.clone(),
                events: tx.clone(),
            }));
        }
        messenger.shutdown();
        drop(tx);

        let mut seen = vec![0usize; N];
        while let Ok((id, _kind)) = rx.recv() {
            seen[id] += 1;
        }
        assert!(seen.iter().all(|&n| n == 1), "task outcomes: {seen:?}");
    }

    #[test]
    fn test_schedule_after_shutdown_aborts() {
        let messenger = test_messenger("late");
        let reactor = messenger.reactors()[0].clone();
        messenger.shutdown();

        let (tx, rx) = crossbeam_channel::unbounded();
        reactor.schedule(Box::new(ProbeTask {
            id: 0,
            log: Arc::new(StdMutex::new(Vec::new())),
            events: tx,
        }));
        assert_eq!(rx.recv().unwrap(), (0, "abort"));
    }

    #[test]
    fn test_get_metrics_empty_reactor() {
        let messenger = test_messenger("metrics");
        let reactor = messenger.reactors()[0].clone();
        let metrics = reactor.get_metrics().unwrap();
        assert_eq!(metrics.num_client_connections, 0);
        assert_eq!(metrics.num_server_connections, 0);
        messenger.shutdown();
    }

    #[test]
    fn test_get_metrics_after_shutdown_fails() {
        let messenger = test_messenger("metrics-down");
        let reactor = messenger.reactors()[0].clone();
        messenger.shutdown();
        let err = reactor.get_metrics().unwrap_err();
        assert!(err.is_service_unavailable());
        assert!(err.to_string().contains("reactor is shutting down"));
    }

    #[test]
    fn test_shutdown_idempotent() {
        let messenger = test_messenger("twice");
        let reactor = messenger.reactors()[0].clone();
        messenger.shutdown();
        messenger.shutdown();
        reactor.shutdown();
        assert!(reactor.closing());
    }
}
