//! Per-connection state owned by a reactor loop.
//!
//! A `Connection` is confined to one loop thread from registration to
//! destruction. Its socket starts as a plain `std` stream, is loaned to the
//! negotiation pool in blocking mode, and comes back as a non-blocking mio
//! stream registered for readiness on the owning loop.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use mio::Registry;
use tracing::{debug, trace};

use crate::call::{ConnectionId, OutboundCall, UserCredentials};
use crate::error::{Result, RpcError};
use crate::frame::{self, Frame};

const READ_CHUNK: usize = 16 * 1024;

/// Which side of the connection this endpoint is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    /// We initiated the connection to issue calls.
    Client,
    /// The acceptor handed us the connection to serve calls.
    Server,
}

/// Where the socket currently lives.
enum Transport {
    /// Captured at construction, not yet handed to the negotiation pool.
    New(std::net::TcpStream),
    /// Loaned to the negotiation pool; the completion task brings it back.
    Negotiating,
    /// Registered with the loop for readiness events.
    Ready(mio::net::TcpStream),
    /// Terminal; the fd is closed.
    Closed,
}

struct PendingReply {
    call: OutboundCall,
    deadline: Option<Instant>,
}

pub(crate) struct Connection {
    direction: Direction,
    remote: SocketAddr,
    /// Loop-unique id guarding against slab-slot reuse by re-entrant tasks.
    serial: u64,
    transport: Transport,
    service_name: String,
    user: UserCredentials,
    last_activity: Instant,
    negotiation_complete: bool,
    writable: bool,
    read_buf: BytesMut,
    write_buf: BytesMut,
    next_call_id: u32,
    /// Calls accepted before negotiation completed.
    pending_calls: VecDeque<(OutboundCall, Option<Instant>)>,
    /// Calls on the wire, keyed by call id.
    awaiting: HashMap<u32, PendingReply>,
    /// Server side: requests handed to a service pool and not yet answered.
    inflight_responses: usize,
    shutdown_status: Option<RpcError>,
}

impl Connection {
    pub(crate) fn outbound(socket: std::net::TcpStream, conn_id: &ConnectionId) -> Connection {
        Connection::new(
            Direction::Client,
            conn_id.remote(),
            socket,
            conn_id.service_name().to_string(),
            conn_id.user().clone(),
        )
    }

    pub(crate) fn inbound(socket: std::net::TcpStream, remote: SocketAddr) -> Connection {
        // The service name is learned during negotiation.
        Connection::new(
            Direction::Server,
            remote,
            socket,
            String::new(),
            UserCredentials::new(""),
        )
    }

    fn new(
        direction: Direction,
        remote: SocketAddr,
        socket: std::net::TcpStream,
        service_name: String,
        user: UserCredentials,
    ) -> Connection {
        Connection {
            direction,
            remote,
            serial: 0,
            transport: Transport::New(socket),
            service_name,
            user,
            last_activity: Instant::now(),
            negotiation_complete: false,
            writable: false,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: BytesMut::with_capacity(READ_CHUNK),
            next_call_id: 1,
            pending_calls: VecDeque::new(),
            awaiting: HashMap::new(),
            inflight_responses: 0,
            shutdown_status: None,
        }
    }

    pub(crate) fn direction(&self) -> Direction {
        self.direction
    }

    pub(crate) fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub(crate) fn serial(&self) -> u64 {
        self.serial
    }

    pub(crate) fn set_serial(&mut self, serial: u64) {
        self.serial = serial;
    }

    pub(crate) fn service_name(&self) -> &str {
        &self.service_name
    }

    pub(crate) fn user(&self) -> &UserCredentials {
        &self.user
    }

    pub(crate) fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub(crate) fn negotiation_complete(&self) -> bool {
        self.negotiation_complete
    }

    /// The reuse key of a client connection.
    pub(crate) fn connection_id(&self) -> ConnectionId {
        debug_assert_eq!(self.direction, Direction::Client);
        ConnectionId::new(self.remote, self.service_name.clone(), self.user.clone())
    }

    /// Hand the socket to the negotiation pool.
    pub(crate) fn take_socket_for_negotiation(&mut self) -> Result<std::net::TcpStream> {
        match std::mem::replace(&mut self.transport, Transport::Negotiating) {
            Transport::New(socket) => Ok(socket),
            other => {
                self.transport = other;
                Err(RpcError::illegal_state(
                    "connection has no socket to negotiate",
                ))
            }
        }
    }

    /// Record the identity learned by server-side negotiation.
    pub(crate) fn set_negotiated_identity(&mut self, service_name: String, user: UserCredentials) {
        self.service_name = service_name;
        self.user = user;
    }

    /// Negotiation succeeded and the socket is registered with the loop:
    /// start normal I/O and encode any calls that queued up in the meantime.
    pub(crate) fn mark_negotiation_complete(&mut self, stream: mio::net::TcpStream) {
        self.transport = Transport::Ready(stream);
        self.negotiation_complete = true;
        self.writable = true;
        self.last_activity = Instant::now();
        while let Some((call, deadline)) = self.pending_calls.pop_front() {
            self.encode_call(call, deadline);
        }
    }

    /// Queue an outbound call; encodes immediately once negotiated.
    pub(crate) fn queue_outbound_call(&mut self, call: OutboundCall, deadline: Option<Instant>) {
        if self.negotiation_complete {
            self.encode_call(call, deadline);
        } else {
            self.pending_calls.push_back((call, deadline));
        }
    }

    fn encode_call(&mut self, call: OutboundCall, deadline: Option<Instant>) {
        let call_id = self.next_call_id;
        self.next_call_id = self.next_call_id.wrapping_add(1);
        frame::encode_request(&mut self.write_buf, call_id, call.method(), call.payload());
        trace!("sending call {} with id {}", call, call_id);
        self.awaiting.insert(call_id, PendingReply { call, deadline });
    }

    /// Deliver a response frame to the matching in-flight call.
    pub(crate) fn complete_call(&mut self, call_id: u32, result: std::result::Result<Bytes, String>) {
        match self.awaiting.remove(&call_id) {
            Some(pending) => match result {
                Ok(payload) => pending.call.complete(payload),
                Err(msg) => pending.call.set_failed(RpcError::remote(msg)),
            },
            // A late response to a call that already timed out.
            None => debug!("response for unknown call id {} from {}", call_id, self.remote),
        }
    }

    /// Server side: a request was handed to a service pool.
    pub(crate) fn note_call_dispatched(&mut self) {
        self.inflight_responses += 1;
    }

    /// Server side: a previously dispatched request has been answered.
    pub(crate) fn complete_inflight(&mut self) {
        self.inflight_responses = self.inflight_responses.saturating_sub(1);
    }

    /// Server side: encode a response frame.
    pub(crate) fn queue_response(
        &mut self,
        call_id: u32,
        result: &std::result::Result<Bytes, String>,
    ) {
        frame::encode_response(&mut self.write_buf, call_id, result);
        self.last_activity = Instant::now();
    }

    pub(crate) fn mark_writable(&mut self) {
        self.writable = true;
    }

    /// Push buffered bytes out until the buffer drains or the socket blocks.
    pub(crate) fn flush(&mut self) -> Result<()> {
        if !self.writable || self.write_buf.is_empty() {
            return Ok(());
        }
        let Transport::Ready(ref mut stream) = self.transport else {
            return Ok(());
        };
        while !self.write_buf.is_empty() {
            match stream.write(&self.write_buf) {
                Ok(0) => {
                    return Err(RpcError::network(format!(
                        "failed to write to {}: connection closed",
                        self.remote
                    )));
                }
                Ok(n) => {
                    let _ = self.write_buf.split_to(n);
                    self.last_activity = Instant::now();
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.writable = false;
                    break;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Read everything currently available. Returns `true` on clean EOF.
    pub(crate) fn fill_read_buf(&mut self) -> Result<bool> {
        let Transport::Ready(ref mut stream) = self.transport else {
            return Ok(false);
        };
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => return Ok(true),
                Ok(n) => {
                    self.read_buf.extend_from_slice(&chunk[..n]);
                    self.last_activity = Instant::now();
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Decode the next complete frame out of the read buffer.
    pub(crate) fn next_frame(&mut self) -> Result<Option<Frame>> {
        frame::try_decode(&mut self.read_buf)
    }

    /// An idle connection has no queued or in-flight activity in either
    /// direction.
    pub(crate) fn idle(&self) -> bool {
        self.read_buf.is_empty()
            && self.write_buf.is_empty()
            && self.pending_calls.is_empty()
            && self.awaiting.is_empty()
            && self.inflight_responses == 0
    }

    /// Fail every call whose deadline has passed. `now` must come from the
    /// fine clock, not the loop's cached coarse time.
    pub(crate) fn expire_calls(&mut self, now: Instant) {
        let expired: Vec<u32> = self
            .awaiting
            .iter()
            .filter(|(_, p)| p.deadline.is_some_and(|d| d <= now))
            .map(|(&id, _)| id)
            .collect();
        for call_id in expired {
            if let Some(pending) = self.awaiting.remove(&call_id) {
                pending
                    .call
                    .set_failed(RpcError::timed_out(format!("call {} timed out", call_id)));
            }
        }
        let mut i = 0;
        while i < self.pending_calls.len() {
            if self.pending_calls[i].1.is_some_and(|d| d <= now) {
                let (call, _) = self.pending_calls.remove(i).unwrap();
                let message = format!("call {} timed out waiting for negotiation", call);
                call.set_failed(RpcError::timed_out(message));
            } else {
                i += 1;
            }
        }
    }

    /// Terminal transition: fail every queued call, deregister and close the
    /// socket. Safe to call from any earlier state; idempotent.
    pub(crate) fn shutdown(&mut self, status: &RpcError, registry: &Registry) {
        if self.shutdown_status.is_some() {
            return;
        }
        debug!("shutting down {}: {}", self, status);
        self.shutdown_status = Some(status.clone());
        for (_, pending) in self.awaiting.drain() {
            pending.call.set_failed(status.clone());
        }
        while let Some((call, _)) = self.pending_calls.pop_front() {
            call.set_failed(status.clone());
        }
        match std::mem::replace(&mut self.transport, Transport::Closed) {
            Transport::Ready(mut stream) => {
                let _ = registry.deregister(&mut stream);
            }
            // New: dropping the stream closes the fd. Negotiating: the
            // completion task owns the socket and drops it on re-entry.
            Transport::New(_) | Transport::Negotiating | Transport::Closed => {}
        }
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.direction {
            Direction::Client => write!(f, "client connection to {}", self.remote),
            Direction::Server => write!(f, "server connection from {}", self.remote),
        }
    }
}
