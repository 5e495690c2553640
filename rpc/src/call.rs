//! Outbound and inbound call plumbing and the client-facing `Proxy`.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, bounded};

use crate::error::{Result, RpcError};
use crate::messenger::Messenger;
use crate::reactor::Reactor;

/// Credentials attached to outbound connections.
///
/// Part of the connection reuse key: calls issued under different users never
/// share a TCP connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserCredentials {
    real_user: String,
}

impl UserCredentials {
    pub fn new(real_user: impl Into<String>) -> Self {
        UserCredentials {
            real_user: real_user.into(),
        }
    }

    pub fn real_user(&self) -> &str {
        &self.real_user
    }
}

impl Default for UserCredentials {
    fn default() -> Self {
        UserCredentials {
            real_user: std::env::var("USER").unwrap_or_else(|_| "courier".to_string()),
        }
    }
}

impl fmt::Display for UserCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.real_user)
    }
}

/// Identity of a remote endpoint for client-side connection reuse.
///
/// Two outbound calls with equal `ConnectionId` share one TCP connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    remote: SocketAddr,
    service_name: String,
    user: UserCredentials,
}

impl ConnectionId {
    pub fn new(remote: SocketAddr, service_name: impl Into<String>, user: UserCredentials) -> Self {
        ConnectionId {
            remote,
            service_name: service_name.into(),
            user,
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn user(&self) -> &UserCredentials {
        &self.user
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, user={})", self.remote, self.service_name, self.user)
    }
}

/// A client call on its way to (or through) a reactor.
///
/// The caller keeps the paired [`CallHandle`]; whichever side finishes the
/// call first (response, deadline, connection shutdown, task abort) consumes
/// the reply slot, so exactly one outcome is ever delivered.
pub struct OutboundCall {
    conn_id: ConnectionId,
    method: String,
    payload: Bytes,
    timeout: Duration,
    reply: Sender<Result<Bytes>>,
}

impl OutboundCall {
    pub(crate) fn new(
        conn_id: ConnectionId,
        method: impl Into<String>,
        payload: Bytes,
        timeout: Duration,
    ) -> (OutboundCall, CallHandle) {
        let (tx, rx) = bounded(1);
        let call = OutboundCall {
            conn_id,
            method: method.into(),
            payload,
            timeout,
            reply: tx,
        };
        (call, CallHandle { rx })
    }

    pub(crate) fn conn_id(&self) -> &ConnectionId {
        &self.conn_id
    }

    pub(crate) fn method(&self) -> &str {
        &self.method
    }

    pub(crate) fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Deliver a successful response and consume the call.
    pub(crate) fn complete(self, response: Bytes) {
        let _ = self.reply.send(Ok(response));
    }

    /// Fail the call with `status` and consume it.
    pub(crate) fn set_failed(self, status: RpcError) {
        let _ = self.reply.send(Err(status));
    }
}

impl fmt::Display for OutboundCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} to {}", self.method, self.conn_id)
    }
}

/// Caller side of an outbound call.
pub struct CallHandle {
    rx: Receiver<Result<Bytes>>,
}

impl CallHandle {
    /// Block until the call finishes one way or the other.
    pub fn wait(self) -> Result<Bytes> {
        match self.rx.recv() {
            Ok(result) => result,
            // The reply sender dropping without a send means the owning
            // reactor was torn down around the call.
            Err(_) => Err(RpcError::shutdown()),
        }
    }
}

/// A decoded request parked in a service queue, with enough context to route
/// the response back through the owning reactor.
pub struct InboundCall {
    pub(crate) reactor: Reactor,
    pub(crate) token: usize,
    pub(crate) serial: u64,
    pub(crate) call_id: u32,
    method: String,
    payload: Bytes,
    remote: SocketAddr,
}

impl InboundCall {
    pub(crate) fn new(
        reactor: Reactor,
        token: usize,
        serial: u64,
        call_id: u32,
        method: String,
        payload: Bytes,
        remote: SocketAddr,
    ) -> Self {
        InboundCall {
            reactor,
            token,
            serial,
            call_id,
            method,
            payload,
            remote,
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Send the response back on the connection this call arrived on.
    ///
    /// The write happens on the owning reactor's loop; if the connection (or
    /// the reactor) is already gone the response is dropped.
    pub fn respond(self, result: Result<Bytes>) {
        let reactor = self.reactor.clone();
        reactor.send_call_response(self.token, self.serial, self.call_id, result);
    }
}

impl fmt::Display for InboundCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} from {}", self.method, self.remote)
    }
}

/// Client handle for calling one service on one remote endpoint.
pub struct Proxy {
    messenger: Messenger,
    conn_id: ConnectionId,
}

impl Proxy {
    pub fn new(messenger: &Messenger, remote: SocketAddr, service_name: &str) -> Proxy {
        Proxy::with_credentials(messenger, remote, service_name, UserCredentials::default())
    }

    pub fn with_credentials(
        messenger: &Messenger,
        remote: SocketAddr,
        service_name: &str,
        user: UserCredentials,
    ) -> Proxy {
        Proxy {
            messenger: messenger.clone(),
            conn_id: ConnectionId::new(remote, service_name, user),
        }
    }

    pub fn conn_id(&self) -> &ConnectionId {
        &self.conn_id
    }

    /// Issue a synchronous call.
    ///
    /// A zero `timeout` means the call has no deadline.
    pub fn call(&self, method: &str, payload: &[u8], timeout: Duration) -> Result<Bytes> {
        let (call, handle) = OutboundCall::new(
            self.conn_id.clone(),
            method,
            Bytes::copy_from_slice(payload),
            timeout,
        );
        self.messenger.queue_outbound_call(call);
        handle.wait()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn test_connection_id_equality() {
        let user = UserCredentials::new("alice");
        let a = ConnectionId::new(addr(1000), "echo", user.clone());
        let b = ConnectionId::new(addr(1000), "echo", user.clone());
        assert_eq!(a, b);

        // Any differing field breaks equality.
        assert_ne!(a, ConnectionId::new(addr(1001), "echo", user.clone()));
        assert_ne!(a, ConnectionId::new(addr(1000), "scan", user));
        assert_ne!(
            a,
            ConnectionId::new(addr(1000), "echo", UserCredentials::new("bob"))
        );
    }

    #[test]
    fn test_call_completes_once() {
        let (call, handle) = OutboundCall::new(
            ConnectionId::new(addr(1000), "echo", UserCredentials::new("alice")),
            "echo",
            Bytes::from_static(b"x"),
            Duration::from_secs(1),
        );
        call.complete(Bytes::from_static(b"y"));
        assert_eq!(handle.wait().unwrap(), Bytes::from_static(b"y"));
    }

    #[test]
    fn test_dropped_call_fails_with_shutdown() {
        let (call, handle) = OutboundCall::new(
            ConnectionId::new(addr(1000), "echo", UserCredentials::new("alice")),
            "echo",
            Bytes::new(),
            Duration::from_secs(1),
        );
        drop(call);
        assert!(handle.wait().unwrap_err().is_service_unavailable());
    }
}
