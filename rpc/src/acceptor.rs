//! Inbound connection intake.
//!
//! Each acceptor pool binds one listener and runs a blocking accept loop on
//! its own thread, handing accepted sockets to the messenger's reactors.
//! Shutdown closes the listener out from under `accept` to unblock it.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, warn};

use crate::error::Result;
use crate::messenger::Messenger;
use crate::metrics::CONNECTIONS_ACCEPTED;

pub(crate) struct AcceptorPool {
    name: String,
    listener: Arc<TcpListener>,
    bind_address: SocketAddr,
    closing: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl AcceptorPool {
    pub(crate) fn new(
        name: String,
        addr: SocketAddr,
        messenger: Messenger,
    ) -> Result<AcceptorPool> {
        let domain = match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(128)?;
        let listener: TcpListener = socket.into();
        let bind_address = listener.local_addr()?;
        let listener = Arc::new(listener);
        let closing = Arc::new(AtomicBool::new(false));

        let thread = {
            let name = name.clone();
            let listener = listener.clone();
            let closing = closing.clone();
            std::thread::Builder::new()
                .name(name.clone())
                .spawn(move || accept_loop(name, listener, closing, messenger))
                .map_err(crate::error::RpcError::from)?
        };

        debug!("acceptor listening on {}", bind_address);
        Ok(AcceptorPool {
            name,
            listener,
            bind_address,
            closing,
            thread: Some(thread),
        })
    }

    pub(crate) fn bind_address(&self) -> SocketAddr {
        self.bind_address
    }

    /// Stop accepting and join the accept thread.
    pub(crate) fn shutdown(mut self) {
        self.closing.store(true, Ordering::Release);
        // Unblocks the accept(2) in flight.
        unsafe {
            libc::shutdown(self.listener.as_raw_fd(), libc::SHUT_RDWR);
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        debug!("{}: acceptor stopped", self.name);
    }
}

fn accept_loop(
    name: String,
    listener: Arc<TcpListener>,
    closing: Arc<AtomicBool>,
    messenger: Messenger,
) {
    loop {
        match listener.accept() {
            Ok((socket, remote)) => {
                if closing.load(Ordering::Acquire) {
                    break;
                }
                CONNECTIONS_ACCEPTED.increment();
                if let Err(e) = prepare_accepted(&socket) {
                    warn!("{}: failed to prepare socket from {}: {}", name, remote, e);
                    continue;
                }
                messenger.register_inbound_socket(socket, remote);
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                if closing.load(Ordering::Acquire) {
                    break;
                }
                warn!("{}: accept failed: {}", name, e);
                // Avoid spinning on a persistent accept error (e.g. EMFILE).
                std::thread::sleep(Duration::from_millis(10));
            }
        }
    }
    debug!("{}: acceptor thread exiting", name);
}

/// Reactors only ever see non-blocking sockets; NO_DELAY matches the
/// request/response traffic pattern.
fn prepare_accepted(socket: &TcpStream) -> std::io::Result<()> {
    socket.set_nonblocking(true)?;
    socket.set_nodelay(true)
}
