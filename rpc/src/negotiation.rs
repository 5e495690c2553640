//! Connection negotiation.
//!
//! The handshake runs on the messenger's negotiation pool with the socket in
//! blocking mode, because it must not stall a reactor loop. The wire exchange
//! is deliberately small: the client introduces itself with the service name
//! and user it intends to call, the server acknowledges. When the handshake
//! finishes (either way) the worker schedules a completion task that
//! re-enters the owning reactor with the outcome and the socket.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Instant;

use tracing::trace;

use crate::call::UserCredentials;
use crate::connection::Direction;
use crate::error::{Result, RpcError};
use crate::reactor::{CompleteNegotiationTask, Reactor};

const MAGIC: &[u8; 4] = b"crpc";
const VERSION: u8 = 1;
const ACK_OK: u8 = 1;

/// Names longer than this are rejected during the handshake.
const MAX_NAME_LEN: usize = 4096;

/// Identity the server side learns from the client hello.
pub(crate) type NegotiatedIdentity = Option<(String, UserCredentials)>;

/// Body of a negotiation job: handshake, then re-enter the reactor.
#[allow(clippy::too_many_arguments)]
pub(crate) fn run_negotiation(
    reactor: Reactor,
    token: usize,
    serial: u64,
    mut socket: TcpStream,
    direction: Direction,
    service_name: String,
    user: UserCredentials,
    deadline: Option<Instant>,
) {
    let outcome = match direction {
        Direction::Client => {
            negotiate_client(&mut socket, &service_name, &user, deadline).map(|()| None)
        }
        Direction::Server => negotiate_server(&mut socket, deadline).map(Some),
    };
    trace!(
        "negotiation finished for reactor {} token {}: {:?}",
        reactor.name(),
        token,
        outcome.as_ref().map(|_| ())
    );
    // If the reactor refuses the task (closing), its abort drops the socket.
    reactor.schedule(Box::new(CompleteNegotiationTask::new(
        token, serial, socket, outcome,
    )));
}

fn negotiate_client(
    socket: &mut TcpStream,
    service_name: &str,
    user: &UserCredentials,
    deadline: Option<Instant>,
) -> Result<()> {
    prepare_socket(socket, deadline)?;

    let user_name = user.real_user();
    let mut hello = Vec::with_capacity(4 + 1 + 2 + service_name.len() + 2 + user_name.len());
    hello.extend_from_slice(MAGIC);
    hello.push(VERSION);
    hello.extend_from_slice(&(service_name.len() as u16).to_be_bytes());
    hello.extend_from_slice(service_name.as_bytes());
    hello.extend_from_slice(&(user_name.len() as u16).to_be_bytes());
    hello.extend_from_slice(user_name.as_bytes());
    socket.write_all(&hello).map_err(map_handshake_err)?;

    let mut ack = [0u8; 6];
    socket.read_exact(&mut ack).map_err(map_handshake_err)?;
    if &ack[..4] != MAGIC || ack[4] != VERSION {
        return Err(RpcError::network("invalid negotiation response from remote"));
    }
    if ack[5] != ACK_OK {
        return Err(RpcError::service_unavailable(
            "connection negotiation rejected by remote",
        ));
    }
    Ok(())
}

fn negotiate_server(
    socket: &mut TcpStream,
    deadline: Option<Instant>,
) -> Result<(String, UserCredentials)> {
    prepare_socket(socket, deadline)?;

    let mut header = [0u8; 5];
    socket.read_exact(&mut header).map_err(map_handshake_err)?;
    if &header[..4] != MAGIC || header[4] != VERSION {
        return Err(RpcError::network("invalid negotiation header from remote"));
    }
    let service_name = read_name(socket)?;
    let user_name = read_name(socket)?;

    let mut ack = [0u8; 6];
    ack[..4].copy_from_slice(MAGIC);
    ack[4] = VERSION;
    ack[5] = ACK_OK;
    socket.write_all(&ack).map_err(map_handshake_err)?;

    Ok((service_name, UserCredentials::new(user_name)))
}

fn read_name(socket: &mut TcpStream) -> Result<String> {
    let mut len_bytes = [0u8; 2];
    socket.read_exact(&mut len_bytes).map_err(map_handshake_err)?;
    let len = u16::from_be_bytes(len_bytes) as usize;
    if len > MAX_NAME_LEN {
        return Err(RpcError::network("negotiation name too long"));
    }
    let mut name = vec![0u8; len];
    socket.read_exact(&mut name).map_err(map_handshake_err)?;
    String::from_utf8(name).map_err(|_| RpcError::network("negotiation name is not UTF-8"))
}

/// Switch the socket to blocking mode and bound the handshake by the
/// deadline via socket timeouts.
fn prepare_socket(socket: &mut TcpStream, deadline: Option<Instant>) -> Result<()> {
    socket.set_nonblocking(false)?;
    let timeout = match deadline {
        None => None,
        Some(deadline) => {
            let now = Instant::now();
            if deadline <= now {
                return Err(timed_out());
            }
            Some(deadline - now)
        }
    };
    socket.set_read_timeout(timeout)?;
    socket.set_write_timeout(timeout)?;
    Ok(())
}

fn map_handshake_err(e: std::io::Error) -> RpcError {
    match e.kind() {
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => timed_out(),
        _ => RpcError::from(e).prepend("connection negotiation failed"),
    }
}

fn timed_out() -> RpcError {
    RpcError::timed_out("connection negotiation timed out")
}
