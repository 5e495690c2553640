//! Multi-threaded end-to-end tests: shutdown under load, shutdown racing
//! connection setup, service-queue backpressure, and accept-during-shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rpc::{EchoService, Messenger, Proxy, RpcError, ServicePool};

/// Start an echo server with a real worker pool behind it.
fn start_echo_server() -> (Messenger, SocketAddr) {
    let server = Messenger::builder("server")
        .num_reactors(2)
        .build()
        .unwrap();
    server.register_service("echo", ServicePool::new(Arc::new(EchoService), 256, 2));
    let addr = server.add_acceptor("127.0.0.1:0".parse().unwrap()).unwrap();
    (server, addr)
}

fn client_messenger(name: &str) -> Messenger {
    Messenger::builder(name).num_reactors(1).build().unwrap()
}

/// Call the echo service in a tight loop until a call fails; return that
/// failure.
fn hammer_server(messenger: &Messenger, addr: SocketAddr) -> RpcError {
    let proxy = Proxy::new(messenger, addr, "echo");
    let mut calls = 0u64;
    loop {
        match proxy.call("echo", b"payload", Duration::from_secs(10)) {
            Ok(reply) => {
                assert_eq!(&reply[..], b"payload");
                calls += 1;
            }
            Err(status) => {
                eprintln!("hammer thread stopped after {calls} calls: {status}");
                return status;
            }
        }
    }
}

/// Several concurrent callers must all observe a clean failure when the
/// server messenger is torn down under load.
#[test]
fn test_shutdown_during_service() {
    let (server, addr) = start_echo_server();

    let mut threads = Vec::new();
    for i in 0..4 {
        let handle = thread::Builder::new()
            .name(format!("client-thread-{i}"))
            .spawn(move || {
                let messenger = client_messenger(&format!("client-hs-{i}"));
                let status = hammer_server(&messenger, addr);
                messenger.shutdown();
                status
            })
            .unwrap();
        threads.push(handle);
    }

    thread::sleep(Duration::from_millis(50));
    server.shutdown();

    for handle in threads {
        let status = handle.join().unwrap();
        let msg = status.to_string();
        assert!(
            msg.contains("Service unavailable") || msg.contains("Network error"),
            "status is actually: {msg}"
        );
    }
}

/// Shutting down the client messenger right as calls are being queued must
/// fail the caller with a service-unavailable status, whichever stage of
/// connection setup the shutdown lands on.
#[test]
fn test_shutdown_client_while_calls_pending() {
    let (server, addr) = start_echo_server();
    let client = client_messenger("client");

    let hammer_client = client.clone();
    let handle = thread::Builder::new()
        .name("client-thread".to_string())
        .spawn(move || hammer_server(&hammer_client, addr))
        .unwrap();

    // Well before negotiation of a fresh connection can complete, so the
    // shutdown races connection setup rather than a settled call.
    thread::sleep(Duration::from_micros(10));
    client.shutdown();

    let status = handle.join().unwrap();
    assert!(
        status.is_service_unavailable(),
        "status is actually: {status}"
    );
    let msg = status.to_string();
    assert!(
        msg.contains("Client RPC Messenger shutting down")
            || msg.contains("reactor is shutting down")
            || msg.contains("Unable to start connection negotiation thread"),
        "status is actually: {msg}"
    );

    server.shutdown();
}

fn classify_backpressure_or_shutdown(status: &RpcError, backpressure: &mut u32, shutdown: &mut u32) {
    let msg = status.to_string();
    if msg.contains("service queue is full") {
        *backpressure += 1;
    } else if msg.contains("shutting down") || msg.contains("got EOF from remote") {
        *shutdown += 1;
    } else {
        panic!("unexpected status message: {msg}");
    }
}

/// A service pool that never drains (zero workers, queue of two) must bounce
/// exactly one of three concurrent callers with a queue-full status.
#[test]
fn test_blow_out_service_queue() {
    let server = Messenger::builder("server-bp")
        .num_reactors(2)
        .build()
        .unwrap();
    let pool = ServicePool::new(Arc::new(EchoService), 2, 0);
    server.register_service("echo", pool.clone());
    let addr = server.add_acceptor("127.0.0.1:0".parse().unwrap()).unwrap();

    let (done_tx, done_rx) = crossbeam_channel::unbounded();
    let mut threads = Vec::new();
    for i in 0..3 {
        let done_tx = done_tx.clone();
        let handle = thread::Builder::new()
            .name(format!("client-thread-{i}"))
            .spawn(move || {
                let messenger = client_messenger(&format!("client-sc-{i}"));
                let proxy = Proxy::new(&messenger, addr, "echo");
                let result = proxy.call("echo", b"x", Duration::from_secs(10));
                let _ = done_tx.send(());
                messenger.shutdown();
                result
            })
            .unwrap();
        threads.push(handle);
    }

    // One caller fails immediately on backpressure; the other two are stuck
    // in the queue until we tear the service down.
    done_rx.recv_timeout(Duration::from_secs(10)).unwrap();

    server.unregister_service("echo").unwrap();
    pool.shutdown();
    server.shutdown();

    let mut backpressure = 0;
    let mut shutdown = 0;
    for handle in threads {
        let status = handle.join().unwrap().unwrap_err();
        classify_backpressure_or_shutdown(&status, &mut backpressure, &mut shutdown);
    }
    assert_eq!(backpressure, 1);
    assert_eq!(shutdown, 2);
}

/// Shut the server down while raw TCP connections are still pouring in.
/// Nothing may crash or deadlock, and the connector threads must all stop.
#[test]
fn test_shutdown_with_incoming_connections() {
    let (server, addr) = start_echo_server();
    let accepted_before = server.metrics().unwrap().connections_accepted;

    let mut threads = Vec::new();
    for i in 0..8 {
        let handle = thread::Builder::new()
            .name(format!("connector-{i}"))
            .spawn(move || {
                loop {
                    match std::net::TcpStream::connect(addr) {
                        Ok(socket) => drop(socket),
                        Err(_) => return,
                    }
                }
            })
            .unwrap();
        threads.push(handle);
    }

    // Wait until the server has actually accepted some of them.
    let deadline = Instant::now() + Duration::from_secs(10);
    while server.metrics().unwrap().connections_accepted == accepted_before {
        assert!(Instant::now() < deadline, "no connections accepted");
        thread::sleep(Duration::from_micros(100));
    }

    server.shutdown();

    for handle in threads {
        handle.join().unwrap();
    }
}

/// A zero timeout means "no deadline": the call must still complete
/// normally.
#[test]
fn test_zero_timeout_call() {
    let (server, addr) = start_echo_server();
    let client = client_messenger("client-zt");

    let proxy = Proxy::new(&client, addr, "echo");
    let reply = proxy.call("echo", b"ping", Duration::ZERO).unwrap();
    assert_eq!(&reply[..], b"ping");

    client.shutdown();
    server.shutdown();
}
