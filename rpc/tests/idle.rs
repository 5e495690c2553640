//! Idle-connection GC, client connection reuse, and connection metrics.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rpc::{EchoService, Messenger, Proxy, ServicePool};

fn start_echo_server(keepalive: Duration, granularity: Duration) -> (Messenger, SocketAddr) {
    let server = Messenger::builder("server")
        .num_reactors(1)
        .connection_keepalive_time(keepalive)
        .coarse_timer_granularity(granularity)
        .build()
        .unwrap();
    server.register_service("echo", ServicePool::new(Arc::new(EchoService), 64, 2));
    let addr = server.add_acceptor("127.0.0.1:0".parse().unwrap()).unwrap();
    (server, addr)
}

/// A server connection left idle past the keepalive is closed within a timer
/// period and the connection gauge drops back down.
#[test]
fn test_idle_server_connection_gc() {
    let (server, addr) = start_echo_server(Duration::from_millis(300), Duration::from_millis(50));
    let client = Messenger::builder("client").num_reactors(1).build().unwrap();

    let proxy = Proxy::new(&client, addr, "echo");
    proxy
        .call("echo", b"x", Duration::from_secs(10))
        .unwrap();

    let metrics = server.metrics().unwrap();
    assert_eq!(metrics.num_server_connections, 1);

    // No traffic from here on; the scan should reap the connection shortly
    // after the keepalive elapses.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let remaining = server.metrics().unwrap().num_server_connections;
        if remaining == 0 {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "idle connection was never reaped ({remaining} still open)"
        );
        thread::sleep(Duration::from_millis(20));
    }

    client.shutdown();
    server.shutdown();
}

/// Calls with an equal ConnectionId share one TCP connection.
#[test]
fn test_client_connection_reuse() {
    let (server, addr) = start_echo_server(Duration::from_secs(65), Duration::from_millis(100));
    let client = Messenger::builder("client").num_reactors(1).build().unwrap();

    let proxy = Proxy::new(&client, addr, "echo");
    for _ in 0..3 {
        let reply = proxy.call("echo", b"again", Duration::from_secs(10)).unwrap();
        assert_eq!(&reply[..], b"again");
    }

    assert_eq!(client.metrics().unwrap().num_client_connections, 1);
    assert_eq!(server.metrics().unwrap().num_server_connections, 1);

    client.shutdown();
    server.shutdown();
}

/// Distinct service names get distinct connections even to the same remote.
#[test]
fn test_distinct_services_do_not_share_connections() {
    let (server, addr) = start_echo_server(Duration::from_secs(65), Duration::from_millis(100));
    server.register_service("scan", ServicePool::new(Arc::new(EchoService), 64, 1));
    let client = Messenger::builder("client").num_reactors(1).build().unwrap();

    let echo = Proxy::new(&client, addr, "echo");
    let scan = Proxy::new(&client, addr, "scan");
    echo.call("echo", b"a", Duration::from_secs(10)).unwrap();
    scan.call("echo", b"b", Duration::from_secs(10)).unwrap();

    assert_eq!(client.metrics().unwrap().num_client_connections, 2);

    client.shutdown();
    server.shutdown();
}

/// Once a connection is destroyed it is gone from the reuse map, and the
/// next call builds a fresh one.
#[test]
fn test_reconnect_after_idle_teardown() {
    let (server, addr) = start_echo_server(Duration::from_millis(200), Duration::from_millis(50));
    let client = Messenger::builder("client").num_reactors(1).build().unwrap();

    let proxy = Proxy::new(&client, addr, "echo");
    proxy.call("echo", b"one", Duration::from_secs(10)).unwrap();

    // The server reaps the idle connection; the client then notices the EOF
    // and drops its side from the reuse map.
    let deadline = Instant::now() + Duration::from_secs(5);
    while client.metrics().unwrap().num_client_connections > 0 {
        assert!(Instant::now() < deadline, "client side never saw the close");
        thread::sleep(Duration::from_millis(20));
    }

    let reply = proxy.call("echo", b"two", Duration::from_secs(10)).unwrap();
    assert_eq!(&reply[..], b"two");
    assert_eq!(client.metrics().unwrap().num_client_connections, 1);

    client.shutdown();
    server.shutdown();
}

/// Calls to a service name nobody registered come back with an error
/// response rather than hanging or killing the connection.
#[test]
fn test_unknown_service_rejected() {
    let (server, addr) = start_echo_server(Duration::from_secs(65), Duration::from_millis(100));
    let client = Messenger::builder("client").num_reactors(1).build().unwrap();

    let proxy = Proxy::new(&client, addr, "nonsense");
    let err = proxy
        .call("echo", b"x", Duration::from_secs(10))
        .unwrap_err();
    assert!(err.to_string().contains("not registered"), "got: {err}");

    client.shutdown();
    server.shutdown();
}

/// After shutdown the messenger refuses further metrics snapshots with the
/// reactor shutdown status.
#[test]
fn test_metrics_after_shutdown() {
    let (server, _addr) = start_echo_server(Duration::from_secs(65), Duration::from_millis(100));
    server.shutdown();
    let err = server.metrics().unwrap_err();
    assert!(err.is_service_unavailable());
}
