//! Messenger metrics.

use metriken::{Counter, Gauge, metric};

#[metric(
    name = "rpc_connections_accepted",
    description = "Total number of inbound connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "rpc_client_connections",
    description = "Outbound connections currently registered with reactors"
)]
pub static CLIENT_CONNECTIONS: Gauge = Gauge::new();

#[metric(
    name = "rpc_server_connections",
    description = "Inbound connections currently registered with reactors"
)]
pub static SERVER_CONNECTIONS: Gauge = Gauge::new();

/// Connection-count snapshot of a single reactor, taken on its loop thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReactorMetrics {
    pub num_client_connections: usize,
    pub num_server_connections: usize,
}

/// Aggregate over all of a messenger's reactors.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessengerMetrics {
    pub num_client_connections: usize,
    pub num_server_connections: usize,
    /// Process-wide accepted-connection count (monotonic).
    pub connections_accepted: u64,
}
