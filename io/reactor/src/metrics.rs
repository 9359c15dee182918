//! Reactor metrics.

use metriken::{Counter, Gauge, metric};

#[metric(
    name = "connections_accepted",
    description = "Total number of connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "connections_active",
    description = "Number of currently active connections"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

#[metric(name = "bytes_received", description = "Bytes read off the wire")]
pub static BYTES_RECEIVED: Counter = Counter::new();

#[metric(name = "bytes_sent", description = "Bytes written to the wire")]
pub static BYTES_SENT: Counter = Counter::new();

#[metric(
    name = "connections_kicked",
    description = "Connections force-closed by idle or liveness timeout"
)]
pub static CONNECTIONS_KICKED: Counter = Counter::new();
