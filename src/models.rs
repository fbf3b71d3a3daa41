// Shared data models: timeout knobs, traffic statistics, admission policy.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Upper bounds for the relay operations that must not hang forever.
#[derive(Debug, Clone, Copy)]
pub struct RelayTimeouts {
    // Establishing a brand-new relay session
    pub connect: Duration,
    // Re-attaching to an existing session after a drop
    pub reconnect: Duration,
    // Draining the close handshake
    pub close: Duration,
}

impl Default for RelayTimeouts {
    fn default() -> Self {
        RelayTimeouts {
            connect: Duration::from_secs(10),
            reconnect: Duration::from_secs(10),
            close: Duration::from_secs(5),
        }
    }
}

/// Totals for one finished client connection, logged when its pumps stop.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionStats {
    // Ordinal assigned at accept time, starting at 1
    pub connection_no: u64,
    // Bytes pulled from the relay and delivered to the client
    pub bytes_received: u64,
    // Bytes read from the client and pushed to the relay
    pub bytes_transmitted: u64,
}

/// Aggregate counters across every connection a listener has served.
///
/// Shared between the accept loop and the per-connection pump tasks, so all
/// fields are atomics.
#[derive(Debug, Default)]
pub struct TunnelStats {
    connections: AtomicU64,
    bytes_received: AtomicU64,
    bytes_transmitted: AtomicU64,
}

impl TunnelStats {
    pub fn record_connection(&self) -> u64 {
        self.connections.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn add_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_transmitted(&self, n: u64) {
        self.bytes_transmitted.fetch_add(n, Ordering::Relaxed);
    }

    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn bytes_transmitted(&self) -> u64 {
        self.bytes_transmitted.load(Ordering::Relaxed)
    }
}

/// Decides whether an accepted client connection may use the tunnel.
///
/// Rejected connections are closed immediately without touching the relay.
pub trait AdmissionPolicy: Send + Sync {
    fn permit(&self, peer: SocketAddr) -> bool;
}

impl<F> AdmissionPolicy for F
where
    F: Fn(SocketAddr) -> bool + Send + Sync,
{
    fn permit(&self, peer: SocketAddr) -> bool {
        self(peer)
    }
}

/// Policy that admits every client.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AdmissionPolicy for AllowAll {
    fn permit(&self, _peer: SocketAddr) -> bool {
        true
    }
}
