//! Server metrics
//!
//! Counters kept for the whole life of the daemon and logged at shutdown.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Server-wide metrics
#[derive(Debug, Default)]
pub struct ServerMetrics {
    // Connection metrics
    /// Currently open transports
    pub active_connections: AtomicU64,
    /// Total transports accepted since start
    pub total_connections: AtomicU64,
    /// Transports turned away by the unauthenticated limit
    pub refused_connections: AtomicU64,
    /// Handshakes that failed or timed out
    pub failed_handshakes: AtomicU64,

    // Packet metrics
    pub packets_received: AtomicU64,
    pub packets_sent: AtomicU64,
    /// Packets dropped for exceeding the payload limit
    pub oversized_dropped: AtomicU64,
    /// Unsolicited messages dropped because a client queue was full
    pub events_dropped: AtomicU64,

    // Key metrics
    pub keys_routed: AtomicU64,
    /// Keys no client took
    pub keys_unrouted: AtomicU64,

    /// Parameter change notifications delivered
    pub notifications_sent: AtomicU64,

    start_time: Option<Instant>,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connection_refused(&self) {
        self.refused_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handshake_failed(&self) {
        self.failed_handshakes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packet_received(&self) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packet_sent(&self) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn oversized_dropped(&self) {
        self.oversized_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_dropped(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn key_routed(&self) {
        self.keys_routed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn key_unrouted(&self) {
        self.keys_unrouted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn notification_sent(&self) {
        self.notifications_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    /// Create a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            connections: ConnectionMetrics {
                active: self.active_connections.load(Ordering::Relaxed),
                total: self.total_connections.load(Ordering::Relaxed),
                refused: self.refused_connections.load(Ordering::Relaxed),
                failed_handshakes: self.failed_handshakes.load(Ordering::Relaxed),
            },
            packets: PacketMetrics {
                received: self.packets_received.load(Ordering::Relaxed),
                sent: self.packets_sent.load(Ordering::Relaxed),
                oversized: self.oversized_dropped.load(Ordering::Relaxed),
                events_dropped: self.events_dropped.load(Ordering::Relaxed),
            },
            keys: KeyMetrics {
                routed: self.keys_routed.load(Ordering::Relaxed),
                unrouted: self.keys_unrouted.load(Ordering::Relaxed),
            },
            notifications_sent: self.notifications_sent.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of every counter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections: ConnectionMetrics,
    pub packets: PacketMetrics,
    pub keys: KeyMetrics,
    pub notifications_sent: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionMetrics {
    pub active: u64,
    pub total: u64,
    pub refused: u64,
    pub failed_handshakes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketMetrics {
    pub received: u64,
    pub sent: u64,
    pub oversized: u64,
    pub events_dropped: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMetrics {
    pub routed: u64,
    pub unrouted: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_tracking() {
        let metrics = ServerMetrics::new();

        metrics.connection_opened();
        metrics.connection_opened();
        metrics.connection_refused();
        metrics.connection_closed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections.active, 1);
        assert_eq!(snapshot.connections.total, 2);
        assert_eq!(snapshot.connections.refused, 1);
    }

    #[test]
    fn test_packet_and_key_tracking() {
        let metrics = ServerMetrics::new();

        metrics.packet_received();
        metrics.packet_sent();
        metrics.packet_sent();
        metrics.oversized_dropped();
        metrics.key_routed();
        metrics.key_unrouted();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.packets.received, 1);
        assert_eq!(snapshot.packets.sent, 2);
        assert_eq!(snapshot.packets.oversized, 1);
        assert_eq!(snapshot.keys.routed, 1);
        assert_eq!(snapshot.keys.unrouted, 1);
    }
}
