//! Observability counters.
//!
//! One [`Metrics`] is created per client and shared via `Arc` between the
//! session tasks and the NAT engine. Relaxed atomics only: the values are
//! for reporting, nothing synchronizes on them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

#[derive(Debug)]
pub struct Metrics {
    pub packets_sent: AtomicU64,
    pub packets_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    /// Packets dropped for an unreadable body
    pub malformed_packets: AtomicU64,
    /// Connections torn down for an untrustworthy frame boundary
    pub framing_errors: AtomicU64,
    pub logins_succeeded: AtomicU64,
    pub logins_failed: AtomicU64,
    pub keepalive_echoes: AtomicU64,
    pub peer_channels_requested: AtomicU64,
    pub peer_channels_established: AtomicU64,
    pub peer_channels_unreachable: AtomicU64,
    pub peer_channels_lost: AtomicU64,
    /// Active endpoint switched after an authenticated re-handshake
    pub rehandshakes: AtomicU64,
    /// Peer datagrams discarded (bad token, bad proof, wrong endpoint)
    pub datagrams_dropped: AtomicU64,
    start_time: Instant,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            packets_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            malformed_packets: AtomicU64::new(0),
            framing_errors: AtomicU64::new(0),
            logins_succeeded: AtomicU64::new(0),
            logins_failed: AtomicU64::new(0),
            keepalive_echoes: AtomicU64::new(0),
            peer_channels_requested: AtomicU64::new(0),
            peer_channels_established: AtomicU64::new(0),
            peer_channels_unreachable: AtomicU64::new(0),
            peer_channels_lost: AtomicU64::new(0),
            rehandshakes: AtomicU64::new(0),
            datagrams_dropped: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn packet_sent(&self, byte_count: u64) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn packet_received(&self, byte_count: u64) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn malformed_packet(&self) {
        self.malformed_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn framing_error(&self) {
        self.framing_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn login_result(&self, success: bool) {
        let counter = if success {
            &self.logins_succeeded
        } else {
            &self.logins_failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn keepalive_echoed(&self) {
        self.keepalive_echoes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn peer_channel_requested(&self) {
        self.peer_channels_requested.fetch_add(1, Ordering::Relaxed);
    }

    pub fn peer_channel_established(&self) {
        self.peer_channels_established.fetch_add(1, Ordering::Relaxed);
    }

    pub fn peer_channel_unreachable(&self) {
        self.peer_channels_unreachable.fetch_add(1, Ordering::Relaxed);
    }

    pub fn peer_channel_lost(&self) {
        self.peer_channels_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rehandshake(&self) {
        self.rehandshakes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn datagram_dropped(&self) {
        self.datagrams_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            malformed_packets: self.malformed_packets.load(Ordering::Relaxed),
            framing_errors: self.framing_errors.load(Ordering::Relaxed),
            logins_succeeded: self.logins_succeeded.load(Ordering::Relaxed),
            logins_failed: self.logins_failed.load(Ordering::Relaxed),
            keepalive_echoes: self.keepalive_echoes.load(Ordering::Relaxed),
            peer_channels_requested: self.peer_channels_requested.load(Ordering::Relaxed),
            peer_channels_established: self.peer_channels_established.load(Ordering::Relaxed),
            peer_channels_unreachable: self.peer_channels_unreachable.load(Ordering::Relaxed),
            peer_channels_lost: self.peer_channels_lost.load(Ordering::Relaxed),
            rehandshakes: self.rehandshakes.load(Ordering::Relaxed),
            datagrams_dropped: self.datagrams_dropped.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            packets_sent = snapshot.packets_sent,
            packets_received = snapshot.packets_received,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            malformed_packets = snapshot.malformed_packets,
            framing_errors = snapshot.framing_errors,
            logins_succeeded = snapshot.logins_succeeded,
            logins_failed = snapshot.logins_failed,
            keepalive_echoes = snapshot.keepalive_echoes,
            peer_channels_requested = snapshot.peer_channels_requested,
            peer_channels_established = snapshot.peer_channels_established,
            peer_channels_unreachable = snapshot.peer_channels_unreachable,
            peer_channels_lost = snapshot.peer_channels_lost,
            rehandshakes = snapshot.rehandshakes,
            datagrams_dropped = snapshot.datagrams_dropped,
            uptime_seconds = snapshot.uptime_seconds,
            "Protocol metrics"
        );
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub malformed_packets: u64,
    pub framing_errors: u64,
    pub logins_succeeded: u64,
    pub logins_failed: u64,
    pub keepalive_echoes: u64,
    pub peer_channels_requested: u64,
    pub peer_channels_established: u64,
    pub peer_channels_unreachable: u64,
    pub peer_channels_lost: u64,
    pub rehandshakes: u64,
    pub datagrams_dropped: u64,
    pub uptime_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_counters() {
        let metrics = Metrics::new();
        metrics.packet_sent(12);
        metrics.packet_sent(8);
        metrics.packet_received(5);
        metrics.login_result(true);
        metrics.login_result(false);
        metrics.login_result(false);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.packets_sent, 2);
        assert_eq!(snapshot.bytes_sent, 20);
        assert_eq!(snapshot.bytes_received, 5);
        assert_eq!(snapshot.logins_succeeded, 1);
        assert_eq!(snapshot.logins_failed, 2);
    }

    #[test]
    fn test_shared_across_threads() {
        let metrics = Arc::new(Metrics::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let metrics = metrics.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        metrics.datagram_dropped();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap_or_default();
        }
        assert_eq!(metrics.snapshot().datagrams_dropped, 400);
    }
}
