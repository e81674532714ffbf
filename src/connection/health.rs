//! Per-connection traffic counters and the health snapshot surfaced to
//! applications.

use crate::utils::time::now_millis;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Lock-free counters updated by the connection loops.
#[derive(Debug, Default)]
pub struct HealthCounters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    /// Observed round-trip time in microseconds; 0 until the first pong
    rtt_micros: AtomicU64,
    /// Epoch millis of the last heartbeat seen from the peer; 0 until then
    last_heartbeat_ms: AtomicU64,
}

impl HealthCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self, payload_bytes: u64) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(payload_bytes, Ordering::Relaxed);
    }

    pub fn record_received(&self, payload_bytes: u64) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(payload_bytes, Ordering::Relaxed);
    }

    pub fn record_rtt(&self, rtt: Duration) {
        self.rtt_micros
            .store(rtt.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_heartbeat(&self) {
        self.last_heartbeat_ms.store(now_millis(), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConnectionHealth {
        let rtt_micros = self.rtt_micros.load(Ordering::Relaxed);
        let last_heartbeat_ms = self.last_heartbeat_ms.load(Ordering::Relaxed);
        ConnectionHealth {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            rtt: (rtt_micros > 0).then(|| Duration::from_micros(rtt_micros)),
            last_heartbeat_ms: (last_heartbeat_ms > 0).then_some(last_heartbeat_ms),
        }
    }
}

/// Point-in-time view of a connection's traffic and liveness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionHealth {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    /// Round-trip observed on the most recent heartbeat exchange
    pub rtt: Option<Duration>,
    /// Epoch millis of the last heartbeat seen from the peer
    pub last_heartbeat_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_roll_up_into_snapshot() {
        let counters = HealthCounters::new();
        counters.record_sent(100);
        counters.record_sent(50);
        counters.record_received(10);

        let snap = counters.snapshot();
        assert_eq!(snap.bytes_sent, 150);
        assert_eq!(snap.messages_sent, 2);
        assert_eq!(snap.bytes_received, 10);
        assert_eq!(snap.messages_received, 1);
        assert_eq!(snap.rtt, None);
        assert_eq!(snap.last_heartbeat_ms, None);
    }

    #[test]
    fn rtt_and_heartbeat_become_visible() {
        let counters = HealthCounters::new();
        counters.record_rtt(Duration::from_millis(3));
        counters.record_heartbeat();

        let snap = counters.snapshot();
        assert_eq!(snap.rtt, Some(Duration::from_millis(3)));
        assert!(snap.last_heartbeat_ms.is_some());
    }
}
