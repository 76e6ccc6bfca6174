//! Protocol engine counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Point-in-time copy of [`ProtocolMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Packets whose send completed successfully.
    pub packets_sent: u64,
    /// Packets posted again after RNR or device busy.
    pub packets_resent: u64,
    /// Duplicate message ids dropped.
    pub duplicates: u64,
    /// Messages evicted from overflow lists.
    pub overflow_losses: u64,
    /// RNR completions received.
    pub rnr_events: u64,
    /// Posts rejected with a full peer queue.
    pub queue_full: u64,
    /// Posts rejected for lack of packet entries.
    pub pool_exhausted: u64,
    /// Handshakes completed.
    pub handshakes_completed: u64,
    /// Receive completions dropped for an unresolvable sender.
    pub completions_dropped: u64,
    /// Peers recovered from a receive completion.
    pub peers_recovered: u64,
    /// Send-side failure events.
    pub send_failures: u64,
    /// Receive-side failure events.
    pub recv_failures: u64,
    /// Bytes delivered to receives.
    pub bytes_received: u64,
}

/// Atomic counters shared with observers through an `Arc`.
#[derive(Default)]
pub struct ProtocolMetrics {
    packets_sent: AtomicU64,
    packets_resent: AtomicU64,
    duplicates: AtomicU64,
    overflow_losses: AtomicU64,
    rnr_events: AtomicU64,
    queue_full: AtomicU64,
    pool_exhausted: AtomicU64,
    handshakes_completed: AtomicU64,
    completions_dropped: AtomicU64,
    peers_recovered: AtomicU64,
    send_failures: AtomicU64,
    recv_failures: AtomicU64,
    bytes_received: AtomicU64,
}

impl ProtocolMetrics {
    /// New zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one sent packet.
    pub fn inc_packets_sent(&self) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one resent packet.
    pub fn inc_packets_resent(&self) {
        self.packets_resent.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one duplicate message.
    pub fn inc_duplicates(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one overflow loss.
    pub fn inc_overflow_losses(&self) {
        self.overflow_losses.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one RNR event.
    pub fn inc_rnr_events(&self) {
        self.rnr_events.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one queue-full rejection.
    pub fn inc_queue_full(&self) {
        self.queue_full.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one pool exhaustion.
    pub fn inc_pool_exhausted(&self) {
        self.pool_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one completed handshake.
    pub fn inc_handshakes_completed(&self) {
        self.handshakes_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one dropped completion.
    pub fn inc_completions_dropped(&self) {
        self.completions_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one recovered peer.
    pub fn inc_peers_recovered(&self) {
        self.peers_recovered.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one send failure.
    pub fn inc_send_failures(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one receive failure.
    pub fn inc_recv_failures(&self) {
        self.recv_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds to the received byte counter.
    pub fn add_bytes_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Reads every counter.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_resent: self.packets_resent.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            overflow_losses: self.overflow_losses.load(Ordering::Relaxed),
            rnr_events: self.rnr_events.load(Ordering::Relaxed),
            queue_full: self.queue_full.load(Ordering::Relaxed),
            pool_exhausted: self.pool_exhausted.load(Ordering::Relaxed),
            handshakes_completed: self.handshakes_completed.load(Ordering::Relaxed),
            completions_dropped: self.completions_dropped.load(Ordering::Relaxed),
            peers_recovered: self.peers_recovered.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            recv_failures: self.recv_failures.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for ProtocolMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_new_is_zeroed() {
        assert_eq!(ProtocolMetrics::new().snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_counters() {
        let m = ProtocolMetrics::new();
        m.inc_packets_sent();
        m.inc_packets_sent();
        m.inc_rnr_events();
        m.add_bytes_received(4096);
        let s = m.snapshot();
        assert_eq!(s.packets_sent, 2);
        assert_eq!(s.rnr_events, 1);
        assert_eq!(s.bytes_received, 4096);
        assert_eq!(s.duplicates, 0);
    }

    #[test]
    fn test_shared_across_threads() {
        let m = Arc::new(ProtocolMetrics::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let m = Arc::clone(&m);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        m.inc_duplicates();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(m.snapshot().duplicates, 400);
    }

    #[test]
    fn test_snapshot_serializes() {
        let m = ProtocolMetrics::new();
        m.inc_queue_full();
        let json = serde_json::to_value(m.snapshot()).unwrap();
        assert_eq!(json["queue_full"], 1);
    }
}
