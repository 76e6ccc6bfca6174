//! Test harness - two simulated endpoints and helpers to drive them

use std::time::Duration;

use bytes::Bytes;
use rdm_core::sim::{Loopback, Pumped};
use rdm_core::{CompletionEvent, EndpointConfig, IoBuf, OpFlags, OpHandle, OpKind, Result, TagMatch};
use tracing::debug;

/// Rounds [`TestPair::settle`] runs before giving up.
pub const SETTLE_ROUNDS: usize = 10_000;

/// Small sizes so tests exercise every protocol with little data.
pub fn test_config() -> EndpointConfig {
    let mut config = EndpointConfig {
        tx_pool_size: 64,
        op_capacity: 256,
        max_payload: 1024,
        medium_max: 4096,
        reorder_window: 64,
        overflow_capacity: 8,
        queue_limit_per_peer: 32,
        ..Default::default()
    };
    config.runt.host_ceiling = 2048;
    config.runt.accel_ceiling = 2048;
    config.retry.jitter = false;
    config
}

/// Deterministic payload of `len` bytes.
pub fn pattern(len: usize, seed: u8) -> Bytes {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect::<Vec<u8>>()
        .into()
}

/// Finds the event for `op`.
pub fn event_for(events: &[CompletionEvent], op: OpHandle) -> Option<&CompletionEvent> {
    events.iter().find(|e| e.op() == Some(op))
}

/// Data carried by a successful event for `op`.
pub fn data_for(events: &[CompletionEvent], op: OpHandle) -> Option<Bytes> {
    match event_for(events, op)? {
        CompletionEvent::Success { data, .. } => data.clone(),
        _ => None,
    }
}

/// Loopback pair where `a` sends and `b` receives.
#[derive(Debug)]
pub struct TestPair {
    /// The wired endpoints.
    pub lo: Loopback,
}

impl TestPair {
    /// Pair with [`test_config`] on both sides.
    pub fn new() -> Self {
        Self::with_configs(test_config(), test_config())
    }

    /// Pair with explicit configurations.
    pub fn with_configs(a: EndpointConfig, b: EndpointConfig) -> Self {
        let lo = Loopback::new(a, b).expect("loopback setup");
        Self { lo }
    }

    /// Untagged send from `a` to `b`.
    pub fn send(&mut self, data: Bytes, flags: OpFlags) -> Result<OpHandle> {
        let peer = self.lo.a_to_b;
        self.lo
            .a
            .post_operation(peer, OpKind::Send { tag: None }, flags, &[IoBuf::host(data)])
    }

    /// Tagged send from `a` to `b`.
    pub fn send_tagged(&mut self, data: Bytes, tag: u64) -> Result<OpHandle> {
        let peer = self.lo.a_to_b;
        self.lo.a.post_operation(
            peer,
            OpKind::Send { tag: Some(tag) },
            OpFlags::empty(),
            &[IoBuf::host(data)],
        )
    }

    /// Untagged receive on `b` from `a`.
    pub fn recv(&mut self, len: usize) -> Result<OpHandle> {
        let peer = self.lo.b_to_a;
        self.lo.b.post_recv(Some(peer), len, None, OpFlags::empty())
    }

    /// Tagged receive on `b` from any peer.
    pub fn recv_tagged(&mut self, len: usize, matcher: TagMatch) -> Result<OpHandle> {
        self.lo.b.post_recv(None, len, Some(matcher), OpFlags::empty())
    }

    fn queues_empty(&self) -> bool {
        self.lo.a.queue_len(self.lo.a_to_b).unwrap_or(0) == 0
            && self.lo.b.queue_len(self.lo.b_to_a).unwrap_or(0) == 0
    }

    /// Pumps and advances the clock by a millisecond per round until both
    /// sides are quiet.
    pub fn settle(&mut self) -> Pumped {
        let mut all = Pumped::default();
        for round in 0..SETTLE_ROUNDS {
            let pumped = self.lo.pump();
            let idle = pumped.a.is_empty() && pumped.b.is_empty();
            all.a.extend(pumped.a);
            all.b.extend(pumped.b);
            if idle && self.queues_empty() {
                debug!(round, events_a = all.a.len(), events_b = all.b.len(), "pair settled");
                break;
            }
            self.lo.advance(Duration::from_millis(1));
        }
        all
    }
}

impl Default for TestPair {
    fn default() -> Self {
        Self::new()
    }
}
