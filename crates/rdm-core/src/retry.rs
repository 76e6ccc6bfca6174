//! Receiver-not-ready backoff and the per-peer retry queue.
//!
//! A peer whose receive queue was empty answers with RNR. The rejected
//! packet stays with its operation and waits in the peer's queue; the peer
//! enters backoff, which grows with every consecutive RNR and resets on
//! the next successful send. The same queue holds posts that wait for the
//! handshake or for an earlier queued item, so everything to one peer
//! leaves in posting order.
//!
//! There are no timers: the caller passes `now` to the endpoint's progress
//! call, which is the only place a backoff can expire.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ProtocolError, Result};
use crate::op::OpHandle;
use crate::peer::PeerAddr;
use crate::pool::PacketHandle;

/// Longest backoff any policy produces, before jitter.
pub const BACKOFF_CEILING: Duration = Duration::from_secs(3600);

/// Backoff shape used after an RNR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryPolicy {
    /// Same delay after every RNR.
    Fixed(Duration),
    /// Exponential backoff using [`RetryConfig`] settings.
    ExponentialBackoff,
}

/// Configuration for RNR retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Backoff shape (default: exponential).
    pub policy: RetryPolicy,
    /// RNR rejections tolerated per operation before it fails; `None` retries forever.
    pub max_rnr_retries: Option<u32>,
    /// First backoff (default: 100us).
    pub initial_backoff: Duration,
    /// Backoff ceiling (default: 1s).
    pub max_backoff: Duration,
    /// Exponential multiplier (default: 2.0).
    pub backoff_multiplier: f64,
    /// Add 0-50% random jitter (default: true).
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            policy: RetryPolicy::ExponentialBackoff,
            max_rnr_retries: None,
            initial_backoff: Duration::from_micros(100),
            max_backoff: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Backoff after the `attempt`-th consecutive RNR (0-based).
    ///
    /// Exponential: `initial_backoff * backoff_multiplier^attempt`, capped
    /// at `max_backoff`. Jitter adds up to half the computed delay. Every
    /// policy is capped at [`BACKOFF_CEILING`].
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = match self.policy {
            RetryPolicy::Fixed(d) => d.min(BACKOFF_CEILING),
            RetryPolicy::ExponentialBackoff => {
                let initial_us = self.initial_backoff.as_micros() as f64;
                let max_us = self.max_backoff.min(BACKOFF_CEILING).as_micros() as f64;
                let exp = attempt.min(i32::MAX as u32) as i32;
                let computed = initial_us * self.backoff_multiplier.powi(exp);
                Duration::from_micros(computed.min(max_us) as u64)
            }
        };
        if self.jitter {
            let half = base.as_micros() as u64 / 2;
            if half > 0 {
                let extra = rand::thread_rng().gen_range(0..=half);
                return base.saturating_add(Duration::from_micros(extra));
            }
        }
        base
    }

    /// True if an operation that has seen `rnr_count` rejections has
    /// used up its retries.
    pub fn exhausted(&self, rnr_count: u32) -> bool {
        self.max_rnr_retries.is_some_and(|max| rnr_count > max)
    }
}

/// One item waiting in a peer queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuedWork {
    /// A whole operation that has not been posted yet.
    Op(OpHandle),
    /// One packet rejected with RNR or refused by a busy device.
    Packet(PacketHandle),
}

/// Per-peer bounded FIFO with RNR backoff state.
#[derive(Debug)]
pub struct RetryQueue {
    peer: PeerAddr,
    items: VecDeque<QueuedWork>,
    queued_ops: usize,
    limit: usize,
    backoff_until: Option<Instant>,
    consecutive_rnr: u32,
}

impl RetryQueue {
    /// Queue for `peer` accepting at most `limit` posted operations.
    pub fn new(peer: PeerAddr, limit: usize) -> Self {
        Self {
            peer,
            items: VecDeque::new(),
            queued_ops: 0,
            limit,
            backoff_until: None,
            consecutive_rnr: 0,
        }
    }

    /// Queues a newly posted operation.
    ///
    /// The check is `queued_ops + 1 > limit`: a queue holding `limit - 1`
    /// operations still takes one more, so the limit itself is always
    /// accepted. Packets waiting for a resend do not count.
    pub fn push_posted(&mut self, op: OpHandle) -> Result<()> {
        if self.queued_ops + 1 > self.limit {
            return Err(ProtocolError::QueueFull {
                peer: self.peer,
                limit: self.limit,
            });
        }
        self.items.push_back(QueuedWork::Op(op));
        self.queued_ops += 1;
        Ok(())
    }

    /// Queues work the engine itself generated. Never rejected: the
    /// operation was already accepted.
    pub fn push_internal(&mut self, work: QueuedWork) {
        self.count_in(&work);
        self.items.push_back(work);
    }

    /// Puts an item back at the head after a failed release attempt.
    pub fn push_front(&mut self, work: QueuedWork) {
        self.count_in(&work);
        self.items.push_front(work);
    }

    fn count_in(&mut self, work: &QueuedWork) {
        if matches!(work, QueuedWork::Op(_)) {
            self.queued_ops += 1;
        }
    }

    /// Next item, if any.
    pub fn front(&self) -> Option<&QueuedWork> {
        self.items.front()
    }

    /// Removes the next item.
    pub fn pop_front(&mut self) -> Option<QueuedWork> {
        let work = self.items.pop_front()?;
        if matches!(work, QueuedWork::Op(_)) {
            self.queued_ops -= 1;
        }
        Some(work)
    }

    /// Removes every item that belongs to `op` or is one of `packets`.
    /// Returns how many were removed.
    pub fn remove_op(&mut self, op: OpHandle, packets: &[PacketHandle]) -> usize {
        let before = self.items.len();
        let mut ops_removed = 0;
        self.items.retain(|w| match w {
            QueuedWork::Op(h) if *h == op => {
                ops_removed += 1;
                false
            }
            QueuedWork::Op(_) => true,
            QueuedWork::Packet(p) => !packets.contains(p),
        });
        self.queued_ops -= ops_removed;
        before - self.items.len()
    }

    /// Drains everything.
    pub fn drain(&mut self) -> Vec<QueuedWork> {
        self.queued_ops = 0;
        self.items.drain(..).collect()
    }

    /// Records an RNR at `now` and starts backoff.
    pub fn on_rnr(&mut self, now: Instant, config: &RetryConfig) -> Duration {
        let wait = config.backoff(self.consecutive_rnr);
        self.consecutive_rnr = self.consecutive_rnr.saturating_add(1);
        self.backoff_until = now.checked_add(wait).or(self.backoff_until).or(Some(now));
        debug!(peer = %self.peer, consecutive = self.consecutive_rnr, ?wait, "peer entered RNR backoff");
        wait
    }

    /// Records a successful send; ends backoff escalation.
    pub fn on_success(&mut self) {
        self.consecutive_rnr = 0;
    }

    /// True while the peer is backing off at `now`.
    pub fn in_backoff(&self, now: Instant) -> bool {
        self.backoff_until.is_some_and(|t| now < t)
    }

    /// True if new posts must queue behind existing work.
    pub fn is_blocking(&self, now: Instant) -> bool {
        !self.items.is_empty() || self.in_backoff(now)
    }

    /// Consecutive RNRs since the last success.
    pub fn consecutive_rnr(&self) -> u32 {
        self.consecutive_rnr
    }

    /// Posted operations waiting; this is what the limit bounds.
    pub fn queued_ops(&self) -> usize {
        self.queued_ops
    }

    /// Items waiting.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True if nothing waits.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Configured limit for posted operations.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Changes the limit for future posts.
    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;

    fn ops(n: usize) -> Vec<OpHandle> {
        let mut arena = Arena::with_capacity(n);
        (0..n).map(|i| OpHandle(arena.insert(i).unwrap())).collect()
    }

    fn packet() -> PacketHandle {
        let mut arena = Arena::with_capacity(1);
        PacketHandle(arena.insert(()).unwrap())
    }

    fn no_jitter() -> RetryConfig {
        RetryConfig {
            jitter: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.policy, RetryPolicy::ExponentialBackoff);
        assert_eq!(config.max_rnr_retries, None);
        assert_eq!(config.initial_backoff, Duration::from_micros(100));
        assert_eq!(config.max_backoff, Duration::from_secs(1));
        assert_eq!(config.backoff_multiplier, 2.0);
        assert!(config.jitter);
    }

    #[test]
    fn test_exponential_backoff() {
        let config = no_jitter();
        assert_eq!(config.backoff(0), Duration::from_micros(100));
        assert_eq!(config.backoff(1), Duration::from_micros(200));
        assert_eq!(config.backoff(2), Duration::from_micros(400));
        assert_eq!(config.backoff(40), Duration::from_secs(1));
    }

    #[test]
    fn test_fixed_backoff() {
        let config = RetryConfig {
            policy: RetryPolicy::Fixed(Duration::from_millis(3)),
            ..no_jitter()
        };
        assert_eq!(config.backoff(0), Duration::from_millis(3));
        assert_eq!(config.backoff(9), Duration::from_millis(3));
    }

    #[test]
    fn test_jitter_bounds() {
        let config = RetryConfig::default();
        for attempt in 0..5 {
            let base = no_jitter().backoff(attempt);
            let got = config.backoff(attempt);
            assert!(got >= base);
            assert!(got <= base + base / 2);
        }
    }

    #[test]
    fn test_retries_exhausted() {
        let config = RetryConfig {
            max_rnr_retries: Some(2),
            ..no_jitter()
        };
        assert!(!config.exhausted(2));
        assert!(config.exhausted(3));
        assert!(!no_jitter().exhausted(u32::MAX));
    }

    #[test]
    fn test_limit_itself_is_accepted() {
        let handles = ops(4);
        let mut q = RetryQueue::new(PeerAddr(1), 3);
        for h in &handles[..3] {
            assert!(q.push_posted(*h).is_ok());
        }
        assert_eq!(
            q.push_posted(handles[3]),
            Err(ProtocolError::QueueFull {
                peer: PeerAddr(1),
                limit: 3
            })
        );
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn test_internal_work_bypasses_limit() {
        let handles = ops(1);
        let mut q = RetryQueue::new(PeerAddr(1), 1);
        q.push_posted(handles[0]).unwrap();
        q.push_internal(QueuedWork::Packet(packet()));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_fifo_order() {
        let handles = ops(3);
        let mut q = RetryQueue::new(PeerAddr(1), 8);
        for h in &handles {
            q.push_posted(*h).unwrap();
        }
        let drained: Vec<_> = q.drain();
        assert_eq!(
            drained,
            handles.iter().map(|h| QueuedWork::Op(*h)).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_backoff_window() {
        let mut q = RetryQueue::new(PeerAddr(1), 8);
        let now = Instant::now();
        let wait = q.on_rnr(now, &no_jitter());
        assert_eq!(wait, Duration::from_micros(100));
        assert!(q.in_backoff(now));
        assert!(q.is_blocking(now));
        assert!(!q.in_backoff(now + wait));

        let wait2 = q.on_rnr(now, &no_jitter());
        assert_eq!(wait2, Duration::from_micros(200));
        q.on_success();
        assert_eq!(q.consecutive_rnr(), 0);
    }

    #[test]
    fn test_remove_op() {
        let handles = ops(2);
        let mut q = RetryQueue::new(PeerAddr(1), 8);
        q.push_posted(handles[0]).unwrap();
        q.push_posted(handles[1]).unwrap();
        let p = packet();
        q.push_internal(QueuedWork::Packet(p));
        assert_eq!(q.remove_op(handles[0], &[]), 1);
        assert_eq!(q.remove_op(handles[0], &[]), 0);
        assert_eq!(q.remove_op(handles[1], &[p]), 2);
        assert!(q.is_empty());
    }

    #[test]
    fn test_huge_fixed_backoff_is_capped() {
        let config = RetryConfig {
            policy: RetryPolicy::Fixed(Duration::MAX),
            ..RetryConfig::default()
        };
        assert!(config.backoff(0) <= BACKOFF_CEILING + BACKOFF_CEILING / 2);
        let mut q = RetryQueue::new(PeerAddr(1), 8);
        let now = Instant::now();
        q.on_rnr(now, &config);
        assert!(q.in_backoff(now));
    }

    #[test]
    fn test_resend_packets_do_not_count_against_limit() {
        let handles = ops(3);
        let mut q = RetryQueue::new(PeerAddr(1), 2);
        for _ in 0..3 {
            q.push_internal(QueuedWork::Packet(packet()));
        }
        assert!(q.push_posted(handles[0]).is_ok());
        assert!(q.push_posted(handles[1]).is_ok());
        assert!(q.push_posted(handles[2]).is_err());
        assert_eq!(q.queued_ops(), 2);
        assert_eq!(q.len(), 5);

        while q.pop_front().is_some() {}
        assert_eq!(q.queued_ops(), 0);
        q.push_front(QueuedWork::Op(handles[0]));
        assert_eq!(q.queued_ops(), 1);
        assert_eq!(q.remove_op(handles[0], &[]), 1);
        assert_eq!(q.queued_ops(), 0);
    }
}
