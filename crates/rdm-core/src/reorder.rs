//! Per-peer reorder window.
//!
//! Messages from one peer carry a wrapping [`MsgId`] and may arrive out of
//! order. The window releases them strictly in id order:
//!
//! - the expected id is released at once, together with every buffered id
//!   that directly follows it;
//! - ids inside `[expected, expected + window)` are buffered;
//! - ids beyond the window go to a bounded overflow list and are promoted
//!   into the window as it slides forward;
//! - ids before expected are duplicates and change nothing.
//!
//! Ids are unwrapped into a 64-bit space so the buffered set is an ordered
//! map even across counter wrap.

use std::collections::{BTreeMap, VecDeque};

use tracing::{trace, warn};

use crate::seqnum::{MsgId, Unwrapper};

/// Outcome of admitting one fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitResult {
    /// Released or buffered inside the window.
    Accepted,
    /// Already released; dropped without side effects.
    Duplicate,
    /// Parked on the overflow list. `evicted` names an older overflow
    /// entry that was dropped to stay within capacity.
    Overflowed {
        /// Message lost to make room, if any.
        evicted: Option<MsgId>,
    },
}

/// A message released in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered<T> {
    /// Id of the released message.
    pub msg_id: MsgId,
    /// Fragments in arrival order.
    pub fragments: Vec<T>,
}

/// Reorder window for one peer.
#[derive(Debug)]
pub struct ReorderWindow<T> {
    ids: Unwrapper,
    expected: u64,
    window: u64,
    overflow_capacity: usize,
    pending: BTreeMap<u64, Vec<T>>,
    overflow: VecDeque<(u64, Vec<T>)>,
    ready: VecDeque<Delivered<T>>,
    losses: u64,
}

impl<T> ReorderWindow<T> {
    /// Creates a window expecting id 0.
    pub fn new(window: u32, overflow_capacity: usize) -> Self {
        Self::starting_at(MsgId(0), window, overflow_capacity)
    }

    /// Creates a window expecting `start`.
    pub fn starting_at(start: MsgId, window: u32, overflow_capacity: usize) -> Self {
        Self {
            ids: Unwrapper::new(start),
            expected: 0,
            window: u64::from(window.max(1)),
            overflow_capacity,
            pending: BTreeMap::new(),
            overflow: VecDeque::new(),
            ready: VecDeque::new(),
            losses: 0,
        }
    }

    /// Admits one fragment of message `msg_id`.
    pub fn admit(&mut self, msg_id: MsgId, fragment: T) -> AdmitResult {
        let ext = match self.ids.extend(msg_id) {
            Some(ext) if ext >= self.expected => ext,
            _ => {
                trace!(%msg_id, expected = %self.expected(), "duplicate message id");
                return AdmitResult::Duplicate;
            }
        };

        let offset = ext - self.expected;
        if offset == 0 {
            self.release(ext, vec![fragment]);
            return AdmitResult::Accepted;
        }

        if offset < self.window {
            self.pending.entry(ext).or_default().push(fragment);
            return AdmitResult::Accepted;
        }

        if let Some((_, frags)) = self.overflow.iter_mut().find(|(e, _)| *e == ext) {
            frags.push(fragment);
            return AdmitResult::Overflowed { evicted: None };
        }

        self.overflow.push_back((ext, vec![fragment]));
        let mut evicted = None;
        if self.overflow.len() > self.overflow_capacity {
            if let Some((lost, _)) = self.overflow.pop_front() {
                let lost_id = self.ids.wire(lost);
                warn!(msg_id = %lost_id, capacity = self.overflow_capacity, "overflow list full, dropping oldest message");
                self.losses += 1;
                evicted = Some(lost_id);
            }
        }
        AdmitResult::Overflowed { evicted }
    }

    fn release(&mut self, ext: u64, fragments: Vec<T>) {
        self.ready.push_back(Delivered {
            msg_id: self.ids.wire(ext),
            fragments,
        });
        self.expected = ext + 1;
        loop {
            self.promote_overflow();
            match self.pending.remove(&self.expected) {
                Some(fragments) => {
                    self.ready.push_back(Delivered {
                        msg_id: self.ids.wire(self.expected),
                        fragments,
                    });
                    self.expected += 1;
                }
                None => break,
            }
        }
        self.ids.advance_to(self.expected);
    }

    fn promote_overflow(&mut self) {
        if self.overflow.is_empty() {
            return;
        }
        let bound = self.expected + self.window;
        let mut kept = VecDeque::with_capacity(self.overflow.len());
        while let Some((ext, frags)) = self.overflow.pop_front() {
            if ext < self.expected {
                continue;
            }
            if ext < bound {
                trace!(ext, "promoting overflow entry into window");
                self.pending.entry(ext).or_default().extend(frags);
            } else {
                kept.push_back((ext, frags));
            }
        }
        self.overflow = kept;
    }

    /// Takes every message released so far, in id order.
    pub fn take_ready(&mut self) -> Vec<Delivered<T>> {
        self.ready.drain(..).collect()
    }

    /// Next id the window will release.
    pub fn expected(&self) -> MsgId {
        self.ids.wire(self.expected)
    }

    /// Messages released since creation; never decreases.
    pub fn released_count(&self) -> u64 {
        self.expected
    }

    /// Ids buffered inside the window.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Ids parked on the overflow list.
    pub fn overflow_len(&self) -> usize {
        self.overflow.len()
    }

    /// Messages evicted from the overflow list.
    pub fn losses(&self) -> u64 {
        self.losses
    }

    /// True if `msg_id` is buffered or parked.
    pub fn is_held(&self, msg_id: MsgId) -> bool {
        match self.ids.extend(msg_id) {
            Some(ext) => {
                self.pending.contains_key(&ext) || self.overflow.iter().any(|(e, _)| *e == ext)
            }
            None => false,
        }
    }

    /// Drops everything held. Used when the peer goes away.
    pub fn clear(&mut self) -> usize {
        let n = self.pending.len() + self.overflow.len() + self.ready.len();
        self.pending.clear();
        self.overflow.clear();
        self.ready.clear();
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(delivered: &[Delivered<u32>]) -> Vec<u32> {
        delivered.iter().map(|d| d.msg_id.0).collect()
    }

    #[test]
    fn test_expected_msg_id_released() {
        let mut win = ReorderWindow::new(16, 4);
        assert_eq!(win.admit(MsgId(0), 100), AdmitResult::Accepted);
        assert_eq!(win.expected(), MsgId(1));
        let ready = win.take_ready();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].fragments, vec![100]);
    }

    #[test]
    fn test_smaller_msg_id_is_duplicate() {
        let mut win = ReorderWindow::new(16, 4);
        win.admit(MsgId(0), 0);
        win.admit(MsgId(1), 1);
        win.take_ready();
        assert_eq!(win.admit(MsgId(0), 0), AdmitResult::Duplicate);
        assert_eq!(win.expected(), MsgId(2));
        assert!(win.take_ready().is_empty());
    }

    #[test]
    fn test_larger_msg_id_buffered() {
        let mut win = ReorderWindow::new(16, 4);
        assert_eq!(win.admit(MsgId(3), 3), AdmitResult::Accepted);
        assert_eq!(win.pending_len(), 1);
        assert_eq!(win.expected(), MsgId(0));
        assert!(win.take_ready().is_empty());
    }

    #[test]
    fn test_out_of_order_sequence_releases_in_order() {
        let mut win = ReorderWindow::new(16, 4);
        for id in [0u32, 1, 3, 2] {
            assert_eq!(win.admit(MsgId(id), id), AdmitResult::Accepted);
        }
        assert_eq!(win.expected(), MsgId(4));
        assert_eq!(win.overflow_len(), 0);
        assert_eq!(ids(&win.take_ready()), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_overflow_msg_id() {
        let mut win = ReorderWindow::new(4, 2);
        assert_eq!(
            win.admit(MsgId(4), 4),
            AdmitResult::Overflowed { evicted: None }
        );
        assert_eq!(win.overflow_len(), 1);
        assert_eq!(win.pending_len(), 0);
    }

    #[test]
    fn test_overflow_evicts_oldest() {
        let mut win = ReorderWindow::new(4, 2);
        win.admit(MsgId(10), 10);
        win.admit(MsgId(11), 11);
        assert_eq!(
            win.admit(MsgId(12), 12),
            AdmitResult::Overflowed {
                evicted: Some(MsgId(10))
            }
        );
        assert_eq!(win.losses(), 1);
        assert_eq!(win.overflow_len(), 2);
        assert!(!win.is_held(MsgId(10)));
    }

    #[test]
    fn test_move_overflow_to_window() {
        let mut win = ReorderWindow::new(4, 8);
        win.admit(MsgId(4), 4);
        assert_eq!(win.overflow_len(), 1);
        win.admit(MsgId(0), 0);
        assert_eq!(win.overflow_len(), 0);
        assert_eq!(win.pending_len(), 1);
        assert!(win.is_held(MsgId(4)));
    }

    #[test]
    fn test_keep_entry_in_overflow_list() {
        let mut win = ReorderWindow::new(4, 8);
        win.admit(MsgId(6), 6);
        win.admit(MsgId(0), 0);
        assert_eq!(win.overflow_len(), 1);
        assert_eq!(win.pending_len(), 0);
    }

    #[test]
    fn test_append_overflow_fragment_to_window_slot() {
        let mut win = ReorderWindow::new(4, 8);
        assert_eq!(win.admit(MsgId(3), 30), AdmitResult::Accepted);
        win.admit(MsgId(4), 40);
        win.admit(MsgId(4), 41);
        win.admit(MsgId(0), 0);
        // window is now [1, 5): 4 moved in next to 3
        assert_eq!(win.overflow_len(), 0);
        win.admit(MsgId(1), 10);
        win.admit(MsgId(2), 20);
        let ready = win.take_ready();
        assert_eq!(ids(&ready), vec![0, 1, 2, 3, 4]);
        assert_eq!(ready[4].fragments, vec![40, 41]);
    }

    #[test]
    fn test_promoted_overflow_released_when_contiguous() {
        let mut win = ReorderWindow::new(2, 8);
        win.admit(MsgId(1), 1);
        win.admit(MsgId(2), 2);
        win.admit(MsgId(3), 3);
        assert_eq!(win.overflow_len(), 2);
        win.admit(MsgId(0), 0);
        assert_eq!(win.expected(), MsgId(4));
        assert_eq!(ids(&win.take_ready()), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_wraparound() {
        let mut win = ReorderWindow::starting_at(MsgId(u32::MAX - 1), 8, 4);
        win.admit(MsgId(0), 3);
        win.admit(MsgId(u32::MAX), 2);
        assert_eq!(win.admit(MsgId(u32::MAX - 2), 0), AdmitResult::Duplicate);
        win.admit(MsgId(u32::MAX - 1), 1);
        assert_eq!(win.expected(), MsgId(1));
        assert_eq!(ids(&win.take_ready()), vec![u32::MAX - 1, u32::MAX, 0]);
    }
}
