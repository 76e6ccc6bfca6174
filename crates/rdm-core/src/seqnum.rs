//! Wrap-aware message sequence numbers.
//!
//! Message ids are a 32-bit counter that wraps. Ordering between two ids is
//! defined by their wrapping difference read as a signed value, so an id just
//! past the wrap point still compares greater than one just before it.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-peer message sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct MsgId(pub u32);

impl MsgId {
    /// Signed distance from `other` to `self`.
    pub fn distance_from(self, other: MsgId) -> i32 {
        self.0.wrapping_sub(other.0) as i32
    }

    /// Next id in sequence.
    pub fn next(self) -> MsgId {
        MsgId(self.0.wrapping_add(1))
    }

    /// True if `self` comes strictly after `other`.
    pub fn is_after(self, other: MsgId) -> bool {
        self.distance_from(other) > 0
    }

    /// True if `self` comes strictly before `other`.
    pub fn is_before(self, other: MsgId) -> bool {
        self.distance_from(other) < 0
    }
}

impl From<u32> for MsgId {
    fn from(v: u32) -> Self {
        MsgId(v)
    }
}

impl fmt::Display for MsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Extends wrapping ids into a monotonic 64-bit space.
///
/// Tracks one anchor in both spaces and maps nearby ids relative to it.
/// Ids more than `i32::MAX` away from the anchor alias, which callers bound
/// with a window much smaller than that.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unwrapper {
    anchor_wire: MsgId,
    anchor_ext: u64,
}

impl Unwrapper {
    /// Anchors the wire id `start` at extended position 0.
    pub fn new(start: MsgId) -> Self {
        Self {
            anchor_wire: start,
            anchor_ext: 0,
        }
    }

    /// Extended position of `id`, or `None` if it lies before extended 0.
    pub fn extend(&self, id: MsgId) -> Option<u64> {
        let diff = id.distance_from(self.anchor_wire) as i64;
        let ext = self.anchor_ext as i64 + diff;
        u64::try_from(ext).ok()
    }

    /// Moves the anchor forward to the given extended position.
    pub fn advance_to(&mut self, ext: u64) {
        let delta = ext.saturating_sub(self.anchor_ext);
        self.anchor_wire = MsgId(self.anchor_wire.0.wrapping_add(delta as u32));
        self.anchor_ext = ext;
    }

    /// Wire id at the current anchor.
    pub fn anchor(&self) -> MsgId {
        self.anchor_wire
    }

    /// Wire id for an extended position at or after the anchor.
    pub fn wire(&self, ext: u64) -> MsgId {
        let delta = ext.wrapping_sub(self.anchor_ext);
        MsgId(self.anchor_wire.0.wrapping_add(delta as u32))
    }
}
