//! Runt sizing, packetization and protocol selection.
//!
//! A long message can be sent as a *runt*: its head goes out eagerly in
//! regular packets while the receiver fetches the rest with an RDMA read.
//! The runt size depends on the memory kind of the source buffer:
//! accelerator memory must be copied in alignment-sized units on the
//! receiving side, host memory has no such constraint.

use serde::{Deserialize, Serialize};

use crate::op::MemoryKind;

/// Default per-peer runt budget in bytes.
pub const DEFAULT_RUNT_CEILING: usize = 307_200;
/// Default copy alignment for accelerator memory.
pub const ACCEL_ALIGNMENT: usize = 128;

/// Per-memory-kind runt ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntPolicy {
    /// Ceiling for host memory.
    pub host_ceiling: usize,
    /// Ceiling for accelerator memory.
    pub accel_ceiling: usize,
}

impl Default for RuntPolicy {
    fn default() -> Self {
        Self {
            host_ceiling: DEFAULT_RUNT_CEILING,
            accel_ceiling: DEFAULT_RUNT_CEILING,
        }
    }
}

impl RuntPolicy {
    /// Ceiling that applies to `kind`.
    pub fn ceiling(&self, kind: MemoryKind) -> usize {
        match kind {
            MemoryKind::Host => self.host_ceiling,
            MemoryKind::Accelerator => self.accel_ceiling,
        }
    }

    /// Runt size for a transfer with no other runt bytes in flight.
    pub fn runt_size(&self, total_len: usize, kind: MemoryKind, alignment: usize) -> usize {
        self.peer_runt_size(total_len, kind, alignment, 0)
    }

    /// Runt size when `in_flight` runt bytes to the same peer are still
    /// outstanding. The ceiling is a budget shared by all of them.
    pub fn peer_runt_size(
        &self,
        total_len: usize,
        kind: MemoryKind,
        alignment: usize,
        in_flight: usize,
    ) -> usize {
        let ceiling = self.ceiling(kind);
        if total_len == 0 || in_flight >= ceiling {
            return 0;
        }
        let capped = (ceiling - in_flight).min(total_len);
        match kind {
            MemoryKind::Host => capped,
            MemoryKind::Accelerator => match align_down(capped, alignment) {
                0 => capped,
                aligned => aligned,
            },
        }
    }
}

/// Runt size under the default ceilings.
///
/// ```
/// use rdm_core::op::MemoryKind;
/// use rdm_core::sizing::compute_runt_size;
///
/// assert_eq!(compute_runt_size(300, MemoryKind::Accelerator, 128), 256);
/// assert_eq!(compute_runt_size(64, MemoryKind::Accelerator, 128), 64);
/// ```
pub fn compute_runt_size(total_len: usize, kind: MemoryKind, alignment: usize) -> usize {
    RuntPolicy::default().runt_size(total_len, kind, alignment)
}

/// Largest multiple of `alignment` not above `value`. Alignments of 0 or 1
/// leave the value unchanged.
pub fn align_down(value: usize, alignment: usize) -> usize {
    if alignment <= 1 {
        value
    } else {
        value - value % alignment
    }
}

fn align_up(value: usize, alignment: usize) -> usize {
    if alignment <= 1 {
        value
    } else {
        value.div_ceil(alignment) * alignment
    }
}

/// Splits `len` bytes into packet payload sizes.
///
/// Segments are as even as possible and never exceed `max_payload`. With
/// an alignment above one, every segment except the last is a multiple of
/// it. A zero-byte message still takes one packet.
pub fn plan_packets(len: usize, max_payload: usize, alignment: usize) -> Vec<usize> {
    if len == 0 || max_payload == 0 {
        return vec![0];
    }
    let count = len.div_ceil(max_payload);
    let mut per = len.div_ceil(count);
    if alignment > 1 {
        let cap = match align_down(max_payload, alignment) {
            0 => max_payload,
            cap => cap,
        };
        per = align_up(per, alignment).min(cap);
    }
    let count = len.div_ceil(per);
    let mut sizes = vec![per; count];
    if let Some(last) = sizes.last_mut() {
        *last = len - per * (count - 1);
    }
    sizes
}

/// Wire protocol used for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    /// Whole message in a single packet.
    Eager,
    /// Several packets, no RDMA.
    Medium,
    /// Header only; the receiver reads the whole payload.
    LongRead,
    /// Head sent in packets, tail read by the receiver.
    RuntRead {
        /// Bytes sent eagerly.
        runt: usize,
    },
}

impl Protocol {
    /// True if the receiver fetches data with an RDMA read.
    pub fn is_read_based(&self) -> bool {
        matches!(self, Protocol::LongRead | Protocol::RuntRead { .. })
    }
}

/// Size thresholds for protocol selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    /// Largest payload that fits one packet.
    pub max_payload: usize,
    /// Largest message sent with the medium protocol.
    pub medium_max: usize,
}

impl Thresholds {
    /// True if a message of `len` bytes is long enough for a read-based
    /// protocol and so needs the peer's capabilities first.
    pub fn is_long(&self, len: usize) -> bool {
        len > self.medium_max && len > self.max_payload
    }
}

/// Picks the protocol for a message of `len` bytes.
///
/// `peer_can_read` must come from a completed handshake; `runt` from
/// [`RuntPolicy::peer_runt_size`].
pub fn select_protocol(len: usize, thresholds: Thresholds, peer_can_read: bool, runt: usize) -> Protocol {
    if len <= thresholds.max_payload {
        return Protocol::Eager;
    }
    if !thresholds.is_long(len) || !peer_can_read {
        return Protocol::Medium;
    }
    if runt > 0 && runt < len {
        Protocol::RuntRead { runt }
    } else {
        Protocol::LongRead
    }
}


#[cfg(test)]
mod proptest_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn test_accel_runt_is_aligned(total_len in 0usize..2_000_000) {
            let runt = compute_runt_size(total_len, MemoryKind::Accelerator, 128);
            prop_assert!(runt <= total_len);
            if total_len < 128 {
                prop_assert_eq!(runt, total_len);
            } else {
                prop_assert_eq!(runt % 128, 0);
            }
        }

        #[test]
        fn test_plan_packets_covers_len(
            len in 1usize..200_000,
            max_payload in 256usize..9000,
            align in prop_oneof![Just(1usize), Just(8usize), Just(128usize)],
        ) {
            let sizes = plan_packets(len, max_payload, align);
            prop_assert_eq!(sizes.iter().sum::<usize>(), len);
            prop_assert!(sizes.iter().all(|s| *s <= max_payload && *s > 0));
        }
    }
}
