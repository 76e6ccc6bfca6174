//! Fixed-size packet entry pool.
//!
//! Every wire packet the endpoint posts is backed by an entry from this
//! pool. The pool is sized once at endpoint creation and never grows;
//! running out is reported as [`ProtocolError::PoolExhausted`] so the caller
//! can retry after draining completions.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::arena::{Arena, Handle};
use crate::error::{ProtocolError, Result};
use crate::op::OpHandle;
use crate::peer::PeerAddr;
use crate::provider::RmaRequest;

/// Stable handle to a packet entry; doubles as the device work-request id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PacketHandle(pub(crate) Handle);

impl PacketHandle {
    /// Work-request id given to the device.
    pub fn work_id(self) -> u64 {
        self.0.to_bits()
    }

    /// Rebuilds a handle from a work-request id.
    pub fn from_work_id(id: u64) -> Self {
        Self(Handle::from_bits(id))
    }
}

/// What a packet entry is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PacketState {
    /// Reserved, not yet handed to the device.
    Allocated,
    /// Handed to the device.
    Posted,
    /// Waiting in the peer queue to be posted again.
    QueuedForResend,
}

/// Work request a packet entry carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Work {
    /// Encoded wire packet for a send.
    Send(Bytes),
    /// RDMA request.
    Rma(RmaRequest),
}

/// A packet entry.
#[derive(Debug, Clone)]
pub struct PacketEntry {
    /// Operation that owns the packet; `None` for control packets.
    pub owner: Option<OpHandle>,
    /// Destination peer.
    pub peer: PeerAddr,
    /// What gets posted.
    pub work: Work,
    /// User payload bytes carried.
    pub data_len: usize,
    /// Current state.
    pub state: PacketState,
}

/// Pool statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Fixed capacity.
    pub capacity: usize,
    /// Entries currently in use.
    pub in_use: usize,
    /// Entries free.
    pub available: usize,
    /// Allocation attempts that failed.
    pub exhausted: u64,
}

/// Fixed-capacity pool of packet entries.
#[derive(Debug)]
pub struct PacketPool {
    entries: Arena<PacketEntry>,
    exhausted: u64,
}

impl PacketPool {
    /// Creates a pool of `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Arena::with_capacity(capacity),
            exhausted: 0,
        }
    }

    /// Allocates one entry.
    pub fn alloc(&mut self, entry: PacketEntry) -> Result<PacketHandle> {
        match self.entries.insert(entry) {
            Ok(h) => Ok(PacketHandle(h)),
            Err(_) => {
                self.exhausted += 1;
                Err(ProtocolError::PoolExhausted {
                    requested: 1,
                    available: 0,
                })
            }
        }
    }

    /// Fails unless `count` entries are free, without allocating any.
    pub fn reserve(&mut self, count: usize) -> Result<()> {
        let available = self.entries.available();
        if count > available {
            self.exhausted += 1;
            return Err(ProtocolError::PoolExhausted {
                requested: count,
                available,
            });
        }
        Ok(())
    }

    /// Returns an entry to the pool. Releasing twice is a no-op.
    pub fn release(&mut self, handle: PacketHandle) -> Option<PacketEntry> {
        self.entries.remove(handle.0)
    }

    /// Releases every entry addressed to `peer`. Returns how many.
    pub fn release_peer(&mut self, peer: PeerAddr) -> usize {
        let handles: Vec<Handle> = self
            .entries
            .iter()
            .filter(|(_, e)| e.peer == peer)
            .map(|(h, _)| h)
            .collect();
        for h in &handles {
            self.entries.remove(*h);
        }
        handles.len()
    }

    /// Shared access to a live entry.
    pub fn get(&self, handle: PacketHandle) -> Option<&PacketEntry> {
        self.entries.get(handle.0)
    }

    /// Exclusive access to a live entry.
    pub fn get_mut(&mut self, handle: PacketHandle) -> Option<&mut PacketEntry> {
        self.entries.get_mut(handle.0)
    }

    /// Free entries.
    pub fn available(&self) -> usize {
        self.entries.available()
    }

    /// Entries in use.
    pub fn in_use(&self) -> usize {
        self.entries.len()
    }

    /// Current statistics.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.entries.capacity(),
            in_use: self.entries.len(),
            available: self.entries.available(),
            exhausted: self.exhausted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> PacketEntry {
        PacketEntry {
            owner: None,
            peer: PeerAddr(0),
            work: Work::Send(Bytes::new()),
            data_len: 0,
            state: PacketState::Allocated,
        }
    }

    #[test]
    fn test_exhaustion_is_an_error() {
        let mut pool = PacketPool::new(2);
        pool.alloc(entry()).unwrap();
        pool.alloc(entry()).unwrap();
        let err = pool.alloc(entry()).unwrap_err();
        assert!(matches!(err, ProtocolError::PoolExhausted { .. }));
        assert_eq!(pool.stats().exhausted, 1);
    }

    #[test]
    fn test_reserve_does_not_allocate() {
        let mut pool = PacketPool::new(3);
        pool.alloc(entry()).unwrap();
        assert!(pool.reserve(2).is_ok());
        assert_eq!(pool.in_use(), 1);
        assert_eq!(
            pool.reserve(3),
            Err(ProtocolError::PoolExhausted {
                requested: 3,
                available: 2
            })
        );
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut pool = PacketPool::new(1);
        let h = pool.alloc(entry()).unwrap();
        assert!(pool.release(h).is_some());
        assert!(pool.release(h).is_none());
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_work_id_round_trip() {
        let mut pool = PacketPool::new(4);
        let h = pool.alloc(entry()).unwrap();
        assert_eq!(PacketHandle::from_work_id(h.work_id()), h);
        assert!(pool.get(h).is_some());
    }

    #[test]
    fn test_release_peer() {
        let mut pool = PacketPool::new(4);
        pool.alloc(entry()).unwrap();
        let other = pool
            .alloc(PacketEntry {
                peer: PeerAddr(1),
                ..entry()
            })
            .unwrap();
        pool.alloc(entry()).unwrap();
        assert_eq!(pool.release_peer(PeerAddr(0)), 2);
        assert_eq!(pool.in_use(), 1);
        assert!(pool.get(other).is_some());
    }

    #[test]
    fn test_steady_state_recycles_slots() {
        let mut pool = PacketPool::new(2);
        for _ in 0..100 {
            let h = pool.alloc(entry()).unwrap();
            pool.release(h);
        }
        assert_eq!(pool.stats().capacity, 2);
        assert_eq!(pool.available(), 2);
    }
}
