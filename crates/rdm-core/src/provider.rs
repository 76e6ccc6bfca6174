//! Device collaborator consumed by the endpoint.
//!
//! The endpoint never touches hardware itself. Posting packets, RDMA work
//! requests, address-handle management, sender resolution and memory
//! registration all go through a [`FabricProvider`] passed in at
//! construction.

use bytes::Bytes;
use thiserror::Error;

use crate::error::Result;
use crate::op::{AtomicOp, IoBuf, MemoryKind, RemoteIov};
use crate::peer::{RawAddr, WireSender};

/// Why a post was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PostError {
    /// Device send queue is full; try again after completions.
    #[error("device busy")]
    Busy,
    /// The device rejected the request.
    #[error("post failed: {0}")]
    Failed(String),
}

/// Destination of a post.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Destination {
    /// Address handle number.
    pub ahn: u16,
    /// Device address.
    pub raw: RawAddr,
}

/// RDMA work request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RmaRequest {
    /// Read `remote` from the peer; data comes back with the completion.
    Read {
        /// Source region.
        remote: RemoteIov,
    },
    /// Write `data` into `remote`.
    Write {
        /// Bytes to write.
        data: Bytes,
        /// Destination region.
        remote: RemoteIov,
    },
    /// Atomic on a 64-bit word; the previous value comes back with the completion.
    Atomic {
        /// Operation code.
        op: AtomicOp,
        /// Operand, little endian.
        operand: u64,
        /// Compare value for compare-and-swap.
        compare: u64,
        /// Target word.
        remote: RemoteIov,
    },
}

/// Device operations used by the endpoint.
pub trait FabricProvider {
    /// Local device address.
    fn local_addr(&self) -> RawAddr;

    /// Posts a packet send. `work_id` comes back in the send completion.
    fn post_send(&mut self, dest: Destination, work_id: u64, packet: Bytes) -> std::result::Result<(), PostError>;

    /// Posts an RDMA work request.
    fn post_rma(&mut self, dest: Destination, work_id: u64, request: RmaRequest) -> std::result::Result<(), PostError>;

    /// Creates an address handle for a GID.
    fn create_ah(&mut self, gid: &[u8; 16]) -> Result<u16>;

    /// Destroys an address handle.
    fn destroy_ah(&mut self, ahn: u16);

    /// Resolves a receive-completion sender the endpoint has no entry for.
    fn resolve_sender(&mut self, sender: &WireSender) -> Option<RawAddr>;

    /// Memory kind of a user buffer.
    fn memory_kind(&self, buf: &IoBuf) -> MemoryKind {
        buf.desc.map(|d| d.kind).unwrap_or_default()
    }

    /// Exposes `data` for remote reads.
    fn register(&mut self, data: Bytes, kind: MemoryKind) -> Result<RemoteIov>;

    /// Withdraws a region from [`FabricProvider::register`].
    fn deregister(&mut self, key: u64);
}
