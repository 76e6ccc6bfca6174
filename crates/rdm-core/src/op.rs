//! Operation entries: one per in-flight send, receive or RMA request.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::arena::Handle;
use crate::peer::PeerAddr;
use crate::pool::PacketHandle;
use crate::seqnum::MsgId;
use crate::sizing::Protocol;

/// Bits of a user tag available to applications.
pub const USER_TAG_MASK: u64 = 0x0FFF_FFFF_FFFF_FFFF;

/// Where a buffer lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MemoryKind {
    /// System memory.
    #[default]
    Host,
    /// Device memory (GPU/accelerator).
    Accelerator,
}

/// Registration descriptor attached to a user buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryDesc {
    /// Memory kind the buffer was registered as.
    pub kind: MemoryKind,
    /// Local key from registration.
    pub key: u64,
}

/// One element of a user scatter/gather list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoBuf {
    /// Buffer contents.
    pub data: Bytes,
    /// Registration descriptor, if the caller supplied one.
    pub desc: Option<MemoryDesc>,
}

impl IoBuf {
    /// Host buffer without a descriptor.
    pub fn host(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            desc: None,
        }
    }

    /// Buffer with an explicit descriptor.
    pub fn with_desc(data: impl Into<Bytes>, desc: MemoryDesc) -> Self {
        Self {
            data: data.into(),
            desc: Some(desc),
        }
    }
}

/// Remote memory target for RMA and atomics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteIov {
    /// Remote virtual address.
    pub addr: u64,
    /// Remote length.
    pub len: usize,
    /// Remote key.
    pub key: u64,
}

/// Per-call operation flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OpFlags(u32);

impl OpFlags {
    /// Completion is reported only after the receiver has the data.
    pub const DELIVERY_COMPLETE: Self = Self(1);
    /// Remote CQ data attached.
    pub const REMOTE_CQ_DATA: Self = Self(1 << 1);
    /// Peek for a matching message without receiving it.
    pub const PEEK: Self = Self(1 << 2);
    /// Reserve the peeked message for a later claimed receive.
    pub const CLAIM: Self = Self(1 << 3);
    /// Drop the peeked message.
    pub const DISCARD: Self = Self(1 << 4);

    /// No flags.
    pub fn empty() -> Self {
        Self(0)
    }

    /// True if all bits of `other` are set.
    pub fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// True if any bit of `other` is set.
    pub fn intersects(self, other: Self) -> bool {
        (self.0 & other.0) != 0
    }

    /// Raw bits.
    pub fn bits(self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for OpFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Tag and ignore mask for a tagged receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagMatch {
    /// Tag to match.
    pub tag: u64,
    /// Bits that are ignored when matching.
    pub ignore: u64,
}

impl TagMatch {
    /// Matches exactly `tag`.
    pub fn exact(tag: u64) -> Self {
        Self { tag, ignore: 0 }
    }

    /// True if a message carrying `tag` satisfies this matcher.
    pub fn matches(&self, tag: u64) -> bool {
        let care = !self.ignore & USER_TAG_MASK;
        (tag & care) == (self.tag & care)
    }
}

/// Atomic operation code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AtomicOp {
    /// Add operand to target.
    Sum,
    /// Overwrite target.
    Write,
    /// Compare and swap.
    CompareSwap,
}

/// What an operation does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    /// Untagged or tagged message send.
    Send {
        /// Tag for tagged messaging.
        tag: Option<u64>,
    },
    /// Untagged or tagged message receive.
    Recv {
        /// Matcher for tagged receives.
        tag: Option<TagMatch>,
    },
    /// RDMA read from peer memory.
    Read {
        /// Source in peer memory.
        remote: RemoteIov,
    },
    /// RDMA write into peer memory.
    Write {
        /// Destination in peer memory.
        remote: RemoteIov,
    },
    /// Remote atomic.
    Atomic {
        /// Operation code.
        op: AtomicOp,
        /// Target in peer memory.
        remote: RemoteIov,
    },
}

impl OpKind {
    /// True for operations on the transmit side.
    pub fn is_tx(&self) -> bool {
        !matches!(self, OpKind::Recv { .. })
    }

    /// True for RMA reads and writes, which use device RDMA.
    pub fn is_rma(&self) -> bool {
        matches!(self, OpKind::Read { .. } | OpKind::Write { .. })
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Send { tag: None } => "send",
            OpKind::Send { tag: Some(_) } => "tsend",
            OpKind::Recv { tag: None } => "recv",
            OpKind::Recv { tag: Some(_) } => "trecv",
            OpKind::Read { .. } => "read",
            OpKind::Write { .. } => "write",
            OpKind::Atomic { .. } => "atomic",
        }
    }
}

/// Stable handle to an operation entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpHandle(pub(crate) Handle);

impl OpHandle {
    /// Packs the handle for use as a wire-level operation id.
    pub fn to_bits(self) -> u64 {
        self.0.to_bits()
    }

    /// Rebuilds a handle from [`OpHandle::to_bits`].
    pub fn from_bits(bits: u64) -> Self {
        Self(Handle::from_bits(bits))
    }
}

/// Lifecycle state of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpState {
    /// Waiting in the peer queue (handshake, backoff or device busy).
    Queued,
    /// Packets posted; waiting for send completions.
    Sending,
    /// All packets sent; waiting for the peer's receipt.
    AwaitingReceipt,
    /// Receive posted, nothing matched yet.
    Posted,
    /// Receive matched; data arriving.
    Receiving,
    /// Receive waiting for its RDMA read to finish.
    Reading,
}

/// One in-flight operation.
#[derive(Debug)]
pub struct OpEntry {
    /// What the operation does.
    pub kind: OpKind,
    /// Flags given at post time.
    pub flags: OpFlags,
    /// Peer, if bound to one.
    pub peer: Option<PeerAddr>,
    /// Current state.
    pub state: OpState,
    /// Total payload length.
    pub total_len: usize,
    /// Bytes sent or received so far.
    pub bytes_done: usize,
    /// Memory kind of the source or destination buffer.
    pub memory_kind: MemoryKind,
    /// Gathered payload for sends; assembled data for receives.
    pub data: BytesMut,
    /// Packets currently owned by this operation.
    pub packets: Vec<PacketHandle>,
    /// Protocol picked at send time.
    pub protocol: Option<Protocol>,
    /// Message id assigned at send time.
    pub msg_id: Option<MsgId>,
    /// Runt bytes charged against the peer budget.
    pub runt_charged: usize,
    /// RNR rejections seen so far.
    pub rnr_count: u32,
    /// Tag of the matched message (receives).
    pub matched_tag: Option<u64>,
    /// Sender's op id, for sending a receipt back.
    pub remote_op: Option<u64>,
    /// Receiver must send a receipt when the message is complete.
    pub receipt_owed: bool,
    /// Receive consumes a message reserved by a claiming peek.
    pub claimed: bool,
    /// Sender got the peer's receipt.
    pub receipt_received: bool,
    /// Key of the region exposed for the peer's read.
    pub read_key: Option<u64>,
}

impl OpEntry {
    /// New entry in `state`.
    pub fn new(kind: OpKind, flags: OpFlags, peer: Option<PeerAddr>, total_len: usize, state: OpState) -> Self {
        Self {
            kind,
            flags,
            peer,
            state,
            total_len,
            bytes_done: 0,
            memory_kind: MemoryKind::Host,
            data: BytesMut::new(),
            packets: Vec::new(),
            protocol: None,
            msg_id: None,
            runt_charged: 0,
            rnr_count: 0,
            matched_tag: None,
            remote_op: None,
            receipt_owed: false,
            claimed: false,
            receipt_received: false,
            read_key: None,
        }
    }

    /// True if the sender asked for delivery-complete semantics.
    pub fn wants_delivery_complete(&self) -> bool {
        self.flags.contains(OpFlags::DELIVERY_COMPLETE)
    }
}

/// Concatenates a scatter/gather list.
pub fn gather(bufs: &[IoBuf]) -> BytesMut {
    let total: usize = bufs.iter().map(|b| b.data.len()).sum();
    let mut out = BytesMut::with_capacity(total);
    for b in bufs {
        out.extend_from_slice(&b.data);
    }
    out
}
