//! Wire packet codec.
//!
//! Every packet starts with a one-byte type. Multi-byte fields are little
//! endian.
//!
//! ```text
//! handshake: type:1 | handshake body
//! data:      type:1 | flags:1 | msg_id:4 | sender_op:8 | tag:8 | total_len:8
//!            | eager_len:8 | seg_offset:8 | [addr:8 | len:8 | key:8] | payload
//! receipt:   type:1 | msg_id:4 | target_op:8
//! ```
//!
//! The bracketed read descriptor is present only for read-based packets.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ProtocolError, Result};
use crate::handshake::HandshakeInfo;
use crate::op::RemoteIov;
use crate::seqnum::MsgId;

/// Data packet header size without the read descriptor.
pub const DATA_HEADER_SIZE: usize = 1 + 1 + 4 + 8 + 8 + 8 + 8 + 8;
/// Read descriptor size.
pub const READ_DESC_SIZE: usize = 24;
/// Receipt packet size.
pub const RECEIPT_SIZE: usize = 1 + 4 + 8;

/// Packet type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Capability handshake.
    Handshake = 1,
    /// Whole message in one packet.
    Eager = 2,
    /// One segment of a multi-packet message.
    Medium = 3,
    /// Header only; receiver reads the whole payload.
    LongRead = 4,
    /// Head segment; receiver reads the tail.
    RuntRead = 5,
    /// Delivery receipt back to the sender.
    Receipt = 6,
}

impl PacketType {
    fn from_u8(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Handshake),
            2 => Some(Self::Eager),
            3 => Some(Self::Medium),
            4 => Some(Self::LongRead),
            5 => Some(Self::RuntRead),
            6 => Some(Self::Receipt),
            _ => None,
        }
    }

    /// True for packet types carrying a read descriptor.
    pub fn is_read_based(self) -> bool {
        matches!(self, Self::LongRead | Self::RuntRead)
    }
}

/// Data packet flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataFlags(u8);

impl DataFlags {
    /// Sender waits for a receipt.
    pub const DELIVERY_COMPLETE: Self = Self(1);
    /// The tag field is meaningful.
    pub const TAGGED: Self = Self(1 << 1);

    /// No flags.
    pub fn empty() -> Self {
        Self(0)
    }

    /// True if all bits of `other` are set.
    pub fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for DataFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// One fragment of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    /// Eager, Medium, LongRead or RuntRead.
    pub kind: PacketType,
    /// Flags.
    pub flags: DataFlags,
    /// Message id within the sender-to-receiver stream.
    pub msg_id: MsgId,
    /// Sender's operation id, echoed in the receipt.
    pub sender_op: u64,
    /// User tag (valid when tagged).
    pub tag: u64,
    /// Full message length.
    pub total_len: u64,
    /// Bytes carried in packets; the rest is read.
    pub eager_len: u64,
    /// Offset of this payload in the message.
    pub seg_offset: u64,
    /// Region to read the remainder from.
    pub read: Option<RemoteIov>,
    /// Segment bytes.
    pub payload: Bytes,
}

impl DataPacket {
    /// User tag, if the message is tagged.
    pub fn user_tag(&self) -> Option<u64> {
        self.flags.contains(DataFlags::TAGGED).then_some(self.tag)
    }

    /// True if the sender waits for a receipt.
    pub fn wants_receipt(&self) -> bool {
        self.flags.contains(DataFlags::DELIVERY_COMPLETE) || self.kind.is_read_based()
    }

    /// Checks that the segment lies inside the packet-carried part of the
    /// message and that the lengths agree with the packet type.
    pub fn validate(&self) -> Result<()> {
        let end = self.seg_offset.checked_add(self.payload.len() as u64);
        if end.map_or(true, |end| end > self.eager_len) || self.eager_len > self.total_len {
            return Err(invalid(format!(
                "segment {}+{} outside message of {} ({} eager)",
                self.seg_offset,
                self.payload.len(),
                self.total_len,
                self.eager_len
            )));
        }
        if !self.kind.is_read_based() && self.eager_len != self.total_len {
            return Err(invalid(format!(
                "{:?} packet carries {} of {} bytes",
                self.kind, self.eager_len, self.total_len
            )));
        }
        if self.kind.is_read_based() && self.read.is_none() {
            return Err(invalid("read-based packet without a read descriptor"));
        }
        Ok(())
    }
}

/// Receipt for a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Receipt {
    /// Message being acknowledged.
    pub msg_id: MsgId,
    /// Sender's operation id from the data packet.
    pub target_op: u64,
}

/// Any wire packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Capability handshake.
    Handshake(HandshakeInfo),
    /// Message fragment.
    Data(DataPacket),
    /// Delivery receipt.
    Receipt(Receipt),
}

impl Packet {
    /// Encodes the packet.
    pub fn encode(&self) -> Bytes {
        match self {
            Packet::Handshake(info) => {
                let body = info.encode();
                let mut buf = BytesMut::with_capacity(1 + body.len());
                buf.put_u8(PacketType::Handshake as u8);
                buf.put_slice(&body);
                buf.freeze()
            }
            Packet::Data(d) => {
                let mut buf = BytesMut::with_capacity(DATA_HEADER_SIZE + READ_DESC_SIZE + d.payload.len());
                buf.put_u8(d.kind as u8);
                buf.put_u8(d.flags.0);
                buf.put_u32_le(d.msg_id.0);
                buf.put_u64_le(d.sender_op);
                buf.put_u64_le(d.tag);
                buf.put_u64_le(d.total_len);
                buf.put_u64_le(d.eager_len);
                buf.put_u64_le(d.seg_offset);
                if d.kind.is_read_based() {
                    let read = d.read.unwrap_or(RemoteIov { addr: 0, len: 0, key: 0 });
                    buf.put_u64_le(read.addr);
                    buf.put_u64_le(read.len as u64);
                    buf.put_u64_le(read.key);
                }
                buf.put_slice(&d.payload);
                buf.freeze()
            }
            Packet::Receipt(r) => {
                let mut buf = BytesMut::with_capacity(RECEIPT_SIZE);
                buf.put_u8(PacketType::Receipt as u8);
                buf.put_u32_le(r.msg_id.0);
                buf.put_u64_le(r.target_op);
                buf.freeze()
            }
        }
    }

    /// Decodes a packet.
    pub fn decode(data: &Bytes) -> Result<Self> {
        let Some(&first) = data.first() else {
            return Err(invalid("empty packet"));
        };
        let kind = PacketType::from_u8(first).ok_or_else(|| invalid(format!("unknown packet type {first}")))?;
        let mut buf = &data[1..];
        match kind {
            PacketType::Handshake => Ok(Packet::Handshake(HandshakeInfo::decode(buf)?)),
            PacketType::Receipt => {
                if buf.remaining() < RECEIPT_SIZE - 1 {
                    return Err(invalid("truncated receipt"));
                }
                Ok(Packet::Receipt(Receipt {
                    msg_id: MsgId(buf.get_u32_le()),
                    target_op: buf.get_u64_le(),
                }))
            }
            _ => {
                let header = if kind.is_read_based() {
                    DATA_HEADER_SIZE + READ_DESC_SIZE
                } else {
                    DATA_HEADER_SIZE
                };
                if data.len() < header {
                    return Err(invalid(format!("{} byte data packet, header needs {}", data.len(), header)));
                }
                let flags = DataFlags(buf.get_u8());
                let msg_id = MsgId(buf.get_u32_le());
                let sender_op = buf.get_u64_le();
                let tag = buf.get_u64_le();
                let total_len = buf.get_u64_le();
                let eager_len = buf.get_u64_le();
                let seg_offset = buf.get_u64_le();
                let read = if kind.is_read_based() {
                    Some(RemoteIov {
                        addr: buf.get_u64_le(),
                        len: buf.get_u64_le() as usize,
                        key: buf.get_u64_le(),
                    })
                } else {
                    None
                };
                let packet = DataPacket {
                    kind,
                    flags,
                    msg_id,
                    sender_op,
                    tag,
                    total_len,
                    eager_len,
                    seg_offset,
                    read,
                    payload: data.slice(header..),
                };
                packet.validate()?;
                Ok(Packet::Data(packet))
            }
        }
    }
}

fn invalid(reason: impl Into<String>) -> ProtocolError {
    ProtocolError::InvalidPacket { reason: reason.into() }
}
