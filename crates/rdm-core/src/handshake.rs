//! Capability handshake between two endpoints.
//!
//! Before a peer's capabilities are known, operations that depend on them
//! (read-based long messages, delivery-complete, RMA) wait in the peer
//! queue. Each side sends one handshake; receiving the other side's
//! handshake completes negotiation. When a handshake arrives before ours
//! went out, ours is the reply, so racing sides exchange exactly one
//! packet each.
//!
//! # States
//!
//! - **Unstarted**: nothing sent, nothing received
//! - **Sent**: ours is out, waiting for the peer's
//! - **Completed**: peer's received

use std::path::Path;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ProtocolError, Result};

/// Handshake protocol version.
pub const HANDSHAKE_VERSION: u8 = 4;

const HAS_HOST_ID: u8 = 1;
const HAS_CONNID: u8 = 1 << 1;
const FIXED_LEN: usize = 1 + 1 + 8;

/// Capability bits exchanged in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capabilities(u64);

impl Capabilities {
    /// Peer's device can serve RDMA reads.
    pub const RDMA_READ: Self = Self(1);
    /// Peer's device can serve RDMA writes.
    pub const RDMA_WRITE: Self = Self(1 << 1);
    /// Peer sends receipts for delivery-complete messages.
    pub const DELIVERY_COMPLETE: Self = Self(1 << 2);
    /// Peer accepts runt-read messages.
    pub const RUNTING: Self = Self(1 << 3);
    /// Peer puts connection ids in packet headers.
    pub const CONNID_HEADER: Self = Self(1 << 4);
    /// Peer receives RDMA-write-with-immediate without a posted buffer.
    pub const UNSOLICITED_WRITE_RECV: Self = Self(1 << 5);
    /// Peer handles remote atomics.
    pub const ATOMIC: Self = Self(1 << 6);

    /// No capabilities.
    pub fn empty() -> Self {
        Self(0)
    }

    /// Everything this crate implements.
    pub fn all() -> Self {
        Self::RDMA_READ
            | Self::RDMA_WRITE
            | Self::DELIVERY_COMPLETE
            | Self::RUNTING
            | Self::CONNID_HEADER
            | Self::UNSOLICITED_WRITE_RECV
            | Self::ATOMIC
    }

    /// True if all bits of `other` are set.
    pub fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Copy with `other` cleared.
    pub fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Raw bits.
    pub fn bits(self) -> u64 {
        self.0
    }

    /// From raw bits.
    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }
}

impl std::ops::BitOr for Capabilities {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Handshake contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeInfo {
    /// Protocol version.
    pub version: u8,
    /// Capability bits.
    pub caps: Capabilities,
    /// Sender's host id, when known.
    pub host_id: Option<u64>,
    /// Sender's connection id, when headers carry one.
    pub connid: Option<u32>,
}

impl HandshakeInfo {
    /// Encodes the handshake body.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FIXED_LEN + 12);
        let mut present = 0u8;
        if self.host_id.is_some() {
            present |= HAS_HOST_ID;
        }
        if self.connid.is_some() {
            present |= HAS_CONNID;
        }
        buf.put_u8(self.version);
        buf.put_u8(present);
        buf.put_u64_le(self.caps.bits());
        if let Some(id) = self.host_id {
            buf.put_u64_le(id);
        }
        if let Some(connid) = self.connid {
            buf.put_u32_le(connid);
        }
        buf.freeze()
    }

    /// Decodes a handshake body.
    ///
    /// A truncated host-id field is treated as absent instead of failing
    /// the handshake. A body too short for the fixed fields is an error.
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < FIXED_LEN {
            return Err(ProtocolError::MalformedHandshake {
                reason: format!("{} bytes, need at least {}", buf.len(), FIXED_LEN),
            });
        }
        let version = buf.get_u8();
        let present = buf.get_u8();
        let caps = Capabilities::from_bits(buf.get_u64_le());

        let mut host_id = None;
        if present & HAS_HOST_ID != 0 {
            if buf.remaining() < 8 {
                warn!(remaining = buf.remaining(), "truncated peer host id in handshake, ignoring");
                return Ok(Self {
                    version,
                    caps,
                    host_id: None,
                    connid: None,
                });
            }
            host_id = Some(buf.get_u64_le()).filter(|id| *id != 0);
        }

        let mut connid = None;
        if present & HAS_CONNID != 0 {
            if buf.remaining() >= 4 {
                connid = Some(buf.get_u32_le());
            } else {
                warn!("truncated connection id in handshake, ignoring");
            }
        }

        Ok(Self {
            version,
            caps,
            host_id,
            connid,
        })
    }
}

/// Negotiation progress with one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeState {
    /// Nothing exchanged.
    Unstarted,
    /// Ours sent, waiting for the peer's.
    Sent,
    /// Peer's received.
    Completed,
}

/// Per-peer handshake state machine.
#[derive(Debug, Clone, Default)]
pub struct Negotiator {
    sent: bool,
    peer: Option<HandshakeInfo>,
}

impl Negotiator {
    /// Fresh negotiator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    pub fn state(&self) -> HandshakeState {
        if self.peer.is_some() {
            HandshakeState::Completed
        } else if self.sent {
            HandshakeState::Sent
        } else {
            HandshakeState::Unstarted
        }
    }

    /// True once the peer's capabilities are known.
    pub fn is_complete(&self) -> bool {
        self.peer.is_some()
    }

    /// True if our handshake still has to go out, either to start
    /// negotiation or as the reply to the peer's.
    pub fn needs_send(&self) -> bool {
        !self.sent
    }

    /// Records that our handshake was posted.
    pub fn mark_sent(&mut self) {
        if !self.sent {
            debug!(state = ?self.state(), "handshake sent");
        }
        self.sent = true;
    }

    /// Records the peer's handshake. Returns true if we owe a reply.
    pub fn on_received(&mut self, info: HandshakeInfo) -> bool {
        if self.peer.is_some() {
            debug!("repeated handshake from peer, keeping first");
            return false;
        }
        self.peer = Some(info);
        !self.sent
    }

    /// Peer's handshake, once received.
    pub fn peer_info(&self) -> Option<&HandshakeInfo> {
        self.peer.as_ref()
    }

    /// Peer's capabilities, once known.
    pub fn peer_caps(&self) -> Option<Capabilities> {
        self.peer.map(|p| p.caps)
    }

    /// Peer's host id, if it sent a valid one.
    pub fn peer_host_id(&self) -> Option<u64> {
        self.peer.and_then(|p| p.host_id)
    }
}

/// Parses a host id of the form `i-` followed by exactly 16 hex digits.
pub fn parse_host_id(text: &str) -> Option<u64> {
    let digits = text.trim().strip_prefix("i-")?;
    if digits.len() != 16 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    u64::from_str_radix(digits, 16).ok().filter(|id| *id != 0)
}

/// Reads the local host id from `path`.
///
/// A missing file or an invalid value yields `None`; the endpoint then
/// runs without a host id.
pub fn load_host_id(path: &Path) -> Option<u64> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            debug!("host id file {} unavailable: {}", path.display(), e);
            return None;
        }
    };
    let id = parse_host_id(&contents);
    if id.is_none() {
        warn!("ignoring invalid host id in {}: {:?}", path.display(), contents.trim());
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn info(host_id: Option<u64>, connid: Option<u32>) -> HandshakeInfo {
        HandshakeInfo {
            version: HANDSHAKE_VERSION,
            caps: Capabilities::RDMA_READ | Capabilities::DELIVERY_COMPLETE,
            host_id,
            connid,
        }
    }

    #[test]
    fn test_state_transitions_initiator() {
        let mut n = Negotiator::new();
        assert_eq!(n.state(), HandshakeState::Unstarted);
        assert!(n.needs_send());
        n.mark_sent();
        assert_eq!(n.state(), HandshakeState::Sent);
        assert!(!n.on_received(info(None, None)));
        assert_eq!(n.state(), HandshakeState::Completed);
        assert!(!n.needs_send());
    }

    #[test]
    fn test_receive_first_owes_reply() {
        let mut n = Negotiator::new();
        assert!(n.on_received(info(Some(7), None)));
        assert_eq!(n.state(), HandshakeState::Completed);
        assert!(n.needs_send());
        assert_eq!(n.peer_host_id(), Some(7));
    }

    #[test]
    fn test_repeated_handshake_ignored() {
        let mut n = Negotiator::new();
        n.mark_sent();
        n.on_received(info(Some(1), None));
        assert!(!n.on_received(info(Some(2), None)));
        assert_eq!(n.peer_host_id(), Some(1));
    }

    #[test]
    fn test_encode_decode_with_host_id_and_connid() {
        let original = info(Some(0x0123_4567_89AB_CDEF), Some(99));
        let decoded = HandshakeInfo::decode(&original.encode()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_decode_without_optional_fields() {
        let original = info(None, None);
        let body = original.encode();
        assert_eq!(body.len(), FIXED_LEN);
        assert_eq!(HandshakeInfo::decode(&body).unwrap(), original);
    }

    #[test]
    fn test_truncated_host_id_ignored() {
        let body = info(Some(42), Some(5)).encode();
        let decoded = HandshakeInfo::decode(&body[..FIXED_LEN + 3]).unwrap();
        assert_eq!(decoded.host_id, None);
        assert_eq!(decoded.caps, Capabilities::RDMA_READ | Capabilities::DELIVERY_COMPLETE);
    }

    #[test]
    fn test_truncated_header_is_malformed() {
        let err = HandshakeInfo::decode(&[HANDSHAKE_VERSION, 0, 1]).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedHandshake { .. }));
    }

    #[test]
    fn test_parse_host_id() {
        assert_eq!(parse_host_id("i-0123456789abcdef\n"), Some(0x0123_4567_89ab_cdef));
        assert_eq!(parse_host_id("i-01234567"), None);
        assert_eq!(parse_host_id("i-0123456789abcdeg"), None);
        assert_eq!(parse_host_id("0123456789abcdef"), None);
        assert_eq!(parse_host_id("i-0000000000000000"), None);
    }

    #[test]
    fn test_load_host_id_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(load_host_id(&dir.path().join("absent")), None);
    }

    #[test]
    fn test_load_host_id_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "i-ffeeddccbbaa9988").unwrap();
        assert_eq!(load_host_id(file.path()), Some(0xffee_ddcc_bbaa_9988));
    }

    #[test]
    fn test_load_host_id_short_value() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "i-ffee").unwrap();
        assert_eq!(load_host_id(file.path()), None);
    }

    #[test]
    fn test_capabilities() {
        let caps = Capabilities::all().without(Capabilities::RDMA_WRITE);
        assert!(caps.contains(Capabilities::RDMA_READ));
        assert!(!caps.contains(Capabilities::RDMA_WRITE));
        assert!(!Capabilities::empty().contains(Capabilities::ATOMIC));
    }

    #[test]
    fn test_all_capabilities_are_named() {
        let named = [
            Capabilities::RDMA_READ,
            Capabilities::RDMA_WRITE,
            Capabilities::DELIVERY_COMPLETE,
            Capabilities::RUNTING,
            Capabilities::CONNID_HEADER,
            Capabilities::UNSOLICITED_WRITE_RECV,
            Capabilities::ATOMIC,
        ];
        let all = Capabilities::all();
        assert!(named.iter().all(|c| all.contains(*c)));
        let rest = named.iter().fold(all, |caps, c| caps.without(*c));
        assert_eq!(rest, Capabilities::empty());
    }
}
