//! Software fabric for running the engine without hardware.
//!
//! [`SimProvider`] implements [`FabricProvider`] by recording posts in an
//! outbox and keeping registered memory in-process. [`Loopback`] owns two
//! endpoints on simulated providers and moves their traffic: sends become
//! receive completions on the other side, RDMA requests run against the
//! other side's registered regions.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::completion::{CompletionEvent, RecvCompletion, WcStatus};
use crate::config::EndpointConfig;
use crate::endpoint::Endpoint;
use crate::error::{ProtocolError, Result};
use crate::op::{AtomicOp, MemoryKind, RemoteIov};
use crate::peer::{PeerAddr, RawAddr, WireSender};
use crate::provider::{Destination, FabricProvider, PostError, RmaRequest};

/// Address handle number the loopback reports for senders the receiver
/// has no address handle for.
pub const UNKNOWN_AHN: u16 = u16::MAX;

/// Remote access rights of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessFlags(u32);

impl AccessFlags {
    /// Peers may read.
    pub const REMOTE_READ: Self = Self(1);
    /// Peers may write.
    pub const REMOTE_WRITE: Self = Self(2);
    /// Peers may run atomics.
    pub const REMOTE_ATOMIC: Self = Self(4);
    /// Everything.
    pub const ALL: Self = Self(0x7);

    /// True if all bits of `other` are set.
    pub fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for AccessFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Registered memory.
#[derive(Debug, Clone)]
pub struct MemoryRegion {
    /// Remote key.
    pub key: u64,
    /// Memory kind it was registered as.
    pub kind: MemoryKind,
    /// Remote access rights.
    pub access: AccessFlags,
    buffer: BytesMut,
}

impl MemoryRegion {
    /// Region length.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// True for an empty region.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Current contents.
    pub fn contents(&self) -> Bytes {
        Bytes::copy_from_slice(&self.buffer)
    }

    /// Reads `len` bytes at `offset` if the region allows remote reads.
    pub fn read_at(&self, offset: usize, len: usize) -> Option<Bytes> {
        if !self.access.contains(AccessFlags::REMOTE_READ) {
            return None;
        }
        let end = offset.checked_add(len)?;
        if end > self.buffer.len() {
            return None;
        }
        Some(Bytes::copy_from_slice(&self.buffer[offset..end]))
    }

    /// Writes `data` at `offset` if the region allows remote writes.
    pub fn write_at(&mut self, offset: usize, data: &[u8]) -> bool {
        if !self.access.contains(AccessFlags::REMOTE_WRITE) {
            return false;
        }
        let Some(end) = offset.checked_add(data.len()) else {
            return false;
        };
        if end > self.buffer.len() {
            return false;
        }
        self.buffer[offset..end].copy_from_slice(data);
        true
    }

    /// Runs an atomic on the little-endian word at `offset`; returns the
    /// previous value.
    pub fn atomic(&mut self, offset: usize, op: AtomicOp, operand: u64, compare: u64) -> Option<u64> {
        if !self.access.contains(AccessFlags::REMOTE_ATOMIC) {
            return None;
        }
        let end = offset.checked_add(8)?;
        let word = self.buffer.get_mut(offset..end)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(word);
        let old = u64::from_le_bytes(raw);
        let new = match op {
            AtomicOp::Sum => old.wrapping_add(operand),
            AtomicOp::Write => operand,
            AtomicOp::CompareSwap if old == compare => operand,
            AtomicOp::CompareSwap => old,
        };
        word.copy_from_slice(&new.to_le_bytes());
        Some(old)
    }
}

/// A request the endpoint handed to the simulated device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Posted {
    /// Packet send.
    Send {
        /// Destination.
        dest: Destination,
        /// Work-request id.
        work_id: u64,
        /// Packet bytes.
        packet: Bytes,
    },
    /// RDMA request.
    Rma {
        /// Destination.
        dest: Destination,
        /// Work-request id.
        work_id: u64,
        /// Request.
        request: RmaRequest,
    },
}

impl Posted {
    /// Work-request id.
    pub fn work_id(&self) -> u64 {
        match self {
            Posted::Send { work_id, .. } | Posted::Rma { work_id, .. } => *work_id,
        }
    }
}

/// Simulated device behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    /// Probability that a post is refused as busy.
    pub busy_rate: f64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self { busy_rate: 0.0 }
    }
}

/// Counters kept by the simulated device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimStats {
    /// Sends accepted.
    pub sends_posted: u64,
    /// RDMA requests accepted.
    pub rma_posted: u64,
    /// Posts refused as busy.
    pub busy_rejections: u64,
    /// Posts refused as failed.
    pub failed_posts: u64,
}

/// In-process [`FabricProvider`].
#[derive(Debug)]
pub struct SimProvider {
    local: RawAddr,
    config: SimConfig,
    next_ahn: u16,
    ahs: HashMap<u16, [u8; 16]>,
    outbox: VecDeque<Posted>,
    regions: HashMap<u64, MemoryRegion>,
    next_key: u64,
    resolvable: HashMap<WireSender, RawAddr>,
    resolve_attempts: u64,
    busy_posts: usize,
    fail_next: Option<String>,
    stats: SimStats,
}

impl Default for SimProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl SimProvider {
    /// Provider with an all-zero local address.
    pub fn new() -> Self {
        Self::with_addr(RawAddr {
            gid: [0; 16],
            qpn: 1,
            qkey: 0,
        })
    }

    /// Provider with the given local address.
    pub fn with_addr(local: RawAddr) -> Self {
        Self {
            local,
            config: SimConfig::default(),
            next_ahn: 1,
            ahs: HashMap::new(),
            outbox: VecDeque::new(),
            regions: HashMap::new(),
            next_key: 0x8000_0001,
            resolvable: HashMap::new(),
            resolve_attempts: 0,
            busy_posts: 0,
            fail_next: None,
            stats: SimStats::default(),
        }
    }

    /// Replaces the device behavior.
    pub fn set_config(&mut self, config: SimConfig) {
        self.config = config;
    }

    /// Refuses the next `count` posts as busy.
    pub fn set_busy(&mut self, count: usize) {
        self.busy_posts = count;
    }

    /// Fails the next post with `reason`.
    pub fn fail_next_post(&mut self, reason: impl Into<String>) {
        self.fail_next = Some(reason.into());
    }

    /// Lets `sender` resolve to `raw`.
    pub fn add_resolvable(&mut self, sender: WireSender, raw: RawAddr) {
        self.resolvable.insert(sender, raw);
    }

    /// Calls to [`FabricProvider::resolve_sender`] so far.
    pub fn resolve_attempts(&self) -> u64 {
        self.resolve_attempts
    }

    /// Address handles alive.
    pub fn live_ah_count(&self) -> usize {
        self.ahs.len()
    }

    /// Takes everything posted since the last call.
    pub fn take_outbox(&mut self) -> Vec<Posted> {
        self.outbox.drain(..).collect()
    }

    /// Posts waiting in the outbox.
    pub fn outbox_len(&self) -> usize {
        self.outbox.len()
    }

    /// Exposes a region with explicit access rights.
    pub fn expose(&mut self, data: &[u8], kind: MemoryKind, access: AccessFlags) -> RemoteIov {
        let key = self.next_key;
        self.next_key += 1;
        self.regions.insert(
            key,
            MemoryRegion {
                key,
                kind,
                access,
                buffer: BytesMut::from(data),
            },
        );
        RemoteIov {
            addr: 0,
            len: data.len(),
            key,
        }
    }

    /// Region by key.
    pub fn region(&self, key: u64) -> Option<&MemoryRegion> {
        self.regions.get(&key)
    }

    /// Mutable region by key.
    pub fn region_mut(&mut self, key: u64) -> Option<&mut MemoryRegion> {
        self.regions.get_mut(&key)
    }

    /// Regions registered.
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    /// Device counters.
    pub fn stats(&self) -> &SimStats {
        &self.stats
    }

    fn admit_post(&mut self) -> std::result::Result<(), PostError> {
        if let Some(reason) = self.fail_next.take() {
            self.stats.failed_posts += 1;
            return Err(PostError::Failed(reason));
        }
        if self.busy_posts > 0 {
            self.busy_posts -= 1;
            self.stats.busy_rejections += 1;
            return Err(PostError::Busy);
        }
        if self.config.busy_rate > 0.0 && rand::thread_rng().gen_bool(self.config.busy_rate.min(1.0)) {
            self.stats.busy_rejections += 1;
            return Err(PostError::Busy);
        }
        Ok(())
    }
}

impl FabricProvider for SimProvider {
    fn local_addr(&self) -> RawAddr {
        self.local
    }

    fn post_send(&mut self, dest: Destination, work_id: u64, packet: Bytes) -> std::result::Result<(), PostError> {
        self.admit_post()?;
        trace!(work_id, len = packet.len(), qpn = dest.raw.qpn, "sim send posted");
        self.stats.sends_posted += 1;
        self.outbox.push_back(Posted::Send { dest, work_id, packet });
        Ok(())
    }

    fn post_rma(&mut self, dest: Destination, work_id: u64, request: RmaRequest) -> std::result::Result<(), PostError> {
        self.admit_post()?;
        trace!(work_id, qpn = dest.raw.qpn, "sim rma posted");
        self.stats.rma_posted += 1;
        self.outbox.push_back(Posted::Rma { dest, work_id, request });
        Ok(())
    }

    fn create_ah(&mut self, gid: &[u8; 16]) -> Result<u16> {
        if self.ahs.len() >= usize::from(UNKNOWN_AHN - 1) {
            return Err(ProtocolError::Provider("address handle table full".to_string()));
        }
        while self.ahs.contains_key(&self.next_ahn) || self.next_ahn == UNKNOWN_AHN || self.next_ahn == 0 {
            self.next_ahn = self.next_ahn.wrapping_add(1);
        }
        let ahn = self.next_ahn;
        self.next_ahn = self.next_ahn.wrapping_add(1);
        self.ahs.insert(ahn, *gid);
        Ok(ahn)
    }

    fn destroy_ah(&mut self, ahn: u16) {
        self.ahs.remove(&ahn);
    }

    fn resolve_sender(&mut self, sender: &WireSender) -> Option<RawAddr> {
        self.resolve_attempts += 1;
        self.resolvable.get(sender).copied()
    }

    fn register(&mut self, data: Bytes, kind: MemoryKind) -> Result<RemoteIov> {
        Ok(self.expose(&data, kind, AccessFlags::REMOTE_READ))
    }

    fn deregister(&mut self, key: u64) {
        self.regions.remove(&key);
    }
}

/// One side of a [`Loopback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Endpoint `a`.
    A,
    /// Endpoint `b`.
    B,
}

/// Events collected by [`Loopback::pump`].
#[derive(Debug, Default)]
pub struct Pumped {
    /// Events from endpoint `a`.
    pub a: Vec<CompletionEvent>,
    /// Events from endpoint `b`.
    pub b: Vec<CompletionEvent>,
}

const MAX_ROUNDS: usize = 100_000;

/// Two endpoints wired back to back.
#[derive(Debug)]
pub struct Loopback {
    /// First endpoint.
    pub a: Endpoint<SimProvider>,
    /// Second endpoint.
    pub b: Endpoint<SimProvider>,
    /// `b` as seen from `a`.
    pub a_to_b: PeerAddr,
    /// `a` as seen from `b`.
    pub b_to_a: PeerAddr,
    rnr_budget: [usize; 2],
    reverse_batches: bool,
    resolution: bool,
    now: Instant,
}

/// Device address of loopback side `a`.
pub const ADDR_A: RawAddr = RawAddr {
    gid: [0xA; 16],
    qpn: 10,
    qkey: 0x0A0A,
};

/// Device address of loopback side `b`.
pub const ADDR_B: RawAddr = RawAddr {
    gid: [0xB; 16],
    qpn: 20,
    qkey: 0x0B0B,
};

impl Loopback {
    /// Creates both endpoints and inserts each into the other's address vector.
    pub fn new(config_a: EndpointConfig, config_b: EndpointConfig) -> Result<Self> {
        let mut a = Endpoint::new(config_a, SimProvider::with_addr(ADDR_A))?;
        let mut b = Endpoint::new(config_b, SimProvider::with_addr(ADDR_B))?;
        let a_to_b = a.insert_peer(ADDR_B)?;
        let b_to_a = b.insert_peer(ADDR_A)?;
        Ok(Self {
            a,
            b,
            a_to_b,
            b_to_a,
            rnr_budget: [0, 0],
            reverse_batches: false,
            resolution: true,
            now: Instant::now(),
        })
    }

    /// Makes the next `count` sends arriving at `side` fail with RNR.
    pub fn inject_rnr(&mut self, side: Side, count: usize) {
        self.rnr_budget[side as usize] = count;
    }

    /// Delivers each batch of posts in reverse order.
    pub fn set_reverse_batches(&mut self, reverse: bool) {
        self.reverse_batches = reverse;
    }

    /// Controls whether unknown senders can be resolved by the receiver.
    pub fn set_resolution(&mut self, enabled: bool) {
        self.resolution = enabled;
    }

    /// Moves the shared clock forward.
    pub fn advance(&mut self, by: Duration) {
        self.now += by;
    }

    /// Current simulated time.
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Runs progress and delivers traffic until both sides are quiet.
    pub fn pump(&mut self) -> Pumped {
        let mut events = Pumped::default();
        for _ in 0..MAX_ROUNDS {
            events.a.extend(self.a.progress(self.now));
            events.b.extend(self.b.progress(self.now));
            let mut out_a = self.a.provider_mut().take_outbox();
            let mut out_b = self.b.provider_mut().take_outbox();
            if out_a.is_empty() && out_b.is_empty() {
                break;
            }
            if self.reverse_batches {
                out_a.reverse();
                out_b.reverse();
            }
            for posted in out_a {
                self.deliver(Side::A, posted);
            }
            for posted in out_b {
                self.deliver(Side::B, posted);
            }
        }
        events
    }

    fn deliver(&mut self, from: Side, posted: Posted) {
        let to = match from {
            Side::A => Side::B,
            Side::B => Side::A,
        };
        let rnr = &mut self.rnr_budget[to as usize];
        let inject_rnr = matches!(posted, Posted::Send { .. }) && *rnr > 0;
        if inject_rnr {
            *rnr -= 1;
        }
        let resolution = self.resolution;
        let (src, dst) = match from {
            Side::A => (&mut self.a, &mut self.b),
            Side::B => (&mut self.b, &mut self.a),
        };

        match posted {
            Posted::Send { work_id, packet, .. } => {
                if inject_rnr {
                    debug!(?to, work_id, "injecting RNR");
                    src.on_send_completion(work_id, WcStatus::ReceiverNotReady, None);
                    return;
                }
                let src_raw = src.provider().local_addr();
                let sender = match dst.peers().lookup_raw(&src_raw).and_then(|p| dst.peers().get(p)) {
                    Some(peer) => WireSender {
                        ahn: peer.ahn,
                        qpn: src_raw.qpn,
                    },
                    None => {
                        let sender = WireSender {
                            ahn: UNKNOWN_AHN,
                            qpn: src_raw.qpn,
                        };
                        if resolution {
                            dst.provider_mut().add_resolvable(sender, src_raw);
                        }
                        sender
                    }
                };
                dst.on_recv_completion(RecvCompletion {
                    sender,
                    status: WcStatus::Success,
                    data: packet,
                });
                src.on_send_completion(work_id, WcStatus::Success, None);
            }
            Posted::Rma { work_id, request, .. } => {
                let outcome = match request {
                    RmaRequest::Read { remote } => dst
                        .provider()
                        .region(remote.key)
                        .and_then(|r| r.read_at(remote.addr as usize, remote.len))
                        .map(Some),
                    RmaRequest::Write { data, remote } => dst
                        .provider_mut()
                        .region_mut(remote.key)
                        .filter(|_| data.len() <= remote.len)
                        .and_then(|r| r.write_at(remote.addr as usize, &data).then_some(None)),
                    RmaRequest::Atomic {
                        op,
                        operand,
                        compare,
                        remote,
                    } => dst
                        .provider_mut()
                        .region_mut(remote.key)
                        .and_then(|r| r.atomic(remote.addr as usize, op, operand, compare))
                        .map(|old| Some(Bytes::copy_from_slice(&old.to_le_bytes()))),
                };
                match outcome {
                    Some(data) => src.on_send_completion(work_id, WcStatus::Success, data),
                    None => src.on_send_completion(work_id, WcStatus::RemoteAccess, None),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_access_flags() {
        let mut sim = SimProvider::new();
        let iov = sim.expose(b"abcdef", MemoryKind::Host, AccessFlags::REMOTE_READ);
        let region = sim.region_mut(iov.key).unwrap();
        assert_eq!(region.read_at(1, 3).unwrap(), Bytes::from_static(b"bcd"));
        assert!(region.read_at(4, 3).is_none());
        assert!(!region.write_at(0, b"x"));
        assert!(region.atomic(0, AtomicOp::Sum, 1, 0).is_none());
    }

    #[test]
    fn test_region_atomics() {
        let mut sim = SimProvider::new();
        let iov = sim.expose(&5u64.to_le_bytes(), MemoryKind::Host, AccessFlags::ALL);
        let region = sim.region_mut(iov.key).unwrap();
        assert_eq!(region.atomic(0, AtomicOp::Sum, 3, 0), Some(5));
        assert_eq!(region.atomic(0, AtomicOp::CompareSwap, 100, 7), Some(8));
        assert_eq!(region.atomic(0, AtomicOp::CompareSwap, 100, 8), Some(8));
        assert_eq!(region.atomic(0, AtomicOp::Write, 1, 0), Some(100));
        assert_eq!(region.contents(), Bytes::copy_from_slice(&1u64.to_le_bytes()));
    }

    #[test]
    fn test_busy_and_failed_posts() {
        let mut sim = SimProvider::new();
        let dest = Destination {
            ahn: 1,
            raw: ADDR_B,
        };
        sim.set_busy(1);
        assert_eq!(sim.post_send(dest, 1, Bytes::new()), Err(PostError::Busy));
        sim.fail_next_post("link down");
        assert_eq!(
            sim.post_send(dest, 2, Bytes::new()),
            Err(PostError::Failed("link down".to_string()))
        );
        assert!(sim.post_send(dest, 3, Bytes::new()).is_ok());
        let out = sim.take_outbox();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].work_id(), 3);
        assert_eq!(sim.stats().busy_rejections, 1);
        assert_eq!(sim.stats().failed_posts, 1);
    }

    #[test]
    fn test_address_handles() {
        let mut sim = SimProvider::new();
        let a = sim.create_ah(&[1; 16]).unwrap();
        let b = sim.create_ah(&[2; 16]).unwrap();
        assert_ne!(a, b);
        assert_eq!(sim.live_ah_count(), 2);
        sim.destroy_ah(a);
        assert_eq!(sim.live_ah_count(), 1);
    }

    #[test]
    fn test_register_and_deregister() {
        let mut sim = SimProvider::new();
        let iov = sim
            .register(Bytes::from_static(b"tail"), MemoryKind::Accelerator)
            .unwrap();
        assert_eq!(iov.len, 4);
        assert_eq!(sim.region(iov.key).unwrap().kind, MemoryKind::Accelerator);
        sim.deregister(iov.key);
        assert_eq!(sim.region_count(), 0);
    }
}
