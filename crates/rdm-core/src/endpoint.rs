//! The protocol engine.
//!
//! An [`Endpoint`] turns user posts into packets and RDMA requests on an
//! unreliable, unordered device, and device completions back into one
//! user event per operation. It is single-context: every call takes
//! `&mut self` and nothing runs in the background. Time enters only
//! through [`Endpoint::progress`], the one place where backoffs expire and
//! queued work is released.
//!
//! # Send protocols
//!
//! - **Eager**: the message fits one packet.
//! - **Medium**: the message is split across packets.
//! - **LongRead**: a header-only packet; the receiver reads the payload.
//! - **RuntRead**: the head goes in packets, the receiver reads the tail.
//!
//! Read-based protocols and delivery-complete sends finish when the
//! receiver's receipt arrives; the others finish when their last packet's
//! send completes.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use tracing::{debug, info, trace, warn};

use crate::arena::Arena;
use crate::completion::{
    classify_send, resolve_sender, CompletionEvent, ErrorReason, HostIds, RecvCompletion, Resolution,
    SendOutcome, WcStatus,
};
use crate::config::{EndpointConfig, EndpointOption};
use crate::error::{ProtocolError, Result};
use crate::handshake::{load_host_id, Capabilities, HandshakeInfo, HandshakeState, HANDSHAKE_VERSION};
use crate::matching::{ClaimToken, Matcher, MsgKey, PostedRecv, Unexpected};
use crate::metrics::{MetricsSnapshot, ProtocolMetrics};
use crate::op::{
    gather, IoBuf, MemoryKind, OpEntry, OpFlags, OpHandle, OpKind, OpState, RemoteIov, TagMatch,
    USER_TAG_MASK,
};
use crate::peer::{AddressVector, PeerAddr, RawAddr};
use crate::pool::{PacketEntry, PacketHandle, PacketPool, PacketState, PoolStats, Work};
use crate::provider::{Destination, FabricProvider, PostError, RmaRequest};
use crate::reorder::{AdmitResult, Delivered};
use crate::retry::QueuedWork;
use crate::sizing::{plan_packets, select_protocol, Protocol};
use crate::wire::{DataFlags, DataPacket, Packet, PacketType, Receipt};

/// Result of [`Endpoint::peek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeekResult {
    /// A matching message is waiting.
    Found {
        /// Sender.
        peer: PeerAddr,
        /// Message length.
        len: usize,
        /// Message tag.
        tag: u64,
        /// Set when the peek claimed the message.
        claim: Option<ClaimToken>,
    },
    /// Nothing matches.
    NoMessage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Handshake,
    Receipt(Receipt),
}

/// A message being assembled on the receive side.
#[derive(Debug)]
struct Inbound {
    kind: PacketType,
    tag: Option<u64>,
    delivery_complete: bool,
    sender_op: u64,
    total_len: usize,
    eager_len: usize,
    read: Option<RemoteIov>,
    data: BytesMut,
    received: usize,
    seen: Vec<u64>,
    bound: Option<OpHandle>,
    reading: bool,
    discard: bool,
}

impl Inbound {
    fn wants_receipt(&self) -> bool {
        self.delivery_complete || self.kind.is_read_based()
    }

    fn needs_read(&self) -> bool {
        self.read.is_some() && self.total_len > self.eager_len
    }
}

fn check_tag(tag: u64) -> Result<()> {
    if tag & !USER_TAG_MASK != 0 {
        return Err(ProtocolError::InvalidTag {
            tag,
            mask: USER_TAG_MASK,
        });
    }
    Ok(())
}

fn bad_flags(reason: &str) -> ProtocolError {
    ProtocolError::BadFlags {
        reason: reason.to_string(),
    }
}

/// Capabilities an operation needs on both sides.
fn required_caps(kind: &OpKind, flags: OpFlags) -> Vec<(Capabilities, &'static str)> {
    let mut caps = Vec::new();
    match kind {
        OpKind::Read { .. } => caps.push((Capabilities::RDMA_READ, "rdma_read")),
        OpKind::Write { .. } => caps.push((Capabilities::RDMA_WRITE, "rdma_write")),
        OpKind::Atomic { .. } => caps.push((Capabilities::ATOMIC, "atomic")),
        OpKind::Send { .. } | OpKind::Recv { .. } => {}
    }
    if flags.contains(OpFlags::DELIVERY_COMPLETE) {
        caps.push((Capabilities::DELIVERY_COMPLETE, "delivery_complete"));
    }
    caps
}

fn read_u64_le(data: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    if let Some(src) = data.get(at..) {
        let n = src.len().min(8);
        raw[..n].copy_from_slice(&src[..n]);
    }
    u64::from_le_bytes(raw)
}

/// Reliable-datagram endpoint over a [`FabricProvider`].
#[derive(Debug)]
pub struct Endpoint<P: FabricProvider> {
    config: EndpointConfig,
    provider: P,
    local_host_id: Option<u64>,
    peers: AddressVector,
    ops: Arena<OpEntry>,
    pool: PacketPool,
    matcher: Matcher,
    inbound: HashMap<MsgKey, Inbound>,
    control_backlog: VecDeque<(PeerAddr, Control)>,
    pending_reads: VecDeque<OpHandle>,
    events: VecDeque<CompletionEvent>,
    metrics: Arc<ProtocolMetrics>,
    now: Instant,
    active: bool,
}

impl<P: FabricProvider> Endpoint<P> {
    /// Creates an endpoint. Reads the host id file if one is configured.
    pub fn new(config: EndpointConfig, provider: P) -> Result<Self> {
        config.validate()?;
        let local_host_id = config.host_id_file.as_deref().and_then(load_host_id);
        info!(
            host_id = ?local_host_id.map(|id| format!("i-{id:016x}")),
            tx_pool = config.tx_pool_size,
            op_capacity = config.op_capacity,
            "endpoint created"
        );
        Ok(Self {
            peers: AddressVector::new(config.peer_settings()),
            ops: Arena::with_capacity(config.op_capacity),
            pool: PacketPool::new(config.tx_pool_size),
            config,
            provider,
            local_host_id,
            matcher: Matcher::new(),
            inbound: HashMap::new(),
            control_backlog: VecDeque::new(),
            pending_reads: VecDeque::new(),
            events: VecDeque::new(),
            metrics: Arc::new(ProtocolMetrics::new()),
            now: Instant::now(),
            active: false,
        })
    }

    /// Active configuration.
    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    /// The provider.
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// The provider, mutably.
    pub fn provider_mut(&mut self) -> &mut P {
        &mut self.provider
    }

    /// The address vector.
    pub fn peers(&self) -> &AddressVector {
        &self.peers
    }

    /// This host's id, if known.
    pub fn local_host_id(&self) -> Option<u64> {
        self.local_host_id
    }

    /// Shared counters.
    pub fn metrics(&self) -> Arc<ProtocolMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Counter snapshot.
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Packet pool statistics.
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Handshake state with a peer.
    pub fn handshake_state(&self, peer: PeerAddr) -> Option<HandshakeState> {
        self.peers.get(peer).map(|p| p.handshake.state())
    }

    /// Items waiting in a peer's queue.
    pub fn queue_len(&self, peer: PeerAddr) -> Option<usize> {
        self.peers.get(peer).map(|p| p.queue.len())
    }

    /// State of a live operation.
    pub fn op_state(&self, op: OpHandle) -> Option<OpState> {
        self.ops.get(op.0).map(|e| e.state)
    }

    /// Live operations.
    pub fn live_ops(&self) -> usize {
        self.ops.len()
    }

    /// Messages waiting for a receive.
    pub fn unexpected_len(&self) -> usize {
        self.matcher.unexpected_len()
    }

    /// Adds a peer. A device address already present returns its handle.
    pub fn insert_peer(&mut self, raw: RawAddr) -> Result<PeerAddr> {
        self.peers.insert(raw, &mut self.provider)
    }

    /// Changes an option. Only allowed before the first post.
    pub fn set_option(&mut self, option: EndpointOption) -> Result<()> {
        if self.active {
            return Err(ProtocolError::OptionLocked(option.name()));
        }
        let mut config = self.config.clone();
        config.apply(option);
        config.validate()?;
        self.config = config;
        if let EndpointOption::QueueLimit(limit) = option {
            self.peers.set_queue_limit(limit);
        }
        debug!(option = option.name(), "endpoint option set");
        Ok(())
    }

    // ---- posting ----------------------------------------------------------

    /// Posts a transmit operation (or a receive, for [`OpKind::Recv`]).
    ///
    /// Operations that depend on the peer's capabilities wait in the
    /// peer's queue until the handshake completes; the queue limit is
    /// checked then and a full queue fails the post with
    /// [`ProtocolError::QueueFull`]. A post that cannot get all of its
    /// packet entries fails with [`ProtocolError::PoolExhausted`] and
    /// holds none of them.
    pub fn post_operation(&mut self, peer: PeerAddr, kind: OpKind, flags: OpFlags, bufs: &[IoBuf]) -> Result<OpHandle> {
        if let OpKind::Recv { tag } = kind {
            let len = bufs.iter().map(|b| b.data.len()).sum();
            return self.post_recv(Some(peer), len, tag, flags);
        }
        self.check_tx(peer, &kind, flags)?;

        let data = gather(bufs);
        let total_len = match kind {
            OpKind::Read { remote } => remote.len,
            _ => data.len(),
        };
        let memory_kind = if bufs
            .iter()
            .any(|b| self.provider.memory_kind(b) == MemoryKind::Accelerator)
        {
            MemoryKind::Accelerator
        } else {
            MemoryKind::Host
        };
        let mut entry = OpEntry::new(kind, flags, Some(peer), total_len, OpState::Queued);
        entry.data = data;
        entry.memory_kind = memory_kind;
        let op = self.alloc_op(entry)?;

        let needs_handshake = self.needs_handshake(&kind, flags, total_len);
        let now = self.now;
        let mut queued = None;
        if let Some(p) = self.peers.get_mut(peer) {
            p.active_ops += 1;
            if (needs_handshake && !p.handshake.is_complete()) || p.queue.is_blocking(now) {
                queued = Some(p.queue.push_posted(op).map(|()| p.queue.len()));
            }
        }
        match queued {
            Some(Ok(len)) => {
                trace!(%peer, op = kind.name(), queued = len, "operation queued");
                self.active = true;
                if needs_handshake {
                    self.ensure_handshake(peer);
                }
                Ok(op)
            }
            Some(Err(e)) => {
                self.metrics.inc_queue_full();
                self.finish_op(op);
                Err(e)
            }
            None => match self.start_op(op) {
                Ok(()) => {
                    self.active = true;
                    Ok(op)
                }
                Err(e) => {
                    self.finish_op(op);
                    Err(e)
                }
            },
        }
    }

    /// Posts a receive of up to `len` bytes.
    pub fn post_recv(&mut self, src: Option<PeerAddr>, len: usize, tag: Option<TagMatch>, flags: OpFlags) -> Result<OpHandle> {
        if let Some(src) = src {
            if self.peers.get(src).is_none() {
                return Err(ProtocolError::UnknownPeer(src));
            }
        }
        if flags.intersects(OpFlags::PEEK | OpFlags::CLAIM | OpFlags::DISCARD) {
            return Err(bad_flags("peek and claim flags belong to peek and claim_recv"));
        }
        if let Some(m) = tag {
            if flags.contains(OpFlags::REMOTE_CQ_DATA) {
                return Err(bad_flags("remote CQ data is not supported on tagged operations"));
            }
            check_tag(m.tag)?;
        }
        let op = self.alloc_op(OpEntry::new(OpKind::Recv { tag }, flags, src, len, OpState::Posted))?;
        self.active = true;
        match self.matcher.take_unexpected(src, tag) {
            Some(msg) => {
                self.bind(op, msg.key);
                self.advance(msg.key);
            }
            None => self.matcher.post(PostedRecv { op, src, tag }),
        }
        Ok(op)
    }

    /// Looks for an unexpected tagged message.
    ///
    /// With [`OpFlags::CLAIM`] the message is reserved for
    /// [`Endpoint::claim_recv`]; with [`OpFlags::DISCARD`] it is dropped.
    pub fn peek(&mut self, src: Option<PeerAddr>, matcher: TagMatch, flags: OpFlags) -> Result<PeekResult> {
        if flags.contains(OpFlags::REMOTE_CQ_DATA) {
            return Err(bad_flags("remote CQ data is not supported on tagged operations"));
        }
        if flags.contains(OpFlags::CLAIM | OpFlags::DISCARD) {
            return Err(bad_flags("claim with discard applies to a claimed message, use discard_claimed"));
        }
        check_tag(matcher.tag)?;
        let Some(msg) = self.matcher.peek(src, matcher).copied() else {
            return Ok(PeekResult::NoMessage);
        };
        let mut claim = None;
        if flags.contains(OpFlags::CLAIM) {
            claim = self.matcher.claim(msg.key);
        } else if flags.contains(OpFlags::DISCARD) {
            self.matcher.remove_unexpected(msg.key);
            self.discard_inbound(msg.key);
        }
        Ok(PeekResult::Found {
            peer: msg.peer(),
            len: msg.len,
            tag: msg.tag.unwrap_or_default(),
            claim,
        })
    }

    /// Receives a message reserved by a claiming peek.
    pub fn claim_recv(&mut self, token: ClaimToken, len: usize) -> Result<OpHandle> {
        let mut entry = OpEntry::new(OpKind::Recv { tag: None }, OpFlags::CLAIM, None, len, OpState::Posted);
        entry.claimed = true;
        let op = self.alloc_op(entry)?;
        let Some(msg) = self.matcher.take_claimed(token) else {
            self.ops.remove(op.0);
            return Err(ProtocolError::InvalidHandle);
        };
        if let Some(e) = self.ops.get_mut(op.0) {
            e.kind = OpKind::Recv {
                tag: msg.tag.map(TagMatch::exact),
            };
        }
        self.active = true;
        self.bind(op, msg.key);
        self.advance(msg.key);
        Ok(op)
    }

    /// Drops a message reserved by a claiming peek.
    pub fn discard_claimed(&mut self, token: ClaimToken) -> Result<()> {
        let msg: Unexpected = self.matcher.take_claimed(token).ok_or(ProtocolError::InvalidHandle)?;
        self.discard_inbound(msg.key);
        Ok(())
    }

    /// Cancels a queued transmit, a transmit whose packets all wait in the
    /// peer queue, or an unmatched receive.
    ///
    /// Returns true if the operation was cancelled; its failure event
    /// carries [`ErrorReason::Cancelled`]. Operations already on the wire,
    /// and handles that are no longer live, return false.
    pub fn cancel(&mut self, op: OpHandle) -> bool {
        let Some((state, name)) = self.ops.get(op.0).map(|e| (e.state, e.kind.name())) else {
            return false;
        };
        match state {
            OpState::Posted => {
                if !self.matcher.cancel(op) {
                    return false;
                }
            }
            OpState::Queued => {}
            OpState::Sending => {
                if !self.withdraw_send(op) {
                    return false;
                }
            }
            _ => return false,
        }
        debug!(op = name, "operation cancelled");
        self.fail_op(op, ErrorReason::Cancelled);
        true
    }

    /// A transmit that started can still be taken back while none of its
    /// packets sits on the device and none has reached the peer. Its
    /// message id is handed back so the peer's ordering has no gap, which
    /// only works while no later message to the peer has taken an id.
    fn withdraw_send(&mut self, op: OpHandle) -> bool {
        let Some(entry) = self.ops.get(op.0) else {
            return false;
        };
        let on_device = entry
            .packets
            .iter()
            .any(|h| self.pool.get(*h).is_some_and(|p| p.state == PacketState::Posted));
        if on_device || entry.bytes_done > 0 {
            return false;
        }
        let (Some(addr), Some(id)) = (entry.peer, entry.msg_id) else {
            return entry.msg_id.is_none();
        };
        let Some(peer) = self.peers.get_mut(addr) else {
            return false;
        };
        if peer.next_msg_id != id.next() {
            return false;
        }
        peer.next_msg_id = id;
        true
    }

    /// Removes a peer. Its pending operations fail with
    /// [`ErrorReason::PeerRemoved`] and later traffic from it is dropped.
    pub fn remove_peer(&mut self, addr: PeerAddr) -> Result<()> {
        let mut peer = self
            .peers
            .remove(addr, &mut self.provider)
            .ok_or(ProtocolError::UnknownPeer(addr))?;
        let held = peer.window.clear();
        peer.queue.drain();
        let released = self.pool.release_peer(addr);
        let victims: Vec<OpHandle> = self
            .ops
            .iter()
            .filter(|(_, e)| e.peer == Some(addr))
            .map(|(h, _)| OpHandle(h))
            .collect();
        for op in &victims {
            self.fail_op(*op, ErrorReason::PeerRemoved);
        }
        self.inbound.retain(|k, _| k.0 != addr);
        self.matcher.purge_peer(addr);
        self.control_backlog.retain(|(p, _)| *p != addr);
        info!(%addr, held_messages = held, released_packets = released, failed_ops = victims.len(), "peer removed");
        Ok(())
    }

    // ---- device input -----------------------------------------------------

    /// Handles a send or RDMA completion. `data` carries read data or the
    /// previous value of an atomic.
    pub fn on_send_completion(&mut self, work_id: u64, status: WcStatus, data: Option<Bytes>) {
        let h = PacketHandle::from_work_id(work_id);
        let Some(entry) = self.pool.get(h) else {
            debug!(work_id, %status, "completion for a released packet, ignoring");
            return;
        };
        let (owner, peer_addr) = (entry.owner, entry.peer);

        match classify_send(status) {
            SendOutcome::Done => {
                let data_len = self.pool.release(h).map(|e| e.data_len).unwrap_or(0);
                self.metrics.inc_packets_sent();
                if let Some(peer) = self.peers.get_mut(peer_addr) {
                    peer.queue.on_success();
                }
                if let Some(op) = owner {
                    self.on_packet_done(op, h, data_len, data);
                }
            }
            SendOutcome::Rnr => {
                self.metrics.inc_rnr_events();
                if let Some(op) = owner {
                    let count = match self.ops.get_mut(op.0) {
                        Some(e) => {
                            e.rnr_count += 1;
                            e.rnr_count
                        }
                        None => 0,
                    };
                    if self.config.retry.exhausted(count) {
                        let hosts = self.hosts(peer_addr);
                        warn!(%peer_addr, attempts = count, "RNR retries exhausted");
                        self.fail_op(
                            op,
                            ErrorReason::RnrRetryExceeded {
                                attempts: count,
                                hosts,
                            },
                        );
                        return;
                    }
                }
                let now = self.now;
                match self.peers.get_mut(peer_addr) {
                    Some(peer) => {
                        if let Some(e) = self.pool.get_mut(h) {
                            e.state = PacketState::QueuedForResend;
                        }
                        peer.queue.push_internal(QueuedWork::Packet(h));
                        peer.queue.on_rnr(now, &self.config.retry);
                    }
                    None => {
                        self.pool.release(h);
                    }
                }
            }
            SendOutcome::Failed(status) => {
                let hosts = self.hosts(peer_addr);
                warn!(%peer_addr, %status, "{}", ErrorReason::from_status(status, hosts));
                match owner {
                    Some(op) => self.fail_op(op, ErrorReason::from_status(status, hosts)),
                    None => {
                        self.pool.release(h);
                    }
                }
            }
        }
    }

    /// Handles a receive completion.
    pub fn on_recv_completion(&mut self, record: RecvCompletion) {
        if record.status != WcStatus::Success {
            let reason = ErrorReason::from_status(
                record.status,
                HostIds {
                    local: self.local_host_id,
                    peer: None,
                },
            );
            warn!("receive failed: {}", reason);
            self.metrics.inc_recv_failures();
            self.events.push_back(CompletionEvent::RecvFailure { op: None, reason });
            return;
        }
        let peer = match resolve_sender(&mut self.peers, &mut self.provider, &record.sender, &self.metrics) {
            Resolution::Known(p) | Resolution::Recovered(p) => p,
            Resolution::Dropped => return,
        };
        let packet = match Packet::decode(&record.data) {
            Ok(p) => p,
            Err(e) => {
                warn!(%peer, "dropping packet: {}", e);
                self.metrics.inc_completions_dropped();
                return;
            }
        };
        match packet {
            Packet::Handshake(info) => self.on_handshake(peer, info),
            Packet::Receipt(r) => self.on_receipt(peer, r),
            Packet::Data(d) => {
                if let Err(e) = self.on_packet_received(peer, d) {
                    debug!(%peer, "data packet dropped: {}", e);
                }
            }
        }
    }

    /// Admits one data packet from `peer` and delivers whatever it makes
    /// ready.
    ///
    /// Fragments of a message that has already been released bypass the
    /// reorder window and go straight to the message being assembled.
    pub fn on_packet_received(&mut self, peer: PeerAddr, fragment: DataPacket) -> Result<AdmitResult> {
        fragment.validate()?;
        if fragment.total_len > self.config.max_message_size as u64 {
            return Err(ProtocolError::InvalidPacket {
                reason: format!(
                    "message of {} bytes exceeds the {} byte limit",
                    fragment.total_len, self.config.max_message_size
                ),
            });
        }
        let state = self
            .peers
            .get(peer)
            .map(|p| p.handshake.state())
            .ok_or(ProtocolError::UnknownPeer(peer))?;
        if state == HandshakeState::Unstarted {
            self.ensure_handshake(peer);
        }

        let key = (peer, fragment.msg_id);
        if self.inbound.contains_key(&key) {
            if !self.apply_fragment(key, fragment) {
                self.metrics.inc_duplicates();
                return Ok(AdmitResult::Duplicate);
            }
            self.advance(key);
            return Ok(AdmitResult::Accepted);
        }

        let p = self.peers.get_mut(peer).ok_or(ProtocolError::UnknownPeer(peer))?;
        let result = p.window.admit(fragment.msg_id, fragment);
        let ready = p.window.take_ready();
        match result {
            AdmitResult::Duplicate => self.metrics.inc_duplicates(),
            AdmitResult::Overflowed { evicted: Some(lost) } => {
                debug!(%peer, msg_id = %lost, "message lost to overflow");
                self.metrics.inc_overflow_losses();
            }
            _ => {}
        }
        for delivered in ready {
            self.start_inbound(peer, delivered);
        }
        Ok(result)
    }

    /// Advances time: retries deferred control packets and reads, then
    /// releases each peer's queue in FIFO order. Returns every event
    /// produced since the previous call.
    pub fn progress(&mut self, now: Instant) -> Vec<CompletionEvent> {
        self.now = now;

        let backlog: Vec<_> = self.control_backlog.drain(..).collect();
        for (peer, ctl) in backlog {
            self.send_control(peer, ctl);
        }

        let reads: Vec<_> = self.pending_reads.drain(..).collect();
        for op in reads {
            let key = match self.ops.get(op.0) {
                Some(OpEntry {
                    peer: Some(peer),
                    msg_id: Some(id),
                    ..
                }) => (*peer, *id),
                _ => continue,
            };
            self.start_read(op, key);
        }

        for addr in self.peers.addrs() {
            self.release_queue(addr);
        }
        self.events.drain(..).collect()
    }

    // ---- transmit internals -----------------------------------------------

    fn alloc_op(&mut self, entry: OpEntry) -> Result<OpHandle> {
        match self.ops.insert(entry) {
            Ok(h) => Ok(OpHandle(h)),
            Err(_) => {
                self.metrics.inc_pool_exhausted();
                Err(ProtocolError::PoolExhausted {
                    requested: 1,
                    available: 0,
                })
            }
        }
    }

    fn check_tx(&self, peer: PeerAddr, kind: &OpKind, flags: OpFlags) -> Result<()> {
        let p = self.peers.get(peer).ok_or(ProtocolError::UnknownPeer(peer))?;
        if flags.intersects(OpFlags::PEEK | OpFlags::CLAIM | OpFlags::DISCARD) {
            return Err(bad_flags("peek and claim flags are receive-only"));
        }
        if let OpKind::Send { tag: Some(tag) } = kind {
            if flags.contains(OpFlags::REMOTE_CQ_DATA) {
                return Err(bad_flags("remote CQ data is not supported on tagged operations"));
            }
            check_tag(*tag)?;
        }
        for (cap, name) in required_caps(kind, flags) {
            if !self.config.capabilities.contains(cap) {
                return Err(ProtocolError::NotSupported {
                    reason: name.to_string(),
                });
            }
        }
        if let Some(caps) = p.handshake.peer_caps() {
            if let Some(capability) = self.missing_peer_cap(caps, kind, flags) {
                return Err(ProtocolError::PeerCapabilityMissing { peer, capability });
            }
        }
        Ok(())
    }

    fn missing_peer_cap(&self, peer_caps: Capabilities, kind: &OpKind, flags: OpFlags) -> Option<&'static str> {
        if let Some((_, name)) = required_caps(kind, flags)
            .into_iter()
            .find(|(cap, _)| !peer_caps.contains(*cap))
        {
            return Some(name);
        }
        if matches!(kind, OpKind::Write { .. }) {
            let local = self.config.capabilities.contains(Capabilities::UNSOLICITED_WRITE_RECV);
            if peer_caps.contains(Capabilities::UNSOLICITED_WRITE_RECV) != local {
                return Some("unsolicited_write_recv");
            }
        }
        None
    }

    fn needs_handshake(&self, kind: &OpKind, flags: OpFlags, total_len: usize) -> bool {
        match kind {
            OpKind::Read { .. } | OpKind::Write { .. } | OpKind::Atomic { .. } => true,
            OpKind::Send { .. } => {
                flags.contains(OpFlags::DELIVERY_COMPLETE)
                    || (self.config.thresholds().is_long(total_len)
                        && self.config.capabilities.contains(Capabilities::RDMA_READ))
            }
            OpKind::Recv { .. } => false,
        }
    }

    fn start_op(&mut self, op: OpHandle) -> Result<()> {
        let entry = self.ops.get(op.0).ok_or(ProtocolError::InvalidHandle)?;
        let peer = entry.peer.ok_or(ProtocolError::InvalidHandle)?;
        match entry.kind {
            OpKind::Send { tag } => self.start_send(op, peer, tag),
            OpKind::Read { .. } | OpKind::Write { .. } | OpKind::Atomic { .. } => self.start_rma(op, peer),
            OpKind::Recv { .. } => Err(ProtocolError::InvalidHandle),
        }
    }

    fn start_send(&mut self, op: OpHandle, peer_addr: PeerAddr, tag: Option<u64>) -> Result<()> {
        let entry = self.ops.get(op.0).ok_or(ProtocolError::InvalidHandle)?;
        let peer = self.peers.get(peer_addr).ok_or(ProtocolError::UnknownPeer(peer_addr))?;
        let total_len = entry.total_len;
        let memory_kind = entry.memory_kind;
        let local = self.config.capabilities;
        let peer_caps = peer.handshake.peer_caps().unwrap_or_default();
        let can_read = local.contains(Capabilities::RDMA_READ) && peer_caps.contains(Capabilities::RDMA_READ);
        let alignment = self.config.alignment(memory_kind);
        let runt = if can_read && local.contains(Capabilities::RUNTING) && peer_caps.contains(Capabilities::RUNTING) {
            self.config
                .runt
                .peer_runt_size(total_len, memory_kind, alignment, peer.runt_in_flight)
        } else {
            0
        };
        let protocol = select_protocol(total_len, self.config.thresholds(), can_read, runt);
        let (kind, eager_len) = match protocol {
            Protocol::Eager => (PacketType::Eager, total_len),
            Protocol::Medium => (PacketType::Medium, total_len),
            Protocol::LongRead => (PacketType::LongRead, 0),
            Protocol::RuntRead { runt } => (PacketType::RuntRead, runt),
        };
        let segments = if kind == PacketType::LongRead {
            vec![0]
        } else {
            plan_packets(eager_len, self.config.max_payload, alignment)
        };
        if let Err(e) = self.pool.reserve(segments.len()) {
            self.metrics.inc_pool_exhausted();
            return Err(e);
        }

        let payload = entry.data.clone().freeze();
        let read = if protocol.is_read_based() {
            Some(self.provider.register(payload.slice(eager_len..), memory_kind)?)
        } else {
            None
        };
        let mut flags = DataFlags::empty();
        if entry.wants_delivery_complete() {
            flags = flags | DataFlags::DELIVERY_COMPLETE;
        }
        if tag.is_some() {
            flags = flags | DataFlags::TAGGED;
        }

        let peer = self.peers.get_mut(peer_addr).ok_or(ProtocolError::UnknownPeer(peer_addr))?;
        let msg_id = peer.take_msg_id();
        let runt_charged = if let Protocol::RuntRead { runt } = protocol { runt } else { 0 };
        peer.runt_in_flight += runt_charged;

        let mut handles = Vec::with_capacity(segments.len());
        let mut offset = 0;
        for seg in segments {
            let packet = Packet::Data(DataPacket {
                kind,
                flags,
                msg_id,
                sender_op: op.to_bits(),
                tag: tag.unwrap_or_default(),
                total_len: total_len as u64,
                eager_len: eager_len as u64,
                seg_offset: offset as u64,
                read,
                payload: payload.slice(offset..offset + seg),
            });
            let h = self.pool.alloc(PacketEntry {
                owner: Some(op),
                peer: peer_addr,
                work: Work::Send(packet.encode()),
                data_len: seg,
                state: PacketState::Allocated,
            })?;
            handles.push(h);
            offset += seg;
        }

        if let Some(e) = self.ops.get_mut(op.0) {
            e.packets = handles.clone();
            e.protocol = Some(protocol);
            e.msg_id = Some(msg_id);
            e.runt_charged = runt_charged;
            e.read_key = read.map(|r| r.key);
            e.state = OpState::Sending;
        }
        trace!(%peer_addr, %msg_id, ?protocol, packets = handles.len(), "send started");
        self.post_packets(peer_addr, &handles);
        Ok(())
    }

    fn start_rma(&mut self, op: OpHandle, peer_addr: PeerAddr) -> Result<()> {
        let entry = self.ops.get(op.0).ok_or(ProtocolError::InvalidHandle)?;
        let request = match entry.kind {
            OpKind::Read { remote } => RmaRequest::Read { remote },
            OpKind::Write { remote } => RmaRequest::Write {
                data: entry.data.clone().freeze(),
                remote,
            },
            OpKind::Atomic { op: aop, remote } => RmaRequest::Atomic {
                op: aop,
                operand: read_u64_le(&entry.data, 0),
                compare: read_u64_le(&entry.data, 8),
                remote,
            },
            _ => return Err(ProtocolError::InvalidHandle),
        };
        let data_len = entry.total_len;
        if let Err(e) = self.pool.reserve(1) {
            self.metrics.inc_pool_exhausted();
            return Err(e);
        }
        let h = self.pool.alloc(PacketEntry {
            owner: Some(op),
            peer: peer_addr,
            work: Work::Rma(request),
            data_len,
            state: PacketState::Allocated,
        })?;
        if let Some(e) = self.ops.get_mut(op.0) {
            e.packets = vec![h];
            e.state = OpState::Sending;
        }
        self.post_packets(peer_addr, &[h]);
        Ok(())
    }

    fn post_packet(&mut self, h: PacketHandle) -> std::result::Result<(), PostError> {
        let Some(entry) = self.pool.get(h) else {
            return Err(PostError::Failed("packet released".to_string()));
        };
        let Some(peer) = self.peers.get(entry.peer) else {
            return Err(PostError::Failed("peer removed".to_string()));
        };
        let dest = Destination {
            ahn: peer.ahn,
            raw: peer.raw,
        };
        let result = match entry.work.clone() {
            Work::Send(bytes) => self.provider.post_send(dest, h.work_id(), bytes),
            Work::Rma(request) => self.provider.post_rma(dest, h.work_id(), request),
        };
        if result.is_ok() {
            if let Some(e) = self.pool.get_mut(h) {
                e.state = PacketState::Posted;
            }
        }
        result
    }

    /// Posts packets in order. On busy the unposted rest goes to the head
    /// of the peer queue so nothing overtakes it.
    fn post_packets(&mut self, peer_addr: PeerAddr, handles: &[PacketHandle]) {
        for (i, &h) in handles.iter().enumerate() {
            match self.post_packet(h) {
                Ok(()) => {}
                Err(PostError::Busy) => {
                    debug!(%peer_addr, remaining = handles.len() - i, "device busy, queueing packets");
                    for &rest in handles[i..].iter().rev() {
                        if let Some(e) = self.pool.get_mut(rest) {
                            e.state = PacketState::QueuedForResend;
                        }
                        if let Some(peer) = self.peers.get_mut(peer_addr) {
                            peer.queue.push_front(QueuedWork::Packet(rest));
                        }
                    }
                    return;
                }
                Err(PostError::Failed(reason)) => {
                    warn!(%peer_addr, "post failed: {}", reason);
                    match self.pool.get(h).and_then(|e| e.owner) {
                        Some(op) => self.fail_op(op, ErrorReason::Provider(reason)),
                        None => {
                            self.pool.release(h);
                        }
                    }
                    return;
                }
            }
        }
    }

    fn release_queue(&mut self, addr: PeerAddr) {
        loop {
            let Some(peer) = self.peers.get(addr) else {
                return;
            };
            if peer.queue.in_backoff(self.now) {
                return;
            }
            let Some(&work) = peer.queue.front() else {
                return;
            };
            let peer_caps = peer.handshake.peer_caps();

            match work {
                QueuedWork::Op(op) => {
                    let Some(entry) = self.ops.get(op.0) else {
                        self.pop_front(addr);
                        continue;
                    };
                    let (kind, flags, total_len) = (entry.kind, entry.flags, entry.total_len);
                    if peer_caps.is_none() && self.needs_handshake(&kind, flags, total_len) {
                        self.ensure_handshake(addr);
                        return;
                    }
                    self.pop_front(addr);
                    if let Some(caps) = peer_caps {
                        if let Some(name) = self.missing_peer_cap(caps, &kind, flags) {
                            self.fail_op(op, ErrorReason::CapabilityMissing(name));
                            continue;
                        }
                    }
                    match self.start_op(op) {
                        Ok(()) => {}
                        Err(ProtocolError::PoolExhausted { .. }) => {
                            if let Some(peer) = self.peers.get_mut(addr) {
                                peer.queue.push_front(QueuedWork::Op(op));
                            }
                            return;
                        }
                        Err(e) => self.fail_op(op, ErrorReason::Provider(e.to_string())),
                    }
                }
                QueuedWork::Packet(h) => {
                    self.pop_front(addr);
                    if self.pool.get(h).is_none() {
                        continue;
                    }
                    match self.post_packet(h) {
                        Ok(()) => self.metrics.inc_packets_resent(),
                        Err(PostError::Busy) => {
                            if let Some(peer) = self.peers.get_mut(addr) {
                                peer.queue.push_front(QueuedWork::Packet(h));
                            }
                            return;
                        }
                        Err(PostError::Failed(reason)) => match self.pool.get(h).and_then(|e| e.owner) {
                            Some(op) => self.fail_op(op, ErrorReason::Provider(reason)),
                            None => {
                                self.pool.release(h);
                            }
                        },
                    }
                }
            }
        }
    }

    fn pop_front(&mut self, addr: PeerAddr) {
        if let Some(peer) = self.peers.get_mut(addr) {
            peer.queue.pop_front();
        }
    }

    fn on_packet_done(&mut self, op: OpHandle, h: PacketHandle, data_len: usize, data: Option<Bytes>) {
        let Some(entry) = self.ops.get_mut(op.0) else {
            return;
        };
        entry.packets.retain(|p| *p != h);
        entry.bytes_done += data_len;
        let (kind, bytes) = (entry.kind, entry.total_len);
        match kind {
            OpKind::Send { .. } => self.maybe_complete_send(op),
            OpKind::Read { .. } | OpKind::Atomic { .. } => self.complete_op(op, bytes, None, data),
            OpKind::Write { .. } => self.complete_op(op, bytes, None, None),
            OpKind::Recv { .. } => self.finish_read(op, data),
        }
    }

    fn maybe_complete_send(&mut self, op: OpHandle) {
        let Some(entry) = self.ops.get_mut(op.0) else {
            return;
        };
        if !entry.packets.is_empty() {
            return;
        }
        let needs_receipt = entry.wants_delivery_complete() || entry.protocol.is_some_and(|p| p.is_read_based());
        if needs_receipt && !entry.receipt_received {
            entry.state = OpState::AwaitingReceipt;
            return;
        }
        let bytes = entry.total_len;
        self.complete_op(op, bytes, None, None);
    }

    fn on_receipt(&mut self, peer: PeerAddr, receipt: Receipt) {
        let op = OpHandle::from_bits(receipt.target_op);
        let Some(entry) = self.ops.get_mut(op.0) else {
            debug!(%peer, msg_id = %receipt.msg_id, "receipt for unknown operation");
            return;
        };
        if entry.peer != Some(peer) || entry.msg_id != Some(receipt.msg_id) {
            debug!(%peer, msg_id = %receipt.msg_id, "receipt does not match operation");
            return;
        }
        entry.receipt_received = true;
        self.maybe_complete_send(op);
    }

    // ---- handshake and control packets -------------------------------------

    fn on_handshake(&mut self, peer: PeerAddr, info: HandshakeInfo) {
        let Some(p) = self.peers.get_mut(peer) else {
            return;
        };
        if info.version != HANDSHAKE_VERSION {
            warn!(%peer, version = info.version, "peer handshake version differs from ours");
        }
        let was_complete = p.handshake.is_complete();
        let reply_owed = p.handshake.on_received(info);
        if !was_complete {
            self.metrics.inc_handshakes_completed();
            info!(
                %peer,
                caps = info.caps.bits(),
                peer_host_id = ?info.host_id.map(|id| format!("i-{id:016x}")),
                connid = ?info.connid,
                "handshake completed"
            );
        }
        if reply_owed {
            self.send_control(peer, Control::Handshake);
        }
    }

    fn ensure_handshake(&mut self, peer: PeerAddr) {
        let needs = self.peers.get(peer).is_some_and(|p| p.handshake.needs_send());
        if needs && !self.control_backlog.contains(&(peer, Control::Handshake)) {
            self.send_control(peer, Control::Handshake);
        }
    }

    fn handshake_info(&self) -> HandshakeInfo {
        HandshakeInfo {
            version: HANDSHAKE_VERSION,
            caps: self.config.capabilities,
            host_id: self.local_host_id,
            connid: self.config.connid_header.then(|| self.provider.local_addr().qkey),
        }
    }

    fn send_control(&mut self, peer: PeerAddr, ctl: Control) {
        let Some(p) = self.peers.get(peer) else {
            return;
        };
        let packet = match ctl {
            Control::Handshake => {
                if !p.handshake.needs_send() {
                    return;
                }
                Packet::Handshake(self.handshake_info())
            }
            Control::Receipt(r) => Packet::Receipt(r),
        };
        let h = match self.pool.alloc(PacketEntry {
            owner: None,
            peer,
            work: Work::Send(packet.encode()),
            data_len: 0,
            state: PacketState::Allocated,
        }) {
            Ok(h) => h,
            Err(_) => {
                debug!(%peer, ?ctl, "no packet entry for control packet, deferring");
                self.defer_control(peer, ctl);
                return;
            }
        };
        match self.post_packet(h) {
            Ok(()) => {
                if ctl == Control::Handshake {
                    if let Some(p) = self.peers.get_mut(peer) {
                        p.handshake.mark_sent();
                    }
                }
            }
            Err(PostError::Busy) => {
                self.pool.release(h);
                self.defer_control(peer, ctl);
            }
            Err(PostError::Failed(reason)) => {
                self.pool.release(h);
                warn!(%peer, ?ctl, "control packet post failed: {}", reason);
            }
        }
    }

    fn defer_control(&mut self, peer: PeerAddr, ctl: Control) {
        if !self.control_backlog.contains(&(peer, ctl)) {
            self.control_backlog.push_back((peer, ctl));
        }
    }

    // ---- receive internals --------------------------------------------------

    fn start_inbound(&mut self, peer: PeerAddr, delivered: Delivered<DataPacket>) {
        let key = (peer, delivered.msg_id);
        let mut fragments = delivered.fragments.into_iter();
        let Some(first) = fragments.next() else {
            return;
        };
        let total_len = first.total_len as usize;
        let tag = first.user_tag();
        let replaced = self.inbound.insert(
            key,
            Inbound {
                kind: first.kind,
                tag,
                delivery_complete: first.flags.contains(DataFlags::DELIVERY_COMPLETE),
                sender_op: first.sender_op,
                total_len,
                eager_len: first.eager_len as usize,
                read: first.read,
                data: BytesMut::zeroed(total_len),
                received: 0,
                seen: Vec::new(),
                bound: None,
                reading: false,
                discard: false,
            },
        );
        if replaced.is_none() {
            if let Some(p) = self.peers.get_mut(peer) {
                p.held_messages += 1;
            }
        }
        self.apply_fragment(key, first);
        for fragment in fragments {
            if !self.apply_fragment(key, fragment) {
                self.metrics.inc_duplicates();
            }
        }

        match self.matcher.match_message(peer, tag) {
            Some(op) => self.bind(op, key),
            None => {
                trace!(%peer, msg_id = %key.1, "unexpected message");
                self.matcher.push_unexpected(Unexpected::new(key, tag, total_len));
            }
        }
        self.advance(key);
    }

    /// Copies a fragment into its message. Returns false for a fragment
    /// already applied.
    fn apply_fragment(&mut self, key: MsgKey, fragment: DataPacket) -> bool {
        let Some(inbound) = self.inbound.get_mut(&key) else {
            return false;
        };
        if inbound.seen.contains(&fragment.seg_offset) {
            return false;
        }
        let start = fragment.seg_offset as usize;
        let end = start.checked_add(fragment.payload.len()).unwrap_or(usize::MAX);
        if end > inbound.eager_len || fragment.total_len as usize != inbound.total_len {
            warn!(peer = %key.0, msg_id = %key.1, start, end, "fragment does not fit its message, dropping");
            return true;
        }
        inbound.seen.push(fragment.seg_offset);
        inbound.data[start..end].copy_from_slice(&fragment.payload);
        inbound.received += fragment.payload.len();
        if inbound.read.is_none() {
            inbound.read = fragment.read;
        }
        true
    }

    fn bind(&mut self, op: OpHandle, key: MsgKey) {
        let Some(inbound) = self.inbound.get_mut(&key) else {
            return;
        };
        inbound.bound = Some(op);
        if let Some(entry) = self.ops.get_mut(op.0) {
            entry.peer = Some(key.0);
            entry.msg_id = Some(key.1);
            entry.matched_tag = inbound.tag;
            entry.remote_op = Some(inbound.sender_op);
            entry.receipt_owed = inbound.wants_receipt();
            entry.state = OpState::Receiving;
        }
    }

    /// Moves a message forward once its packets are all in.
    fn advance(&mut self, key: MsgKey) {
        let Some(inbound) = self.inbound.get(&key) else {
            return;
        };
        if inbound.received < inbound.eager_len {
            return;
        }
        if inbound.discard {
            self.drop_inbound(key);
            return;
        }
        let Some(op) = inbound.bound else {
            return;
        };
        if inbound.needs_read() {
            if !inbound.reading {
                self.start_read(op, key);
            }
            return;
        }
        self.complete_recv(op, key);
    }

    fn start_read(&mut self, op: OpHandle, key: MsgKey) {
        let Some(inbound) = self.inbound.get_mut(&key) else {
            return;
        };
        let Some(read) = inbound.read else {
            return;
        };
        if inbound.reading {
            return;
        }
        let remote = RemoteIov {
            addr: read.addr,
            len: inbound.total_len - inbound.eager_len,
            key: read.key,
        };
        let h = match self.pool.alloc(PacketEntry {
            owner: Some(op),
            peer: key.0,
            work: Work::Rma(RmaRequest::Read { remote }),
            data_len: remote.len,
            state: PacketState::Allocated,
        }) {
            Ok(h) => h,
            Err(_) => {
                debug!(peer = %key.0, msg_id = %key.1, "no packet entry for read, deferring");
                self.pending_reads.push_back(op);
                return;
            }
        };
        inbound.reading = true;
        if let Some(entry) = self.ops.get_mut(op.0) {
            entry.packets.push(h);
            entry.state = OpState::Reading;
        }
        self.post_packets(key.0, &[h]);
    }

    fn finish_read(&mut self, op: OpHandle, data: Option<Bytes>) {
        let key = match self.ops.get(op.0) {
            Some(OpEntry {
                peer: Some(peer),
                msg_id: Some(id),
                ..
            }) => (*peer, *id),
            _ => return,
        };
        if let (Some(inbound), Some(data)) = (self.inbound.get_mut(&key), data) {
            let start = inbound.eager_len;
            let n = data.len().min(inbound.total_len - start);
            inbound.data[start..start + n].copy_from_slice(&data[..n]);
        }
        self.complete_recv(op, key);
    }

    fn complete_recv(&mut self, op: OpHandle, key: MsgKey) {
        let Some(inbound) = self.inbound.remove(&key) else {
            return;
        };
        self.release_held(key.0);
        if inbound.wants_receipt() {
            self.send_control(
                key.0,
                Control::Receipt(Receipt {
                    msg_id: key.1,
                    target_op: inbound.sender_op,
                }),
            );
        }
        let capacity = self.ops.get(op.0).map(|e| e.total_len).unwrap_or(0);
        if inbound.total_len > capacity {
            self.fail_op(
                op,
                ErrorReason::Truncated {
                    len: inbound.total_len,
                    capacity,
                },
            );
            return;
        }
        self.metrics.add_bytes_received(inbound.total_len as u64);
        self.complete_op(op, inbound.total_len, inbound.tag, Some(inbound.data.freeze()));
    }

    fn discard_inbound(&mut self, key: MsgKey) {
        if let Some(inbound) = self.inbound.get_mut(&key) {
            inbound.discard = true;
        }
        self.advance(key);
    }

    fn drop_inbound(&mut self, key: MsgKey) {
        let Some(inbound) = self.inbound.remove(&key) else {
            return;
        };
        self.release_held(key.0);
        debug!(peer = %key.0, msg_id = %key.1, "message discarded");
        if inbound.wants_receipt() {
            self.send_control(
                key.0,
                Control::Receipt(Receipt {
                    msg_id: key.1,
                    target_op: inbound.sender_op,
                }),
            );
        }
    }

    fn release_held(&mut self, peer: PeerAddr) {
        if let Some(p) = self.peers.get_mut(peer) {
            p.held_messages = p.held_messages.saturating_sub(1);
        }
    }

    // ---- completion ------------------------------------------------------------

    fn hosts(&self, peer: PeerAddr) -> HostIds {
        HostIds {
            local: self.local_host_id,
            peer: self.peers.get(peer).and_then(|p| p.host_id()),
        }
    }

    /// Frees an operation and everything it holds.
    fn finish_op(&mut self, op: OpHandle) -> Option<OpEntry> {
        let entry = self.ops.remove(op.0)?;
        for &p in &entry.packets {
            self.pool.release(p);
        }
        if entry.state == OpState::Posted {
            self.matcher.cancel(op);
        }
        if let Some(addr) = entry.peer {
            if let Some(peer) = self.peers.get_mut(addr) {
                peer.queue.remove_op(op, &entry.packets);
                if entry.kind.is_tx() {
                    peer.active_ops = peer.active_ops.saturating_sub(1);
                }
                peer.runt_in_flight = peer.runt_in_flight.saturating_sub(entry.runt_charged);
            }
        }
        if let Some(key) = entry.read_key {
            self.provider.deregister(key);
        }
        Some(entry)
    }

    fn complete_op(&mut self, op: OpHandle, bytes: usize, tag: Option<u64>, data: Option<Bytes>) {
        if self.finish_op(op).is_some() {
            self.events.push_back(CompletionEvent::Success { op, bytes, tag, data });
        }
    }

    fn fail_op(&mut self, op: OpHandle, reason: ErrorReason) {
        let Some(entry) = self.finish_op(op) else {
            return;
        };
        if let (Some(addr), Some(id)) = (entry.peer, entry.msg_id) {
            let key = (addr, id);
            if !entry.kind.is_tx() && self.inbound.get(&key).is_some_and(|i| i.bound == Some(op)) {
                self.drop_inbound(key);
            }
        }
        if entry.kind.is_tx() {
            self.metrics.inc_send_failures();
            self.events.push_back(CompletionEvent::SendFailure { op, reason });
        } else {
            self.metrics.inc_recv_failures();
            self.events.push_back(CompletionEvent::RecvFailure { op: Some(op), reason });
        }
    }
}
