//! Peers and the address vector.
//!
//! Peers enter the address vector two ways: an explicit insert by the user,
//! or implicitly when a packet arrives from a sender the endpoint has not
//! seen. Implicit peers are bounded and the oldest idle one is forgotten
//! when the bound is hit: its address handle is released but its ordering
//! state is parked, so a later packet from it re-resolves it and carries on
//! where the stream left off. Peers the user removed stay removed.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ProtocolError, Result};
use crate::handshake::Negotiator;
use crate::provider::FabricProvider;
use crate::reorder::ReorderWindow;
use crate::retry::RetryQueue;
use crate::seqnum::MsgId;
use crate::wire::DataPacket;

/// Address handle the user sees for a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerAddr(pub u64);

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Device-level address of a remote endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RawAddr {
    /// Port GID.
    pub gid: [u8; 16],
    /// Queue pair number.
    pub qpn: u32,
    /// Queue key; doubles as the connection id.
    pub qkey: u32,
}

/// Sender identity as reported in a receive completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WireSender {
    /// Address handle number.
    pub ahn: u16,
    /// Sender queue pair number.
    pub qpn: u32,
}

/// Per-peer sizing taken from the endpoint configuration.
#[derive(Debug, Clone, Copy)]
pub struct PeerSettings {
    /// Reorder window size.
    pub window: u32,
    /// Overflow list capacity.
    pub overflow_capacity: usize,
    /// Retry queue limit.
    pub queue_limit: usize,
    /// Maximum implicit peers kept.
    pub implicit_capacity: usize,
}

/// One remote endpoint.
#[derive(Debug)]
pub struct Peer {
    /// User-facing address.
    pub addr: PeerAddr,
    /// Device address.
    pub raw: RawAddr,
    /// Address handle number on the device.
    pub ahn: u16,
    /// Inserted by the engine rather than the user.
    pub implicit: bool,
    /// Inbound ordering.
    pub window: ReorderWindow<DataPacket>,
    /// Capability negotiation.
    pub handshake: Negotiator,
    /// Outbound retry queue.
    pub queue: RetryQueue,
    /// Next outbound message id.
    pub next_msg_id: MsgId,
    /// Runt bytes sent and not yet read by the peer.
    pub runt_in_flight: usize,
    /// Live operations referencing this peer.
    pub active_ops: usize,
    /// Inbound messages released by the window and not yet completed,
    /// matched or not.
    pub held_messages: usize,
}

impl Peer {
    fn new(addr: PeerAddr, raw: RawAddr, ahn: u16, implicit: bool, settings: &PeerSettings) -> Self {
        Self {
            addr,
            raw,
            ahn,
            implicit,
            window: ReorderWindow::new(settings.window, settings.overflow_capacity),
            handshake: Negotiator::new(),
            queue: RetryQueue::new(addr, settings.queue_limit),
            next_msg_id: MsgId(0),
            runt_in_flight: 0,
            active_ops: 0,
            held_messages: 0,
        }
    }

    /// Takes the next outbound message id.
    pub fn take_msg_id(&mut self) -> MsgId {
        let id = self.next_msg_id;
        self.next_msg_id = id.next();
        id
    }

    /// Peer's host id, once the handshake delivered one.
    pub fn host_id(&self) -> Option<u64> {
        self.handshake.peer_host_id()
    }

    fn is_idle(&self) -> bool {
        self.active_ops == 0 && self.queue.is_empty() && self.held_messages == 0
    }
}

/// Ordering state of a forgotten implicit peer.
#[derive(Debug)]
struct Parked {
    window: ReorderWindow<DataPacket>,
    handshake: Negotiator,
    next_msg_id: MsgId,
}

#[derive(Debug, Clone, Copy)]
struct AhEntry {
    ahn: u16,
    refs: usize,
}

/// Table of peers, keyed by user address, device address and wire sender.
#[derive(Debug)]
pub struct AddressVector {
    settings: PeerSettings,
    peers: HashMap<PeerAddr, Peer>,
    by_raw: HashMap<RawAddr, PeerAddr>,
    by_wire: HashMap<WireSender, PeerAddr>,
    ah_by_gid: HashMap<[u8; 16], AhEntry>,
    implicit_order: VecDeque<PeerAddr>,
    removed: HashSet<RawAddr>,
    parked: HashMap<RawAddr, Parked>,
    parked_order: VecDeque<RawAddr>,
    next_addr: u64,
}

impl AddressVector {
    /// Empty address vector.
    pub fn new(settings: PeerSettings) -> Self {
        Self {
            settings,
            peers: HashMap::new(),
            by_raw: HashMap::new(),
            by_wire: HashMap::new(),
            ah_by_gid: HashMap::new(),
            implicit_order: VecDeque::new(),
            removed: HashSet::new(),
            parked: HashMap::new(),
            parked_order: VecDeque::new(),
            next_addr: 0,
        }
    }

    /// Inserts a peer on behalf of the user.
    ///
    /// Inserting a device address that is already present returns the
    /// existing handle. Peers on the same GID share one address handle.
    pub fn insert(&mut self, raw: RawAddr, provider: &mut dyn FabricProvider) -> Result<PeerAddr> {
        self.removed.remove(&raw);
        if let Some(addr) = self.by_raw.get(&raw).copied() {
            if let Some(peer) = self.peers.get_mut(&addr) {
                if peer.implicit {
                    peer.implicit = false;
                    self.implicit_order.retain(|a| *a != addr);
                }
            }
            debug!(%addr, "duplicate address insert, returning existing peer");
            return Ok(addr);
        }
        self.add(raw, false, provider)
    }

    /// Inserts a peer discovered from traffic. Fails for addresses the
    /// user removed.
    pub fn insert_implicit(&mut self, raw: RawAddr, provider: &mut dyn FabricProvider) -> Result<PeerAddr> {
        if self.removed.contains(&raw) {
            return Err(ProtocolError::Provider("address was removed".to_string()));
        }
        if let Some(addr) = self.by_raw.get(&raw).copied() {
            return Ok(addr);
        }
        let addr = self.add(raw, true, provider)?;
        self.implicit_order.push_back(addr);
        self.evict_implicit(provider);
        Ok(addr)
    }

    fn add(&mut self, raw: RawAddr, implicit: bool, provider: &mut dyn FabricProvider) -> Result<PeerAddr> {
        let ahn = match self.ah_by_gid.get_mut(&raw.gid) {
            Some(entry) => {
                entry.refs += 1;
                entry.ahn
            }
            None => {
                let ahn = provider.create_ah(&raw.gid)?;
                self.ah_by_gid.insert(raw.gid, AhEntry { ahn, refs: 1 });
                ahn
            }
        };
        let addr = PeerAddr(self.next_addr);
        self.next_addr += 1;
        let mut peer = Peer::new(addr, raw, ahn, implicit, &self.settings);
        if let Some(parked) = self.unpark(&raw) {
            debug!(%addr, expected = %parked.window.expected(), "restoring parked ordering state");
            peer.window = parked.window;
            peer.handshake = parked.handshake;
            peer.next_msg_id = parked.next_msg_id;
        }
        self.peers.insert(addr, peer);
        self.by_raw.insert(raw, addr);
        self.by_wire.insert(WireSender { ahn, qpn: raw.qpn }, addr);
        debug!(%addr, ahn, qpn = raw.qpn, implicit, "peer inserted");
        Ok(addr)
    }

    fn evict_implicit(&mut self, provider: &mut dyn FabricProvider) {
        while self.implicit_order.len() > self.settings.implicit_capacity {
            // the newest entry is the peer being resolved right now
            let older = self.implicit_order.len() - 1;
            let Some(pos) = self
                .implicit_order
                .iter()
                .take(older)
                .position(|a| self.peers.get(a).is_some_and(Peer::is_idle))
            else {
                return;
            };
            if let Some(addr) = self.implicit_order.remove(pos) {
                info!(%addr, "forgetting idle implicit peer");
                if let Some(peer) = self.detach(addr, provider) {
                    self.park(peer);
                }
            }
        }
    }

    fn park(&mut self, peer: Peer) {
        while self.parked_order.len() >= self.settings.implicit_capacity.max(1) {
            let Some(oldest) = self.parked_order.pop_front() else {
                break;
            };
            self.parked.remove(&oldest);
            info!(qpn = oldest.qpn, "dropping parked ordering state");
        }
        self.parked_order.push_back(peer.raw);
        self.parked.insert(
            peer.raw,
            Parked {
                window: peer.window,
                handshake: peer.handshake,
                next_msg_id: peer.next_msg_id,
            },
        );
    }

    fn unpark(&mut self, raw: &RawAddr) -> Option<Parked> {
        let parked = self.parked.remove(raw)?;
        self.parked_order.retain(|r| r != raw);
        Some(parked)
    }

    /// Forgotten implicit peers whose ordering state is kept.
    pub fn parked_len(&self) -> usize {
        self.parked.len()
    }

    /// Removes a peer on behalf of the user. Later traffic from it is
    /// ignored instead of re-resolved.
    pub fn remove(&mut self, addr: PeerAddr, provider: &mut dyn FabricProvider) -> Option<Peer> {
        let peer = self.detach(addr, provider)?;
        self.implicit_order.retain(|a| *a != addr);
        self.removed.insert(peer.raw);
        self.unpark(&peer.raw);
        Some(peer)
    }

    fn detach(&mut self, addr: PeerAddr, provider: &mut dyn FabricProvider) -> Option<Peer> {
        let peer = self.peers.remove(&addr)?;
        self.by_raw.remove(&peer.raw);
        self.by_wire.remove(&WireSender {
            ahn: peer.ahn,
            qpn: peer.raw.qpn,
        });
        if let Some(entry) = self.ah_by_gid.get_mut(&peer.raw.gid) {
            entry.refs -= 1;
            if entry.refs == 0 {
                self.ah_by_gid.remove(&peer.raw.gid);
                provider.destroy_ah(peer.ahn);
            }
        }
        Some(peer)
    }

    /// Peer by user address.
    pub fn get(&self, addr: PeerAddr) -> Option<&Peer> {
        self.peers.get(&addr)
    }

    /// Mutable peer by user address.
    pub fn get_mut(&mut self, addr: PeerAddr) -> Option<&mut Peer> {
        self.peers.get_mut(&addr)
    }

    /// Peer for a receive-completion sender.
    pub fn lookup_wire(&self, sender: &WireSender) -> Option<PeerAddr> {
        self.by_wire.get(sender).copied()
    }

    /// Peer for a device address.
    pub fn lookup_raw(&self, raw: &RawAddr) -> Option<PeerAddr> {
        self.by_raw.get(raw).copied()
    }

    /// True if the user removed this device address.
    pub fn was_removed(&self, raw: &RawAddr) -> bool {
        self.removed.contains(raw)
    }

    /// All peer addresses, sorted.
    pub fn addrs(&self) -> Vec<PeerAddr> {
        let mut addrs: Vec<_> = self.peers.keys().copied().collect();
        addrs.sort();
        addrs
    }

    /// Number of peers.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// True if there are no peers.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Address handles currently held.
    pub fn ah_count(&self) -> usize {
        self.ah_by_gid.len()
    }

    /// Updates the queue limit for all peers.
    pub fn set_queue_limit(&mut self, limit: usize) {
        self.settings.queue_limit = limit;
        for peer in self.peers.values_mut() {
            peer.queue.set_limit(limit);
        }
    }
}
