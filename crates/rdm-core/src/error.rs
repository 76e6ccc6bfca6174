//! Error types returned synchronously by the protocol engine.

use thiserror::Error;

use crate::peer::PeerAddr;

/// Errors surfaced to the caller of a post or control call.
///
/// Per-operation failures that happen after a post was accepted are not
/// reported here; they arrive as completion events carrying an
/// [`ErrorReason`](crate::completion::ErrorReason).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The per-peer queue is at its limit; retry after progress.
    #[error("queue for peer {peer} is full ({limit} entries)")]
    QueueFull {
        /// Peer whose queue is full.
        peer: PeerAddr,
        /// Configured per-peer limit.
        limit: usize,
    },

    /// Not enough packet entries are free for the operation; retry after progress.
    #[error("packet pool exhausted: {requested} requested, {available} available")]
    PoolExhausted {
        /// Entries the operation needed.
        requested: usize,
        /// Entries free at the time of the call.
        available: usize,
    },

    /// No peer is registered under this address.
    #[error("unknown peer {0}")]
    UnknownPeer(PeerAddr),

    /// The handle does not name a live operation.
    #[error("invalid operation handle")]
    InvalidHandle,

    /// A handshake packet could not be decoded.
    #[error("malformed handshake: {reason}")]
    MalformedHandshake {
        /// What was wrong with it.
        reason: String,
    },

    /// A wire packet could not be decoded.
    #[error("invalid packet: {reason}")]
    InvalidPacket {
        /// What was wrong with it.
        reason: String,
    },

    /// The endpoint was not opened with the capability the operation needs.
    #[error("operation not supported: {reason}")]
    NotSupported {
        /// Missing capability.
        reason: String,
    },

    /// The peer does not advertise a capability the operation needs.
    #[error("peer {peer} lacks capability: {capability}")]
    PeerCapabilityMissing {
        /// Peer in question.
        peer: PeerAddr,
        /// Capability name.
        capability: &'static str,
    },

    /// The flag combination is invalid for this call.
    #[error("bad flags: {reason}")]
    BadFlags {
        /// What was wrong.
        reason: String,
    },

    /// The user tag uses bits reserved by the engine.
    #[error("invalid tag 0x{tag:016X}: bits outside mask 0x{mask:016X}")]
    InvalidTag {
        /// Offending tag.
        tag: u64,
        /// Allowed mask.
        mask: u64,
    },

    /// Endpoint options can only be changed before the first post.
    #[error("option {0} cannot be changed after the endpoint is active")]
    OptionLocked(&'static str),

    /// Configuration value rejected.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The provider refused the request.
    #[error("provider error: {0}")]
    Provider(String),
}

/// Result alias for protocol engine calls.
pub type Result<T> = std::result::Result<T, ProtocolError>;
