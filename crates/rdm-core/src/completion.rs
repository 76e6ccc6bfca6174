//! Completion classification and sender resolution.
//!
//! Every device completion ends in exactly one user-visible event:
//! [`CompletionEvent::Success`], [`CompletionEvent::SendFailure`] or
//! [`CompletionEvent::RecvFailure`]. The one exception is a receive from a
//! sender that cannot be resolved to a peer; that completion is dropped
//! after a single resolution attempt.

use std::fmt;

use bytes::Bytes;
use thiserror::Error;
use tracing::debug;

use crate::metrics::ProtocolMetrics;
use crate::op::OpHandle;
use crate::peer::{AddressVector, PeerAddr, WireSender};
use crate::provider::FabricProvider;

/// Work completion status reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcStatus {
    /// Completed.
    Success,
    /// Receiver had no buffer posted.
    ReceiverNotReady,
    /// Receiver did not answer.
    UnresponsiveReceiver,
    /// Remote endpoint cannot be reached.
    UnreachableRemote,
    /// Remote queue pair does not exist.
    InvalidQpn,
    /// Message longer than the device allows.
    MessageTooLong,
    /// Remote memory access rejected.
    RemoteAccess,
    /// Local buffer too small.
    LocalLength,
    /// Work request flushed, usually by cancellation.
    Flushed,
    /// Vendor status code with no mapping.
    Other(u32),
}

impl fmt::Display for WcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WcStatus::Success => write!(f, "success"),
            WcStatus::ReceiverNotReady => write!(f, "receiver not ready"),
            WcStatus::UnresponsiveReceiver => write!(f, "unresponsive receiver"),
            WcStatus::UnreachableRemote => write!(f, "destination unreachable"),
            WcStatus::InvalidQpn => write!(f, "invalid queue pair number"),
            WcStatus::MessageTooLong => write!(f, "message too long"),
            WcStatus::RemoteAccess => write!(f, "remote access error"),
            WcStatus::LocalLength => write!(f, "local length error"),
            WcStatus::Flushed => write!(f, "work request flushed"),
            WcStatus::Other(code) => write!(f, "device status {code}"),
        }
    }
}

/// Host ids attached to a failure for diagnosis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HostIds {
    /// This host.
    pub local: Option<u64>,
    /// The peer's host, from its handshake.
    pub peer: Option<u64>,
}

fn fmt_host(f: &mut fmt::Formatter<'_>, id: Option<u64>) -> fmt::Result {
    match id {
        Some(id) => write!(f, "i-{id:016x}"),
        None => write!(f, "N/A"),
    }
}

impl fmt::Display for HostIds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "local host id: ")?;
        fmt_host(f, self.local)?;
        write!(f, ", peer host id: ")?;
        fmt_host(f, self.peer)
    }
}

/// Why an accepted operation failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ErrorReason {
    /// The peer kept answering RNR.
    #[error("receiver not ready after {attempts} attempts ({hosts})")]
    RnrRetryExceeded {
        /// RNR completions seen.
        attempts: u32,
        /// Host ids for diagnosis.
        hosts: HostIds,
    },
    /// The device reported an error status.
    #[error("{status} ({hosts})")]
    Device {
        /// Device status.
        status: WcStatus,
        /// Host ids for diagnosis.
        hosts: HostIds,
    },
    /// Cancelled by the user.
    #[error("operation cancelled")]
    Cancelled,
    /// The peer was removed while the operation was pending.
    #[error("peer removed")]
    PeerRemoved,
    /// The peer's handshake lacks a capability the operation needs.
    #[error("peer lacks capability: {0}")]
    CapabilityMissing(&'static str),
    /// The message does not fit the receive buffer.
    #[error("message of {len} bytes truncated to {capacity}")]
    Truncated {
        /// Message length.
        len: usize,
        /// Receive buffer length.
        capacity: usize,
    },
    /// The provider refused a post.
    #[error("provider error: {0}")]
    Provider(String),
}

impl ErrorReason {
    /// Failure for a device error status.
    pub fn from_status(status: WcStatus, hosts: HostIds) -> Self {
        ErrorReason::Device { status, hosts }
    }
}

/// One receive completion from the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecvCompletion {
    /// Who sent it.
    pub sender: WireSender,
    /// Status.
    pub status: WcStatus,
    /// Packet bytes.
    pub data: Bytes,
}

/// Event handed to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionEvent {
    /// Operation finished.
    Success {
        /// Operation.
        op: OpHandle,
        /// Bytes transferred.
        bytes: usize,
        /// Tag of the received message, for tagged receives.
        tag: Option<u64>,
        /// Received data, read data or the previous atomic value.
        data: Option<Bytes>,
    },
    /// A transmit-side operation failed.
    SendFailure {
        /// Operation.
        op: OpHandle,
        /// Why.
        reason: ErrorReason,
    },
    /// A receive failed. Device-level receive errors have no operation.
    RecvFailure {
        /// Operation, when one was bound.
        op: Option<OpHandle>,
        /// Why.
        reason: ErrorReason,
    },
}

impl CompletionEvent {
    /// Operation the event is about.
    pub fn op(&self) -> Option<OpHandle> {
        match self {
            CompletionEvent::Success { op, .. } | CompletionEvent::SendFailure { op, .. } => Some(*op),
            CompletionEvent::RecvFailure { op, .. } => *op,
        }
    }

    /// True for [`CompletionEvent::Success`].
    pub fn is_success(&self) -> bool {
        matches!(self, CompletionEvent::Success { .. })
    }
}

/// What a send completion means for the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Packet delivered.
    Done,
    /// Requeue the packet and back off.
    Rnr,
    /// Fail the owning operation.
    Failed(WcStatus),
}

/// Maps a send completion status to its outcome.
pub fn classify_send(status: WcStatus) -> SendOutcome {
    match status {
        WcStatus::Success => SendOutcome::Done,
        WcStatus::ReceiverNotReady => SendOutcome::Rnr,
        other => SendOutcome::Failed(other),
    }
}

/// How a receive sender was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Already in the address vector.
    Known(PeerAddr),
    /// Resolved by the provider and inserted implicitly.
    Recovered(PeerAddr),
    /// Could not be resolved; drop the completion.
    Dropped,
}

/// Maps a receive sender to a peer, asking the provider at most once.
///
/// A sender the user explicitly removed is not brought back even when the
/// provider still knows it.
pub fn resolve_sender(
    av: &mut AddressVector,
    provider: &mut dyn FabricProvider,
    sender: &WireSender,
    metrics: &ProtocolMetrics,
) -> Resolution {
    if let Some(addr) = av.lookup_wire(sender) {
        return Resolution::Known(addr);
    }
    let Some(raw) = provider.resolve_sender(sender) else {
        debug!(ahn = sender.ahn, qpn = sender.qpn, "unresolvable sender, dropping completion");
        metrics.inc_completions_dropped();
        return Resolution::Dropped;
    };
    if av.was_removed(&raw) {
        debug!(ahn = sender.ahn, qpn = sender.qpn, "completion from removed peer, dropping");
        metrics.inc_completions_dropped();
        return Resolution::Dropped;
    }
    if let Some(addr) = av.lookup_raw(&raw) {
        return Resolution::Known(addr);
    }
    match av.insert_implicit(raw, provider) {
        Ok(addr) => {
            debug!(%addr, qpn = raw.qpn, "recovered peer from receive completion");
            metrics.inc_peers_recovered();
            Resolution::Recovered(addr)
        }
        Err(e) => {
            debug!("implicit insert failed: {}, dropping completion", e);
            metrics.inc_completions_dropped();
            Resolution::Dropped
        }
    }
}
