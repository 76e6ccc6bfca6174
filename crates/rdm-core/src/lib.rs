#![warn(missing_docs)]

//! Reliable-datagram protocol engine over an unreliable, unordered device:
//! per-peer reorder windows, eager/medium/read-based send protocols with runt
//! sizing, capability handshake, RNR backoff and completion dispatch.

pub mod arena;
pub mod completion;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod handshake;
pub mod matching;
pub mod metrics;
pub mod op;
pub mod peer;
pub mod pool;
pub mod provider;
pub mod reorder;
pub mod retry;
pub mod seqnum;
pub mod sim;
pub mod sizing;
pub mod wire;

pub use completion::{CompletionEvent, ErrorReason, RecvCompletion, WcStatus};
pub use config::{EndpointConfig, EndpointOption};
pub use endpoint::{Endpoint, PeekResult};
pub use error::{ProtocolError, Result};
pub use handshake::{Capabilities, HandshakeState};
pub use metrics::{MetricsSnapshot, ProtocolMetrics};
pub use op::{IoBuf, OpFlags, OpHandle, OpKind, TagMatch};
pub use peer::{PeerAddr, RawAddr};
pub use provider::FabricProvider;
