//! P2P networking
//!
//! Connection-level machinery of the node:
//! - Admission control and connection classification
//! - Deduplicating bounded queue of outbound targets
//! - Per-session protocol state machine over the wire codec
//! - The connection hub orchestrating all of the above

pub mod config;
pub mod hub;
pub mod queue;
pub mod session;

pub use config::HubConfig;
pub use hub::{ConnectionHub, HubEvent, SessionId};
pub use queue::ConnectQueue;
pub use session::{ConnectionTarget, ConnectionType, SessionState, WireCodec};

use crate::codec::message::RejectReason;
use thiserror::Error;

/// Session- and task-level errors.
///
/// Codec rejections are wrapped here when a session decides a peer must go;
/// `Cancelled` marks cooperative unwinding and is never surfaced as a task
/// group's result.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol violation: {0}")]
    Reject(#[from] RejectReason),
    #[error("duplicate handshake")]
    DuplicateHandshake,
    #[error("invalid handshake")]
    InvalidHandshake,
    #[error("flooding detected")]
    FloodingDetected,
    #[error("connected to self")]
    ConnectedToSelf,
    #[error("pong without an outstanding ping")]
    UnsolicitedPong,
    #[error("ping/pong nonce mismatch")]
    InvalidPingPongNonce,
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("cancelled")]
    Cancelled,
    #[error("task panicked: {0}")]
    TaskPanicked(String),
}

impl NetError {
    /// True for completions caused by cooperative cancellation
    pub fn is_cancellation(&self) -> bool {
        matches!(self, NetError::Cancelled)
    }
}
