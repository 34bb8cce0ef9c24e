//! Session types and wire framing
//!
//! Per-connection bookkeeping (state machine, traffic counters, flood
//! budget) and the tokio codec that frames validated messages on a TCP
//! stream.

use crate::codec::serialize::Serializable;
use crate::codec::{Message, ValidationState, HEADER_SIZE};
use crate::network::NetError;
use bytes::{Buf, BytesMut};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder};

/// Sliding window over which inbound message rates are measured
pub const FLOOD_WINDOW: Duration = Duration::from_secs(10);

/// Inbound messages allowed per window before a session counts as flooding
pub const FLOOD_MESSAGE_BUDGET: u32 = 500;

// =============================================================================
// Connection classification
// =============================================================================

/// How a connection came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    /// Accepted on the listen socket
    Inbound,
    /// Originated by address relay / discovery
    Outbound,
    /// Originated from a manually-configured endpoint
    ManualOutbound,
    /// Originated from a seed list
    SeedOutbound,
}

impl ConnectionType {
    pub fn is_outbound(self) -> bool {
        !matches!(self, ConnectionType::Inbound)
    }
}

/// A connection endpoint plus its classification.
///
/// Equality is structural; this is the key type of the connect queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionTarget {
    pub addr: SocketAddr,
    pub conn_type: ConnectionType,
}

impl ConnectionTarget {
    pub fn new(addr: SocketAddr, conn_type: ConnectionType) -> Self {
        Self { addr, conn_type }
    }
}

// =============================================================================
// Session state
// =============================================================================

/// Lifecycle of one session, driven by discrete events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Handshaking,
    Established,
    Closing,
}

/// Commands the hub's maintenance cycle sends into a session task
#[derive(Debug)]
pub enum SessionCommand {
    /// Send a ping carrying this nonce
    SendPing(u64),
    /// Close the connection (idle, ping timeout, shutdown of one session)
    Disconnect(&'static str),
}

/// Hub-side bookkeeping for one live session.
///
/// Owned by the hub's session map; everything else refers to the session
/// by its integer id only.
#[derive(Debug)]
pub struct SessionEntry {
    pub target: ConnectionTarget,
    pub state: SessionState,
    pub cmd_tx: mpsc::UnboundedSender<SessionCommand>,
    pub last_activity: Instant,
    /// Nonce and send time of the outstanding ping, if any
    pub outstanding_ping: Option<(u64, Instant)>,
    pub peer_version: Option<u32>,
    pub user_agent: String,
    pub bytes_in: u64,
    pub bytes_out: u64,
    window_start: Instant,
    msgs_in_window: u32,
}

impl SessionEntry {
    pub fn new(target: ConnectionTarget, cmd_tx: mpsc::UnboundedSender<SessionCommand>) -> Self {
        let now = Instant::now();
        Self {
            target,
            state: SessionState::Connecting,
            cmd_tx,
            last_activity: now,
            outstanding_ping: None,
            peer_version: None,
            user_agent: String::new(),
            bytes_in: 0,
            bytes_out: 0,
            window_start: now,
            msgs_in_window: 0,
        }
    }

    /// Account one received message; returns false when the session has
    /// exhausted its flood budget for the current window.
    pub fn record_recv(&mut self, wire_len: usize) -> bool {
        let now = Instant::now();
        self.last_activity = now;
        self.bytes_in += wire_len as u64;
        if now.duration_since(self.window_start) >= FLOOD_WINDOW {
            self.window_start = now;
            self.msgs_in_window = 0;
        }
        self.msgs_in_window += 1;
        self.msgs_in_window <= FLOOD_MESSAGE_BUDGET
    }

    pub fn record_send(&mut self, wire_len: usize) {
        self.bytes_out += wire_len as u64;
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.duration_since(self.last_activity)
    }
}

// =============================================================================
// Wire codec
// =============================================================================

/// Frames validated [`Message`]s over a byte stream.
///
/// Decoding runs the full header validation before any payload bytes are
/// buffered, so an oversized or malformed header never causes a large
/// allocation. `protocol_version` starts unset and is filled in once the
/// peer's version is known, tightening kind applicability checks.
#[derive(Debug)]
pub struct WireCodec {
    magic: [u8; 4],
    pub protocol_version: Option<u32>,
}

impl WireCodec {
    pub fn new(magic: [u8; 4]) -> Self {
        Self {
            magic,
            protocol_version: None,
        }
    }
}

impl Decoder for WireCodec {
    type Item = Message;
    type Error = NetError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, NetError> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }
        let mut msg = Message::new();
        msg.decode_header(&src[..HEADER_SIZE], Some(self.magic), self.protocol_version)?;
        let length = msg.header().length as usize;
        if src.len() < HEADER_SIZE + length {
            src.reserve(HEADER_SIZE + length - src.len());
            return Ok(None);
        }
        src.advance(HEADER_SIZE);
        let payload = src.split_to(length).to_vec();
        msg.accept_payload(payload)?;
        Ok(Some(msg))
    }
}

impl Encoder<Message> for WireCodec {
    type Error = NetError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), NetError> {
        debug_assert_eq!(msg.state(), ValidationState::Validated);
        dst.reserve(HEADER_SIZE + msg.payload().len());
        dst.extend_from_slice(&msg.header().to_bytes());
        dst.extend_from_slice(msg.payload());
        Ok(())
    }
}
