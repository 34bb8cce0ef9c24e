//! Wire messages and the validation state machine
//!
//! A [`Message`] starts pristine, decodes its header, then accepts and
//! validates its payload. Every structural rule from the catalog is
//! enforced here; the session layer only ever sees a validated message
//! or a [`RejectReason`].

use crate::codec::catalog::{lookup, MessageKind};
use crate::codec::header::{MessageHeader, HEADER_SIZE};
use crate::codec::serialize::{
    compact_size_len, read_compact_size, write_compact_size, ByteReader, ByteWriter, CodecError,
    Serializable,
};
use crate::codec::MAX_PAYLOAD_SIZE;
use crate::crypto::payload_checksum;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use thiserror::Error;

/// Longest command string carried inside a `reject` payload
const MAX_REJECT_MESSAGE_LEN: usize = 12;

/// Longest human-readable reason carried inside a `reject` payload
const MAX_REJECT_REASON_LEN: usize = 111;

/// Longest user agent accepted in a `version` payload
const MAX_USER_AGENT_LEN: usize = 256;

// =============================================================================
// Rejection taxonomy
// =============================================================================

/// Why an incoming message was rejected.
///
/// These are protocol-facing and recoverable: the session owner decides
/// whether the connection survives, this layer only reports.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    #[error("fewer bytes than a full header")]
    HeaderIncomplete,
    #[error("magic mismatch: expected {expected}, got {actual}")]
    InvalidMagic { expected: String, actual: String },
    #[error("command field is malformed")]
    MalformedCommand,
    #[error("command field is empty")]
    EmptyCommand,
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
    #[error("{kind:?} not supported at protocol version {version}")]
    UnsupportedKind { kind: MessageKind, version: u32 },
    #[error("payload of {len} bytes below minimum {min} for {kind:?}")]
    UndersizedPayload {
        kind: MessageKind,
        len: u32,
        min: u32,
    },
    #[error("payload of {len} bytes above maximum {max} for {kind:?}")]
    OversizedPayload {
        kind: MessageKind,
        len: u32,
        max: u32,
    },
    #[error("payload checksum mismatch")]
    InvalidChecksum,
    #[error("vectorized payload with zero items")]
    EmptyVector,
    #[error("vector of {count} items exceeds maximum {max}")]
    OversizedVector { count: u64, max: u64 },
    #[error("payload length disagrees with vector item count")]
    LengthMismatchesVectorSize,
    #[error("duplicate items in vectorized payload")]
    DuplicateVectorItems,
    #[error("trailing bytes after payload contents")]
    ExtraData,
    #[error(transparent)]
    Codec(#[from] CodecError),
}

// =============================================================================
// Message + validation state machine
// =============================================================================

/// Validation progress of a message being received
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationState {
    Pristine,
    HeaderDecoded,
    Validated,
    Rejected,
}

/// One wire message: exactly one header and one payload buffer.
///
/// Built blank and filled by decoding, or built for transmission via
/// [`Message::build`]. Never shared across sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    header: MessageHeader,
    payload: Vec<u8>,
    kind: MessageKind,
    state: ValidationState,
}

impl Default for Message {
    fn default() -> Self {
        Self::new()
    }
}

impl Message {
    /// A pristine message awaiting its header
    pub fn new() -> Self {
        Self {
            header: MessageHeader::new(),
            payload: Vec::new(),
            kind: MessageKind::Unknown,
            state: ValidationState::Pristine,
        }
    }

    /// Build an outgoing message: stamps the header, computes the checksum.
    pub fn build(magic: [u8; 4], kind: MessageKind, payload: Vec<u8>) -> Self {
        let mut header = MessageHeader::new();
        header.magic = magic;
        header.set_kind(kind);
        header.length = payload.len() as u32;
        header.checksum = payload_checksum(&payload);
        Self {
            header,
            payload,
            kind,
            state: ValidationState::Validated,
        }
    }

    pub fn header(&self) -> &MessageHeader {
        &self.header
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn state(&self) -> ValidationState {
        self.state
    }

    pub fn is_validated(&self) -> bool {
        self.state == ValidationState::Validated
    }

    /// Decode and validate the fixed header: magic, command shape, catalog
    /// lookup, version applicability, declared payload length.
    ///
    /// `Pristine → HeaderDecoded` on success, `Pristine → Rejected` on a
    /// validation failure. Fewer than [`HEADER_SIZE`] bytes leaves the
    /// message pristine so the caller can retry with more data.
    pub fn decode_header(
        &mut self,
        bytes: &[u8],
        expected_magic: Option<[u8; 4]>,
        protocol_version: Option<u32>,
    ) -> Result<(), RejectReason> {
        assert_eq!(
            self.state,
            ValidationState::Pristine,
            "decode_header on a non-pristine message"
        );
        if bytes.len() < HEADER_SIZE {
            return Err(RejectReason::HeaderIncomplete);
        }
        let mut r = ByteReader::new(&bytes[..HEADER_SIZE]);
        let header = MessageHeader::deserialize(&mut r)?;

        match Self::validate_header(&header, expected_magic, protocol_version) {
            Ok(kind) => {
                self.header = header;
                self.kind = kind;
                self.state = ValidationState::HeaderDecoded;
                Ok(())
            }
            Err(reason) => {
                self.header = header;
                self.state = ValidationState::Rejected;
                Err(reason)
            }
        }
    }

    fn validate_header(
        header: &MessageHeader,
        expected_magic: Option<[u8; 4]>,
        protocol_version: Option<u32>,
    ) -> Result<MessageKind, RejectReason> {
        if let Some(expected) = expected_magic {
            if header.magic != expected {
                return Err(RejectReason::InvalidMagic {
                    expected: hex::encode(expected),
                    actual: hex::encode(header.magic),
                });
            }
        }
        let kind = header.kind()?;
        let def = lookup(kind);
        if let Some(version) = protocol_version {
            if version < def.min_version || version > def.max_version {
                return Err(RejectReason::UnsupportedKind { kind, version });
            }
        }
        Self::check_payload_len(kind, header.length)?;
        Ok(kind)
    }

    /// Declared-length check: per-kind bounds are authoritative, the 4 MiB
    /// ceiling is a hard upper bound on top of them.
    fn check_payload_len(kind: MessageKind, len: u32) -> Result<(), RejectReason> {
        let def = lookup(kind);
        if len as usize > MAX_PAYLOAD_SIZE {
            return Err(RejectReason::OversizedPayload {
                kind,
                len,
                max: MAX_PAYLOAD_SIZE as u32,
            });
        }
        if len > def.max_payload {
            return Err(RejectReason::OversizedPayload {
                kind,
                len,
                max: def.max_payload,
            });
        }
        if len < def.min_payload {
            return Err(RejectReason::UndersizedPayload {
                kind,
                len,
                min: def.min_payload,
            });
        }
        Ok(())
    }

    /// Accept the payload bytes and run the remaining validation:
    /// vector structure for vectorized kinds, then the checksum.
    ///
    /// The checksum is recomputed over the raw bytes whether or not the
    /// structural checks passed, so a bad checksum is always observed;
    /// when both fail the structural error is reported.
    pub fn accept_payload(&mut self, payload: Vec<u8>) -> Result<(), RejectReason> {
        assert_eq!(
            self.state,
            ValidationState::HeaderDecoded,
            "accept_payload before a decoded header"
        );
        debug_assert_eq!(payload.len() as u32, self.header.length);

        let structure = self.validate_structure(&payload);
        let checksum_ok = payload_checksum(&payload) == self.header.checksum;

        self.payload = payload;
        match (structure, checksum_ok) {
            (Ok(()), true) => {
                self.state = ValidationState::Validated;
                Ok(())
            }
            (Err(reason), _) => {
                self.state = ValidationState::Rejected;
                Err(reason)
            }
            (Ok(()), false) => {
                self.state = ValidationState::Rejected;
                Err(RejectReason::InvalidChecksum)
            }
        }
    }

    /// Structural validation of a vectorized payload against the catalog:
    /// item count bounds, length agreement, duplicate items.
    fn validate_structure(&self, payload: &[u8]) -> Result<(), RejectReason> {
        let def = lookup(self.kind);
        if !def.vectorized {
            return Ok(());
        }
        let mut r = ByteReader::new(payload);
        let _prefix = r.read_bytes(def.vector_prefix as usize)?;
        let count = read_compact_size(&mut r, true)?;
        if count == 0 {
            return Err(RejectReason::EmptyVector);
        }
        if count > def.max_vector_items {
            return Err(RejectReason::OversizedVector {
                count,
                max: def.max_vector_items,
            });
        }
        let expected = def.vector_prefix as u64
            + compact_size_len(count) as u64
            + count * def.item_size as u64
            + def.vector_suffix as u64;
        if expected != payload.len() as u64 {
            return Err(RejectReason::LengthMismatchesVectorSize);
        }
        let mut seen: HashSet<&[u8]> = HashSet::with_capacity(count as usize);
        for _ in 0..count {
            let item = r.read_bytes(def.item_size as usize)?;
            if !seen.insert(item) {
                return Err(RejectReason::DuplicateVectorItems);
            }
        }
        Ok(())
    }

    /// Decode the payload into its typed form. Requires a validated message.
    pub fn decode_payload(&self) -> Result<MessagePayload, RejectReason> {
        assert!(
            self.is_validated(),
            "decode_payload on an unvalidated message"
        );
        let mut r = ByteReader::new(&self.payload);
        let payload = match self.kind {
            MessageKind::Version => MessagePayload::Version(VersionMessage::deserialize(&mut r)?),
            MessageKind::VerAck => MessagePayload::VerAck,
            MessageKind::Ping => MessagePayload::Ping(r.read_u64()?),
            MessageKind::Pong => MessagePayload::Pong(r.read_u64()?),
            MessageKind::Inv => MessagePayload::Inv(read_vector(&mut r)?),
            MessageKind::GetData => MessagePayload::GetData(read_vector(&mut r)?),
            MessageKind::Addr => MessagePayload::Addr(read_vector(&mut r)?),
            MessageKind::GetAddr => MessagePayload::GetAddr,
            MessageKind::MemPool => MessagePayload::MemPool,
            MessageKind::Reject => MessagePayload::Reject(RejectMessage::deserialize(&mut r)?),
            // Structurally validated, consensus decoding happens elsewhere
            MessageKind::GetHeaders => MessagePayload::GetHeaders(self.payload.clone()),
            MessageKind::Headers => MessagePayload::Headers(self.payload.clone()),
            MessageKind::Unknown => unreachable!("validated message with Unknown kind"),
        };
        match self.kind {
            MessageKind::GetHeaders | MessageKind::Headers => {}
            _ if !r.is_empty() => return Err(RejectReason::ExtraData),
            _ => {}
        }
        Ok(payload)
    }
}

fn read_vector<T: Serializable>(r: &mut ByteReader<'_>) -> Result<Vec<T>, RejectReason> {
    let count = read_compact_size(r, true)?;
    let mut items = Vec::with_capacity(count as usize);
    for _ in 0..count {
        items.push(T::deserialize(r)?);
    }
    Ok(items)
}

// =============================================================================
// Typed payloads
// =============================================================================

/// Typed view of a validated payload
#[derive(Debug, Clone)]
pub enum MessagePayload {
    Version(VersionMessage),
    VerAck,
    Inv(Vec<InvItem>),
    Addr(Vec<NetAddr>),
    Ping(u64),
    Pong(u64),
    /// Raw bytes: block-locator decoding is a consensus concern
    GetHeaders(Vec<u8>),
    /// Raw bytes: header decoding is a consensus concern
    Headers(Vec<u8>),
    GetAddr,
    MemPool,
    Reject(RejectMessage),
    GetData(Vec<InvItem>),
}

bitflags::bitflags! {
    /// Service bits advertised in `version` and `addr` payloads
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ServiceFlags: u64 {
        const NODE_NETWORK = 1;
        const NODE_GETUTXO = 2;
        const NODE_BLOOM = 4;
    }
}

/// A timestamped network address as carried in `addr` payloads (30 bytes)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NetAddr {
    /// Last-seen time, seconds since the epoch
    pub time: u32,
    pub services: u64,
    /// IPv4 addresses are carried IPv4-mapped
    pub ip: Ipv6Addr,
    pub port: u16,
}

impl NetAddr {
    pub fn from_socket_addr(addr: SocketAddr, time: u32, services: ServiceFlags) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        };
        Self {
            time,
            services: services.bits(),
            ip,
            port: addr.port(),
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        match self.ip.to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), self.port),
            None => SocketAddr::new(IpAddr::V6(self.ip), self.port),
        }
    }
}

impl Serializable for NetAddr {
    fn serialize(&self, w: &mut ByteWriter) {
        w.write_u32(self.time);
        w.write_u64(self.services);
        w.write_bytes(&self.ip.octets());
        w.write_u16_be(self.port);
    }

    fn deserialize(r: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            time: r.read_u32()?,
            services: r.read_u64()?,
            ip: Ipv6Addr::from(r.read_array::<16>()?),
            port: r.read_u16_be()?,
        })
    }
}

/// One entry of an `inv`/`getdata` vector (36 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InvItem {
    /// 1 = transaction, 2 = block
    pub inv_type: u32,
    pub hash: [u8; 32],
}

impl Serializable for InvItem {
    fn serialize(&self, w: &mut ByteWriter) {
        w.write_u32(self.inv_type);
        w.write_bytes(&self.hash);
    }

    fn deserialize(r: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            inv_type: r.read_u32()?,
            hash: r.read_array()?,
        })
    }
}

/// The `version` handshake payload.
///
/// Everything after `addr_recv` was added by later protocol versions, so
/// decoding tolerates its absence; encoding always writes the full form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    pub version: u32,
    pub services: u64,
    pub timestamp: i64,
    pub addr_recv: NetAddr,
    pub addr_from: NetAddr,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
}

/// Addresses inside `version` are serialized without the time field
fn write_version_addr(w: &mut ByteWriter, addr: &NetAddr) {
    w.write_u64(addr.services);
    w.write_bytes(&addr.ip.octets());
    w.write_u16_be(addr.port);
}

fn read_version_addr(r: &mut ByteReader<'_>) -> Result<NetAddr, CodecError> {
    Ok(NetAddr {
        time: 0,
        services: r.read_u64()?,
        ip: Ipv6Addr::from(r.read_array::<16>()?),
        port: r.read_u16_be()?,
    })
}

impl Serializable for VersionMessage {
    fn serialize(&self, w: &mut ByteWriter) {
        w.write_u32(self.version);
        w.write_u64(self.services);
        w.write_i64(self.timestamp);
        write_version_addr(w, &self.addr_recv);
        write_version_addr(w, &self.addr_from);
        w.write_u64(self.nonce);
        write_var_string(w, &self.user_agent);
        w.write_i32(self.start_height);
        w.write_u8(self.relay as u8);
    }

    fn deserialize(r: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        let version = r.read_u32()?;
        let services = r.read_u64()?;
        let timestamp = r.read_i64()?;
        let addr_recv = read_version_addr(r)?;

        // Fields below are absent in the oldest handshakes
        let mut msg = Self {
            version,
            services,
            timestamp,
            addr_recv,
            addr_from: NetAddr {
                time: 0,
                services: 0,
                ip: Ipv6Addr::UNSPECIFIED,
                port: 0,
            },
            nonce: 0,
            user_agent: String::new(),
            start_height: 0,
            relay: false,
        };
        if r.is_empty() {
            return Ok(msg);
        }
        msg.addr_from = read_version_addr(r)?;
        msg.nonce = r.read_u64()?;
        msg.user_agent = read_var_string(r, MAX_USER_AGENT_LEN)?;
        msg.start_height = r.read_i32()?;
        if !r.is_empty() {
            msg.relay = r.read_u8()? != 0;
        }
        Ok(msg)
    }
}

/// Rejection codes carried in `reject` payloads (closed enumeration)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RejectCode {
    Malformed = 0x01,
    Invalid = 0x10,
    Obsolete = 0x11,
    Duplicate = 0x12,
    Nonstandard = 0x40,
    Dust = 0x41,
    InsufficientFee = 0x42,
    Checkpoint = 0x43,
}

impl TryFrom<u8> for RejectCode {
    type Error = CodecError;

    fn try_from(byte: u8) -> Result<Self, CodecError> {
        Ok(match byte {
            0x01 => Self::Malformed,
            0x10 => Self::Invalid,
            0x11 => Self::Obsolete,
            0x12 => Self::Duplicate,
            0x40 => Self::Nonstandard,
            0x41 => Self::Dust,
            0x42 => Self::InsufficientFee,
            0x43 => Self::Checkpoint,
            _ => return Err(CodecError::InvalidValue("reject code")),
        })
    }
}

/// The `reject` payload: offending command, code, human-readable reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectMessage {
    pub message: String,
    pub code: RejectCode,
    pub reason: String,
}

impl Serializable for RejectMessage {
    fn serialize(&self, w: &mut ByteWriter) {
        write_var_string(w, &self.message);
        w.write_u8(self.code as u8);
        write_var_string(w, &self.reason);
    }

    fn deserialize(r: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            message: read_var_string(r, MAX_REJECT_MESSAGE_LEN)?,
            code: RejectCode::try_from(r.read_u8()?)?,
            reason: read_var_string(r, MAX_REJECT_REASON_LEN)?,
        })
    }
}

/// Compact-length-prefixed string
fn write_var_string(w: &mut ByteWriter, s: &str) {
    write_compact_size(w, s.len() as u64);
    w.write_bytes(s.as_bytes());
}

fn read_var_string(r: &mut ByteReader<'_>, max_len: usize) -> Result<String, CodecError> {
    let len = read_compact_size(r, true)?;
    if len > max_len as u64 {
        return Err(CodecError::CompactSizeTooBig(len));
    }
    let bytes = r.read_bytes(len as usize)?;
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{MAGIC, PROTOCOL_VERSION};

    fn receive(built: &Message) -> Result<Message, RejectReason> {
        receive_bytes(&built.header().to_bytes(), built.payload())
    }

    fn receive_bytes(header: &[u8], payload: &[u8]) -> Result<Message, RejectReason> {
        let mut msg = Message::new();
        msg.decode_header(header, Some(MAGIC), Some(PROTOCOL_VERSION))?;
        msg.accept_payload(payload.to_vec())?;
        Ok(msg)
    }

    fn minimal_payload(kind: MessageKind) -> Vec<u8> {
        let def = lookup(kind);
        if !def.vectorized {
            // Deterministic filler of the minimum length
            return (0..def.min_payload).map(|i| (i % 251) as u8).collect();
        }
        let mut w = ByteWriter::new();
        w.write_bytes(&vec![0u8; def.vector_prefix as usize]);
        write_compact_size(&mut w, 1);
        w.write_bytes(&vec![0xAB; def.item_size as usize]);
        w.write_bytes(&vec![0u8; def.vector_suffix as usize]);
        w.into_vec()
    }

    #[test]
    fn test_minimal_payloads_validate_for_all_kinds() {
        for kind in MessageKind::ALL {
            if kind == MessageKind::Unknown || kind == MessageKind::Reject {
                continue;
            }
            let built = Message::build(MAGIC, kind, minimal_payload(kind));
            let msg = receive(&built).unwrap_or_else(|e| panic!("{:?}: {}", kind, e));
            assert_eq!(msg.kind(), kind);
            assert_eq!(msg.state(), ValidationState::Validated);
        }
    }

    #[test]
    fn test_undersized_and_oversized_declared_lengths() {
        let def = lookup(MessageKind::Version);
        let built = Message::build(MAGIC, MessageKind::Version, vec![0; def.min_payload as usize - 1]);
        assert!(matches!(
            receive(&built),
            Err(RejectReason::UndersizedPayload { .. })
        ));

        let built = Message::build(MAGIC, MessageKind::Version, vec![0; def.max_payload as usize + 1]);
        assert!(matches!(
            receive(&built),
            Err(RejectReason::OversizedPayload { .. })
        ));
    }

    #[test]
    fn test_magic_mismatch_rejected() {
        let built = Message::build([0xDE, 0xAD, 0xBE, 0xEF], MessageKind::Ping, vec![0; 8]);
        assert!(matches!(
            receive(&built),
            Err(RejectReason::InvalidMagic { .. })
        ));
    }

    #[test]
    fn test_header_incomplete_keeps_message_pristine() {
        let mut msg = Message::new();
        let err = msg.decode_header(&[0u8; 10], Some(MAGIC), None);
        assert_eq!(err, Err(RejectReason::HeaderIncomplete));
        assert_eq!(msg.state(), ValidationState::Pristine);
    }

    #[test]
    fn test_checksum_flip_detected_at_every_byte() {
        let built = Message::build(MAGIC, MessageKind::Ping, 42u64.to_bytes());
        let header_bytes = built.header().to_bytes();
        for i in 0..built.payload().len() {
            let mut payload = built.payload().to_vec();
            payload[i] ^= 0x01;
            assert_eq!(
                receive_bytes(&header_bytes, &payload),
                Err(RejectReason::InvalidChecksum),
                "flip at byte {i}"
            );
        }
    }

    #[test]
    fn test_vector_structure_checks() {
        let def = lookup(MessageKind::Inv);

        // Zero items
        let mut w = ByteWriter::new();
        write_compact_size(&mut w, 0);
        let built = Message::build(MAGIC, MessageKind::Inv, {
            // pad to the minimum declared length so the header check passes
            let mut p = w.into_vec();
            p.resize(def.min_payload as usize, 0);
            p
        });
        assert_eq!(receive(&built), Err(RejectReason::EmptyVector));

        // Count disagrees with the payload length
        let mut w = ByteWriter::new();
        write_compact_size(&mut w, 2);
        w.write_bytes(&[0u8; 36]);
        let built = Message::build(MAGIC, MessageKind::Inv, w.into_vec());
        assert_eq!(
            receive(&built),
            Err(RejectReason::LengthMismatchesVectorSize)
        );

        // Duplicate items
        let item = InvItem {
            inv_type: 2,
            hash: [7; 32],
        };
        let mut w = ByteWriter::new();
        write_compact_size(&mut w, 2);
        item.serialize(&mut w);
        item.serialize(&mut w);
        let built = Message::build(MAGIC, MessageKind::Inv, w.into_vec());
        assert_eq!(receive(&built), Err(RejectReason::DuplicateVectorItems));
    }

    #[test]
    fn test_oversized_vector_rejected_before_items() {
        // An addr count above the catalog maximum, padded so the declared
        // length still sits inside the header bounds
        let mut w = ByteWriter::new();
        write_compact_size(&mut w, 1_001);
        let mut payload = w.into_vec();
        payload.resize(lookup(MessageKind::Addr).max_payload as usize, 0);
        let built = Message::build(MAGIC, MessageKind::Addr, payload);
        assert_eq!(
            receive(&built),
            Err(RejectReason::OversizedVector {
                count: 1_001,
                max: 1_000
            })
        );
    }

    #[test]
    fn test_structural_error_reported_over_bad_checksum() {
        // Both the structure and the checksum are wrong; the structural
        // error wins, the checksum is still computed
        let mut w = ByteWriter::new();
        write_compact_size(&mut w, 2);
        w.write_bytes(&[0u8; 36]);
        let built = Message::build(MAGIC, MessageKind::Inv, w.into_vec());
        let mut payload = built.payload().to_vec();
        let last = payload.len() - 1;
        payload[last] ^= 0xFF;
        assert_eq!(
            receive_bytes(&built.header().to_bytes(), &payload),
            Err(RejectReason::LengthMismatchesVectorSize)
        );
    }

    #[test]
    fn test_mempool_needs_protocol_version() {
        let built = Message::build(MAGIC, MessageKind::MemPool, Vec::new());
        let mut msg = Message::new();
        let err = msg.decode_header(&built.header().to_bytes(), Some(MAGIC), Some(31_800));
        assert_eq!(
            err,
            Err(RejectReason::UnsupportedKind {
                kind: MessageKind::MemPool,
                version: 31_800
            })
        );
    }

    #[test]
    fn test_version_message_roundtrip() {
        let addr = NetAddr::from_socket_addr(
            "203.0.113.7:8333".parse().unwrap(),
            0,
            ServiceFlags::NODE_NETWORK,
        );
        let version = VersionMessage {
            version: PROTOCOL_VERSION,
            services: ServiceFlags::NODE_NETWORK.bits(),
            timestamp: 1_700_000_000,
            addr_recv: addr.clone(),
            addr_from: addr,
            nonce: 0xDEAD_BEEF,
            user_agent: "/mini-node:0.1.0/".into(),
            start_height: 812_383,
            relay: true,
        };
        let built = Message::build(MAGIC, MessageKind::Version, version.to_bytes());
        let msg = receive(&built).unwrap();
        match msg.decode_payload().unwrap() {
            MessagePayload::Version(decoded) => assert_eq!(decoded, version),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_version_extra_data_rejected() {
        let addr = NetAddr::from_socket_addr(
            "203.0.113.7:8333".parse().unwrap(),
            0,
            ServiceFlags::NODE_NETWORK,
        );
        let version = VersionMessage {
            version: PROTOCOL_VERSION,
            services: 0,
            timestamp: 0,
            addr_recv: addr.clone(),
            addr_from: addr,
            nonce: 1,
            user_agent: String::new(),
            start_height: 0,
            relay: false,
        };
        let mut payload = version.to_bytes();
        payload.extend_from_slice(&[0, 0, 0, 0]);
        let built = Message::build(MAGIC, MessageKind::Version, payload);
        let msg = receive(&built).unwrap();
        assert_eq!(msg.decode_payload().unwrap_err(), RejectReason::ExtraData);
    }

    #[test]
    fn test_reject_message_roundtrip() {
        let reject = RejectMessage {
            message: "inv".into(),
            code: RejectCode::Duplicate,
            reason: "duplicate inventory".into(),
        };
        let built = Message::build(MAGIC, MessageKind::Reject, reject.to_bytes());
        let msg = receive(&built).unwrap();
        match msg.decode_payload().unwrap() {
            MessagePayload::Reject(decoded) => assert_eq!(decoded, reject),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_addr_payload_roundtrip() {
        let addrs: Vec<NetAddr> = (0..3)
            .map(|i| {
                NetAddr::from_socket_addr(
                    format!("10.0.0.{}:8333", i + 1).parse().unwrap(),
                    1_700_000_000 + i,
                    ServiceFlags::NODE_NETWORK,
                )
            })
            .collect();
        let mut w = ByteWriter::new();
        write_compact_size(&mut w, addrs.len() as u64);
        for a in &addrs {
            a.serialize(&mut w);
        }
        let built = Message::build(MAGIC, MessageKind::Addr, w.into_vec());
        let msg = receive(&built).unwrap();
        match msg.decode_payload().unwrap() {
            MessagePayload::Addr(decoded) => {
                assert_eq!(decoded, addrs);
                assert_eq!(decoded[0].socket_addr(), "10.0.0.1:8333".parse().unwrap());
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }
}
