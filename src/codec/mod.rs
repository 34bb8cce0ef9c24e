//! Wire-message codec
//!
//! Turns untrusted byte streams into typed, validated protocol messages:
//! - Framing primitives (cursor reader/writer, compact size)
//! - Static message catalog (kind ↔ command label ↔ structural limits)
//! - Fixed 24-byte header
//! - Validation state machine and typed payloads

pub mod catalog;
pub mod header;
pub mod message;
pub mod serialize;

pub use catalog::{lookup, MessageDefinition, MessageKind};
pub use header::{MessageHeader, COMMAND_SIZE, HEADER_SIZE};
pub use message::{
    InvItem, Message, MessagePayload, NetAddr, RejectCode, RejectMessage, RejectReason,
    ServiceFlags, ValidationState, VersionMessage,
};
pub use serialize::{
    compact_size_len, read_compact_size, write_compact_size, ByteReader, ByteWriter, CodecError,
    Serializable, MAX_COMPACT_SIZE,
};

/// Protocol version spoken by this node
pub const PROTOCOL_VERSION: u32 = 70_015;

/// Oldest protocol version we will talk to
pub const MIN_PROTOCOL_VERSION: u32 = 60_002;

/// Absolute payload ceiling, regardless of message kind (4 MiB)
pub const MAX_PAYLOAD_SIZE: usize = 4 * 1024 * 1024;

/// Default network magic ("MINI")
pub const MAGIC: [u8; 4] = [0x4D, 0x49, 0x4E, 0x49];
