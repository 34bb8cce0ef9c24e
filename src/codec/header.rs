//! Fixed 24-byte wire message header
//!
//! Layout: `magic:4 | command:12 (ASCII, NUL-padded) | length:4 LE | checksum:4`

use crate::codec::catalog::MessageKind;
use crate::codec::message::RejectReason;
use crate::codec::serialize::{ByteReader, ByteWriter, CodecError, Serializable};

/// Encoded header size in bytes
pub const HEADER_SIZE: usize = 24;

/// Width of the command field
pub const COMMAND_SIZE: usize = 12;

/// The fixed message header preceding every payload.
///
/// The command field is either all-NUL (pristine) or a printable ASCII run
/// followed only by NUL padding; [`MessageHeader::set_kind`] may only be
/// called while the field is still pristine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub magic: [u8; 4],
    command: [u8; COMMAND_SIZE],
    pub length: u32,
    pub checksum: [u8; 4],
}

impl Default for MessageHeader {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageHeader {
    /// A pristine header: all fields zero
    pub fn new() -> Self {
        Self {
            magic: [0; 4],
            command: [0; COMMAND_SIZE],
            length: 0,
            checksum: [0; 4],
        }
    }

    /// Stamp the command field with a kind's label.
    ///
    /// Panics if the command field has already been written; a header is
    /// stamped exactly once.
    pub fn set_kind(&mut self, kind: MessageKind) {
        assert!(
            self.command.iter().all(|&b| b == 0),
            "set_kind on a non-pristine header"
        );
        assert!(kind != MessageKind::Unknown, "cannot stamp Unknown");
        let label = kind.label().as_bytes();
        self.command[..label.len()].copy_from_slice(label);
    }

    /// Raw command field bytes
    pub fn command_bytes(&self) -> &[u8; COMMAND_SIZE] {
        &self.command
    }

    /// Extract the command label, enforcing the field's shape.
    ///
    /// The field must be a printable ASCII run (0x20–0x7E) followed only by
    /// NUL padding. A non-printable byte before the padding or a non-NUL
    /// byte inside it is malformed; an all-NUL field is empty.
    pub fn command_label(&self) -> Result<&[u8], RejectReason> {
        let label_len = self
            .command
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(COMMAND_SIZE);
        if label_len == 0 {
            return Err(RejectReason::EmptyCommand);
        }
        if !self.command[..label_len]
            .iter()
            .all(|&b| (0x20..=0x7E).contains(&b))
        {
            return Err(RejectReason::MalformedCommand);
        }
        if self.command[label_len..].iter().any(|&b| b != 0) {
            return Err(RejectReason::MalformedCommand);
        }
        Ok(&self.command[..label_len])
    }

    /// Resolve the command label against the catalog
    pub fn kind(&self) -> Result<MessageKind, RejectReason> {
        let label = self.command_label()?;
        match MessageKind::from_label(label) {
            MessageKind::Unknown => Err(RejectReason::UnknownCommand(
                String::from_utf8_lossy(label).into_owned(),
            )),
            kind => Ok(kind),
        }
    }
}

impl Serializable for MessageHeader {
    fn serialize(&self, w: &mut ByteWriter) {
        w.write_bytes(&self.magic);
        w.write_bytes(&self.command);
        w.write_u32(self.length);
        w.write_bytes(&self.checksum);
    }

    fn deserialize(r: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            magic: r.read_array()?,
            command: r.read_array()?,
            length: r.read_u32()?,
            checksum: r.read_array()?,
        })
    }
}
