//! Wire serialization primitives
//!
//! Low-level building blocks shared by every wire structure:
//! - `ByteReader` / `ByteWriter`: bounds-checked cursor over raw bytes
//! - `Serializable`: encode/decode trait implemented by all wire types
//! - Compact size: Bitcoin-style variable-width length encoding

use bytes::{BufMut, BytesMut};
use thiserror::Error;

/// Largest value a range-checked compact size may decode to (32 MiB).
/// Applies in vector-length contexts; generic integer reads are unchecked.
pub const MAX_COMPACT_SIZE: u64 = 32 * 1024 * 1024;

/// Errors produced by the serialization primitives
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("read of {wanted} bytes overruns buffer ({remaining} remaining)")]
    UnexpectedEnd { wanted: usize, remaining: usize },
    #[error("compact size uses a longer encoding than its value requires")]
    NonCanonicalCompactSize,
    #[error("compact size {0} exceeds maximum {MAX_COMPACT_SIZE}")]
    CompactSizeTooBig(u64),
    #[error("invalid value for {0}")]
    InvalidValue(&'static str),
}

// =============================================================================
// Cursor reader / writer
// =============================================================================

/// Bounds-checked cursor over a byte slice.
///
/// Every read either returns the requested bytes or fails with
/// [`CodecError::UnexpectedEnd`]; no read ever goes past the end.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes not yet consumed
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// True once every byte has been consumed
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Consume `n` bytes and return them as a slice
    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if n > self.remaining() {
            return Err(CodecError::UnexpectedEnd {
                wanted: n,
                remaining: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Consume `N` bytes into a fixed array
    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    /// Big-endian u16 (ports in network addresses)
    pub fn read_u16_be(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_be_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64, CodecError> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32, CodecError> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64, CodecError> {
        Ok(i64::from_le_bytes(self.read_array()?))
    }
}

/// Growable output buffer for wire encoding
#[derive(Debug, Default)]
pub struct ByteWriter {
    buf: BytesMut,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.put_u16_le(v);
    }

    /// Big-endian u16 (ports in network addresses)
    pub fn write_u16_be(&mut self, v: u16) {
        self.buf.put_u16(v);
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.put_u64_le(v);
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.put_i32_le(v);
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.put_i64_le(v);
    }

    /// Take the encoded bytes out of the writer
    pub fn into_vec(self) -> Vec<u8> {
        self.buf.to_vec()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

// =============================================================================
// Serializable trait
// =============================================================================

/// Implemented by every structure that crosses the wire.
///
/// Encoding is infallible (writers grow as needed); decoding is
/// bounds-checked and returns a typed error.
pub trait Serializable: Sized {
    fn serialize(&self, w: &mut ByteWriter);
    fn deserialize(r: &mut ByteReader<'_>) -> Result<Self, CodecError>;

    /// Convenience: encode into a fresh byte vector
    fn to_bytes(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        self.serialize(&mut w);
        w.into_vec()
    }
}

impl Serializable for u8 {
    fn serialize(&self, w: &mut ByteWriter) {
        w.write_u8(*self);
    }
    fn deserialize(r: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        r.read_u8()
    }
}

impl Serializable for u16 {
    fn serialize(&self, w: &mut ByteWriter) {
        w.write_u16(*self);
    }
    fn deserialize(r: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        r.read_u16()
    }
}

impl Serializable for u32 {
    fn serialize(&self, w: &mut ByteWriter) {
        w.write_u32(*self);
    }
    fn deserialize(r: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        r.read_u32()
    }
}

impl Serializable for u64 {
    fn serialize(&self, w: &mut ByteWriter) {
        w.write_u64(*self);
    }
    fn deserialize(r: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        r.read_u64()
    }
}

impl<const N: usize> Serializable for [u8; N] {
    fn serialize(&self, w: &mut ByteWriter) {
        w.write_bytes(self);
    }
    fn deserialize(r: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        r.read_array()
    }
}

// =============================================================================
// Compact size
// =============================================================================

/// Encode a compact size using the minimal of the four prefix forms
pub fn write_compact_size(w: &mut ByteWriter, v: u64) {
    if v < 0xFD {
        w.write_u8(v as u8);
    } else if v <= 0xFFFF {
        w.write_u8(0xFD);
        w.write_u16(v as u16);
    } else if v <= 0xFFFF_FFFF {
        w.write_u8(0xFE);
        w.write_u32(v as u32);
    } else {
        w.write_u8(0xFF);
        w.write_u64(v);
    }
}

/// Decode a compact size.
///
/// Non-minimal encodings are rejected as [`CodecError::NonCanonicalCompactSize`].
/// With `range_check` set (vector-length contexts) values above
/// [`MAX_COMPACT_SIZE`] are rejected; without it any canonical u64 is accepted.
pub fn read_compact_size(r: &mut ByteReader<'_>, range_check: bool) -> Result<u64, CodecError> {
    let prefix = r.read_u8()?;
    let value = match prefix {
        0xFD => {
            let v = r.read_u16()? as u64;
            if v < 0xFD {
                return Err(CodecError::NonCanonicalCompactSize);
            }
            v
        }
        0xFE => {
            let v = r.read_u32()? as u64;
            if v <= 0xFFFF {
                return Err(CodecError::NonCanonicalCompactSize);
            }
            v
        }
        0xFF => {
            let v = r.read_u64()?;
            if v <= 0xFFFF_FFFF {
                return Err(CodecError::NonCanonicalCompactSize);
            }
            v
        }
        small => small as u64,
    };
    if range_check && value > MAX_COMPACT_SIZE {
        return Err(CodecError::CompactSizeTooBig(value));
    }
    Ok(value)
}

/// Number of bytes the compact encoding of `v` occupies
pub fn compact_size_len(v: u64) -> usize {
    if v < 0xFD {
        1
    } else if v <= 0xFFFF {
        3
    } else if v <= 0xFFFF_FFFF {
        5
    } else {
        9
    }
}
