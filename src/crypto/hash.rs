//! SHA-256 based hashing for the wire protocol
//!
//! Provides the double SHA-256 digest used to checksum message payloads.

use sha2::{Digest, Sha256};

/// Computes SHA-256 hash of the input data
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Computes double SHA-256 hash (SHA-256 of SHA-256)
/// Used for message checksums in Bitcoin-style protocols
pub fn double_sha256(data: &[u8]) -> [u8; 32] {
    sha256(&sha256(data))
}

/// Computes the 4-byte wire checksum of a message payload:
/// the first four bytes of the double SHA-256 digest.
pub fn payload_checksum(payload: &[u8]) -> [u8; 4] {
    let digest = double_sha256(payload);
    [digest[0], digest[1], digest[2], digest[3]]
}
