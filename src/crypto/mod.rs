//! Cryptographic primitives consumed by the networking core
//!
//! Only the hashing surface needed for wire checksums lives here;
//! signatures and address derivation belong to other subsystems.

pub mod hash;

pub use hash::{double_sha256, payload_checksum, sha256};
