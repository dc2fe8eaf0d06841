//! Centralized module for cryptographic hashing algorithms.

use sha2::{Digest, Sha256, Sha512};

/// Computes the SHA-256 digest of the given data and returns it as a hex string.
pub fn sha256_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Computes the SHA-512 digest of the given data and returns it as a hex string.
pub fn sha512_digest(data: &[u8]) -> String {
    let mut hasher = Sha512::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Computes the MD5 digest of the given data. Only used for display and
/// lookup against external databases, never as an identity.
pub fn md5_digest(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// Computes the BLAKE3 digest of the given data and returns it as a hex string.
pub fn blake3_digest(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}
