//! SHA-256 hex digests.
//!
//! The cache derives filesystem-safe names from arbitrary resource keys
//! with this, and demo handlers use it for content checksums.

use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 digest of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    format!("{digest:x}")
}
