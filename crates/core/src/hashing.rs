//! Shared SHA-256 hex digest utility.
//!
//! Used to fingerprint generated result blobs before they are persisted.

use sha2::{Digest, Sha256};

/// Compute a SHA-256 hex digest of the given bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    let hash = Sha256::digest(data);
    format!("{hash:x}")
}
