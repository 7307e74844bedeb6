//! URL Hashing
//!
//! Stable short digests used to name per-task work directories.

use sha2::{Digest, Sha256};

/// Number of hex characters kept from the digest
const SHORT_HASH_LEN: usize = 8;

/// First 8 hex characters of the SHA-256 digest of `input`
pub fn short_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(digest)[..SHORT_HASH_LEN].to_string()
}
