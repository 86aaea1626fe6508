//! Content fingerprints
//!
//! SHA-256, hex encoded. Used as cache keys, so the byte layout fed to the
//! hasher must stay stable across releases.

use sha2::{Digest, Sha256};

/// Hex SHA-256 of raw bytes
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Incremental hasher for structured content
///
/// Fields are fixed-width little-endian words, fed in call order.
#[derive(Default)]
pub struct ContentHasher {
    inner: Sha256,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u64(&mut self, value: u64) -> &mut Self {
        self.inner.update(value.to_le_bytes());
        self
    }

    pub fn finish(self) -> String {
        format!("{:x}", self.inner.finalize())
    }
}
