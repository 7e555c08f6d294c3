//! Content fingerprints of deduplication blocks

use serde::{Deserialize, Serialize};

/// A 32-byte BLAKE3 hash of a block's content. Equal hashes only nominate
/// candidates; equality is confirmed on the stored bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockHash(pub [u8; 32]);

impl BlockHash {
    /// Return the hash as a lowercase hex string
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
    /// Return the raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for BlockHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Compute the BLAKE3 hash of data
pub fn block_hash(data: &[u8]) -> BlockHash {
    BlockHash(*blake3::hash(data).as_bytes())
}
