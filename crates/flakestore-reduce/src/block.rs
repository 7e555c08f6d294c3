//! Fixed-size content blocks and their table records.
//!
//! A deduplicated file stores one [`REFERENCE_SIZE`]-byte big-endian table
//! index per full block, followed by the raw bytes of the final partial block.

use flakestore_fs::{check_width, FixedRecord, FsError, FsResult};

use crate::error::{ReduceError, ReduceResult};
use crate::fingerprint::{block_hash, BlockHash};

/// Width of one block reference in deduplicated content.
pub const REFERENCE_SIZE: usize = 8;

const LIVE_TAG: u8 = 0x01;

/// One block of file content, compared by value.
#[derive(Clone, PartialEq, Eq)]
pub struct DeduplicationBlock {
    data: Box<[u8]>,
}

impl std::fmt::Debug for DeduplicationBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeduplicationBlock")
            .field("hash", &self.hash())
            .finish()
    }
}

impl DeduplicationBlock {
    /// Block size in bytes.
    pub const SIZE: usize = 4096;

    /// Copies a block out of `data`, which must be exactly [`Self::SIZE`] bytes.
    pub fn from_slice(data: &[u8]) -> ReduceResult<Self> {
        if data.len() != Self::SIZE {
            return Err(ReduceError::BlockSize {
                expected: Self::SIZE,
                actual: data.len(),
            });
        }
        Ok(Self { data: data.into() })
    }

    /// The block content.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Fingerprint of the content.
    pub fn hash(&self) -> BlockHash {
        block_hash(&self.data)
    }
}

/// Encodes a table index as a block reference.
pub fn encode_reference(index: u64) -> [u8; REFERENCE_SIZE] {
    index.to_be_bytes()
}

/// Decodes a block reference.
pub fn decode_reference(bytes: [u8; REFERENCE_SIZE]) -> u64 {
    u64::from_be_bytes(bytes)
}

/// A stored block: `[0]` live tag, `[1..]` block bytes.
///
/// The tag keeps an all-zero content block from encoding to an all-zero
/// record, which the table would read as a free slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRecord {
    /// Slot of the block in the deduplication table.
    pub index: u64,
    /// The stored block.
    pub block: DeduplicationBlock,
}

impl FixedRecord for BlockRecord {
    const SIZE: usize = DeduplicationBlock::SIZE + 1;

    fn index(&self) -> u64 {
        self.index
    }

    fn encode(&self, buffer: &mut [u8]) {
        buffer[0] = LIVE_TAG;
        buffer[1..].copy_from_slice(self.block.as_bytes());
    }

    fn decode(index: u64, buffer: &[u8]) -> FsResult<Self> {
        check_width(Self::SIZE, buffer)?;
        if buffer[0] != LIVE_TAG {
            return Err(FsError::InvalidAttribute {
                reason: format!("block record {} has tag {:#04x}", index, buffer[0]),
            });
        }
        Ok(Self {
            index,
            block: DeduplicationBlock {
                data: buffer[1..].into(),
            },
        })
    }
}
