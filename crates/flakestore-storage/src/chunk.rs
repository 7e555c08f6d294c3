//! Core chunk and flake identity types for the storage subsystem.

use core::fmt;
use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};

/// Stable identification of a flake. Valid identifications start at 1,
/// so a persisted record owned by a flake is never all zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FlakeId(pub u64);

impl FlakeId {
    /// Creates a new FlakeId.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw identification.
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for FlakeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Flake({})", self.0)
    }
}

/// Identification of a chunk: its slot in the chunk table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkId(pub u64);

impl ChunkId {
    /// Creates a new ChunkId.
    pub fn new(index: u64) -> Self {
        Self(index)
    }

    /// Returns the chunk table slot.
    pub fn index(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Chunk({})", self.0)
    }
}

/// A contiguous physical region `[position, position + length)` of the data file.
/// Chunks are never shared between flakes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Chunk {
    /// Slot of this chunk in the chunk table.
    pub id: ChunkId,
    /// Byte offset of the chunk in the data file.
    pub position: u64,
    /// Length of the chunk in bytes.
    pub length: u64,
}

impl Chunk {
    /// Creates a new chunk descriptor.
    pub fn new(id: ChunkId, position: u64, length: u64) -> Self {
        Self {
            id,
            position,
            length,
        }
    }

    /// First byte after this chunk in the data file.
    pub fn end(&self) -> u64 {
        self.position + self.length
    }

    /// True if `other` starts exactly where this chunk ends.
    pub fn is_followed_by(&self, other: &Chunk) -> bool {
        self.end() == other.position
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}..{})", self.id, self.position, self.end())
    }
}

/// Width of a persisted chunk record in bytes.
pub const CHUNK_RECORD_SIZE: usize = 40;

const OWNER_POSITION: usize = 0;
const CHUNK_POSITION_POSITION: usize = 8;
const LENGTH_POSITION: usize = 16;
const USED_POSITION: usize = 24;
const SEQUENCE_POSITION: usize = 32;

/// Persisted form of a chunk in the chunk table.
///
/// Layout (big-endian):
/// `[0:8) owner, [8:16) position, [16:24) length, [24:32) used, [32:40) sequence`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRecord {
    /// Flake owning the chunk.
    pub owner: FlakeId,
    /// The chunk itself.
    pub chunk: Chunk,
    /// Bytes of the chunk that belong to the flake's logical content.
    pub used: u64,
    /// Position of the chunk in its flake's chunk list.
    pub sequence: u64,
}

impl ChunkRecord {
    /// Encodes the record into `buffer`, which must be exactly [`CHUNK_RECORD_SIZE`] bytes.
    pub fn encode(&self, buffer: &mut [u8]) -> StorageResult<()> {
        if buffer.len() != CHUNK_RECORD_SIZE {
            return Err(StorageError::Decode {
                expected: CHUNK_RECORD_SIZE,
                actual: buffer.len(),
            });
        }
        put_u64(buffer, OWNER_POSITION, self.owner.get());
        put_u64(buffer, CHUNK_POSITION_POSITION, self.chunk.position);
        put_u64(buffer, LENGTH_POSITION, self.chunk.length);
        put_u64(buffer, USED_POSITION, self.used);
        put_u64(buffer, SEQUENCE_POSITION, self.sequence);
        Ok(())
    }

    /// Decodes a record stored in slot `index`. Returns `None` for a free (all zero) slot.
    pub fn decode(buffer: &[u8], index: u64) -> StorageResult<Option<Self>> {
        if buffer.len() != CHUNK_RECORD_SIZE {
            return Err(StorageError::Decode {
                expected: CHUNK_RECORD_SIZE,
                actual: buffer.len(),
            });
        }
        let owner = get_u64(buffer, OWNER_POSITION);
        if owner == 0 {
            return Ok(None);
        }
        Ok(Some(Self {
            owner: FlakeId::new(owner),
            chunk: Chunk::new(
                ChunkId::new(index),
                get_u64(buffer, CHUNK_POSITION_POSITION),
                get_u64(buffer, LENGTH_POSITION),
            ),
            used: get_u64(buffer, USED_POSITION),
            sequence: get_u64(buffer, SEQUENCE_POSITION),
        }))
    }
}

pub(crate) fn put_u64(buffer: &mut [u8], at: usize, value: u64) {
    buffer[at..at + 8].copy_from_slice(&value.to_be_bytes());
}

pub(crate) fn get_u64(buffer: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buffer[at..at + 8]);
    u64::from_be_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_end_and_adjacency() {
        let a = Chunk::new(ChunkId::new(0), 0, 4096);
        let b = Chunk::new(ChunkId::new(1), 4096, 100);
        let c = Chunk::new(ChunkId::new(2), 8192, 100);
        assert_eq!(a.end(), 4096);
        assert!(a.is_followed_by(&b));
        assert!(!b.is_followed_by(&c));
    }

    #[test]
    fn test_display_impls() {
        assert_eq!(format!("{}", FlakeId::new(3)), "Flake(3)");
        assert_eq!(format!("{}", ChunkId::new(9)), "Chunk(9)");
        let chunk = Chunk::new(ChunkId::new(1), 10, 5);
        assert_eq!(format!("{}", chunk), "Chunk(1)[10..15)");
    }

    #[test]
    fn test_record_encode_decode() {
        let record = ChunkRecord {
            owner: FlakeId::new(u64::MAX),
            chunk: Chunk::new(ChunkId::new(5), 8192, 4096),
            used: 17,
            sequence: 2,
        };
        let mut buffer = [0u8; CHUNK_RECORD_SIZE];
        record.encode(&mut buffer).unwrap();
        let decoded = ChunkRecord::decode(&buffer, 5).unwrap().unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_zero_record_is_free() {
        let buffer = [0u8; CHUNK_RECORD_SIZE];
        assert!(ChunkRecord::decode(&buffer, 0).unwrap().is_none());
    }

    #[test]
    fn test_wrong_width_rejected() {
        let buffer = [0u8; CHUNK_RECORD_SIZE - 1];
        let err = ChunkRecord::decode(&buffer, 0).unwrap_err();
        assert!(matches!(
            err,
            StorageError::Decode {
                expected: CHUNK_RECORD_SIZE,
                actual: 39
            }
        ));
    }
}
