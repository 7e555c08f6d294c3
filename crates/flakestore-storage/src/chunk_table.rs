//! Persistent chunk table: a header followed by fixed-width chunk records.
//!
//! Layout:
//! - Bytes 0..64: bincode-encoded [`ChunkTableHeader`], zero padded
//! - Bytes 64..: [`CHUNK_RECORD_SIZE`]-byte records, one per slot

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::chunk::{ChunkId, ChunkRecord, FlakeId, CHUNK_RECORD_SIZE};
use crate::data_file::DataFile;
use crate::error::{StorageError, StorageResult};
use crate::range::{IndexRangeSet, LongRange};

/// Chunk table magic: "FLKT" = 0x464C4B54
pub const CHUNK_TABLE_MAGIC: u32 = 0x464C4B54;
/// Current chunk table format version
pub const CHUNK_TABLE_VERSION: u8 = 1;
/// Bytes reserved for the header
pub const CHUNK_TABLE_HEADER_SIZE: u64 = 64;

/// Header of the chunk table file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkTableHeader {
    /// Magic number for identification
    pub magic: u32,
    /// Format version
    pub version: u8,
    /// Next flake identification to hand out
    pub next_flake_id: u64,
    /// Number of record slots in the file
    pub record_capacity: u64,
    /// CRC32 of the header with this field set to 0
    pub checksum: u32,
}

impl ChunkTableHeader {
    /// Header of an empty table.
    pub fn new() -> Self {
        let mut header = Self {
            magic: CHUNK_TABLE_MAGIC,
            version: CHUNK_TABLE_VERSION,
            next_flake_id: 1,
            record_capacity: 0,
            checksum: 0,
        };
        header.update_checksum();
        header
    }

    /// Computes the CRC32 of the header bytes (excluding the checksum).
    pub fn compute_checksum(&self) -> u32 {
        let mut unsealed = self.clone();
        unsealed.checksum = 0;
        let bytes = bincode::serialize(&unsealed).unwrap_or_default();
        crc32fast::hash(&bytes)
    }

    /// Recomputes and stores the checksum.
    pub fn update_checksum(&mut self) {
        self.checksum = self.compute_checksum();
    }

    /// Validates magic, version and checksum.
    pub fn validate(&self) -> StorageResult<()> {
        if self.magic != CHUNK_TABLE_MAGIC {
            return Err(StorageError::CorruptedChunkTable {
                reason: format!(
                    "invalid magic: expected {:#x}, got {:#x}",
                    CHUNK_TABLE_MAGIC, self.magic
                ),
            });
        }
        if self.version != CHUNK_TABLE_VERSION {
            return Err(StorageError::CorruptedChunkTable {
                reason: format!(
                    "unsupported version: expected {}, got {}",
                    CHUNK_TABLE_VERSION, self.version
                ),
            });
        }
        let computed = self.compute_checksum();
        if computed != self.checksum {
            return Err(StorageError::CorruptedChunkTable {
                reason: format!(
                    "checksum mismatch: expected {:#x}, got {:#x}",
                    self.checksum, computed
                ),
            });
        }
        Ok(())
    }

    /// Serializes the header, padded to [`CHUNK_TABLE_HEADER_SIZE`] bytes.
    pub fn to_bytes(&self) -> StorageResult<Vec<u8>> {
        let mut bytes = bincode::serialize(self).map_err(|e| StorageError::SerializationError {
            reason: e.to_string(),
        })?;
        if bytes.len() > CHUNK_TABLE_HEADER_SIZE as usize {
            return Err(StorageError::SerializationError {
                reason: format!("chunk table header too large: {} bytes", bytes.len()),
            });
        }
        bytes.resize(CHUNK_TABLE_HEADER_SIZE as usize, 0);
        Ok(bytes)
    }

    /// Deserializes and validates a header.
    pub fn from_bytes(bytes: &[u8]) -> StorageResult<Self> {
        let header: Self =
            bincode::deserialize(bytes).map_err(|e| StorageError::CorruptedChunkTable {
                reason: e.to_string(),
            })?;
        header.validate()?;
        Ok(header)
    }
}

impl Default for ChunkTableHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// The chunk table file with its free slot bookkeeping.
pub(crate) struct ChunkTable {
    file: DataFile,
    header: ChunkTableHeader,
    free_slots: IndexRangeSet,
    growth: u64,
}

impl ChunkTable {
    /// Opens the table and returns it with every live record it holds.
    pub(crate) fn open(path: &Path, growth: u64) -> StorageResult<(Self, Vec<ChunkRecord>)> {
        let file = DataFile::open(path)?;
        let mut table = Self {
            file,
            header: ChunkTableHeader::new(),
            free_slots: IndexRangeSet::new(),
            growth: growth.max(1),
        };

        if table.file.len() < CHUNK_TABLE_HEADER_SIZE {
            table.file.set_len(CHUNK_TABLE_HEADER_SIZE)?;
            table.write_header()?;
            return Ok((table, Vec::new()));
        }

        let mut header_bytes = vec![0u8; CHUNK_TABLE_HEADER_SIZE as usize];
        table.file.read_at(0, &mut header_bytes)?;
        table.header = ChunkTableHeader::from_bytes(&header_bytes)?;

        let on_disk = (table.file.len() - CHUNK_TABLE_HEADER_SIZE) / CHUNK_RECORD_SIZE as u64;
        if on_disk < table.header.record_capacity {
            warn!(
                on_disk,
                declared = table.header.record_capacity,
                "chunk table shorter than its header declares"
            );
            table.header.record_capacity = on_disk;
        }

        let mut records = Vec::new();
        let mut buffer = [0u8; CHUNK_RECORD_SIZE];
        for index in 0..table.header.record_capacity {
            table.file.read_at(Self::slot_position(index), &mut buffer)?;
            match ChunkRecord::decode(&buffer, index)? {
                Some(record) => records.push(record),
                None => {
                    table.free_slots.insert(index);
                }
            }
        }
        debug!(
            records = records.len(),
            free_slots = table.free_slots.free_count(),
            "loaded chunk table"
        );
        Ok((table, records))
    }

    fn slot_position(index: u64) -> u64 {
        CHUNK_TABLE_HEADER_SIZE + index * CHUNK_RECORD_SIZE as u64
    }

    fn write_header(&mut self) -> StorageResult<()> {
        self.header.update_checksum();
        let bytes = self.header.to_bytes()?;
        self.file.write_at(0, &bytes)
    }

    /// Hands out a fresh flake identification and persists the counter.
    pub(crate) fn next_flake_id(&mut self) -> StorageResult<FlakeId> {
        let id = FlakeId::new(self.header.next_flake_id);
        self.header.next_flake_id += 1;
        self.write_header()?;
        Ok(id)
    }

    /// Makes sure identifications up to `id` are never handed out again.
    pub(crate) fn reserve_flake_id(&mut self, id: FlakeId) -> StorageResult<()> {
        if id.get() >= self.header.next_flake_id {
            self.header.next_flake_id = id.get() + 1;
            self.write_header()?;
        }
        Ok(())
    }

    /// Takes a free slot, growing the table by one batch if none is left.
    pub(crate) fn allocate_slot(&mut self) -> StorageResult<ChunkId> {
        if let Some(index) = self.free_slots.pop_lowest() {
            return Ok(ChunkId::new(index));
        }
        let begin = self.header.record_capacity;
        let end = begin + self.growth;
        self.file.set_len(Self::slot_position(end))?;
        self.header.record_capacity = end;
        self.write_header()?;
        self.free_slots.insert_range(LongRange::new(begin + 1, end));
        debug!(begin, end, "grew chunk table");
        Ok(ChunkId::new(begin))
    }

    /// Persists `record` into its slot.
    pub(crate) fn write_record(&self, record: &ChunkRecord) -> StorageResult<()> {
        let mut buffer = [0u8; CHUNK_RECORD_SIZE];
        record.encode(&mut buffer)?;
        self.file
            .write_at(Self::slot_position(record.chunk.id.index()), &buffer)
    }

    /// Zeroes the slot of `chunk_id` and returns it to the free slots.
    pub(crate) fn release_slot(&mut self, chunk_id: ChunkId) -> StorageResult<()> {
        let index = chunk_id.index();
        if index >= self.header.record_capacity || self.free_slots.contains(index) {
            return Err(StorageError::DoubleFree { chunk_id });
        }
        self.file
            .write_at(Self::slot_position(index), &[0u8; CHUNK_RECORD_SIZE])?;
        self.free_slots.insert(index);
        Ok(())
    }

    /// Fault injection hooks of the table file.
    #[cfg(any(test, feature = "testing"))]
    pub(crate) fn faults(&self) -> &crate::data_file::FaultInjector {
        self.file.faults()
    }

    /// Number of free slots.
    pub(crate) fn free_slot_count(&self) -> u64 {
        self.free_slots.free_count()
    }

    pub(crate) fn sync(&mut self) -> StorageResult<()> {
        self.write_header()?;
        self.file.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Chunk;

    #[test]
    fn test_header_roundtrip() {
        let mut header = ChunkTableHeader::new();
        header.next_flake_id = 42;
        header.record_capacity = 1000;
        header.update_checksum();
        let bytes = header.to_bytes().unwrap();
        assert_eq!(bytes.len(), CHUNK_TABLE_HEADER_SIZE as usize);
        assert_eq!(ChunkTableHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn test_header_checksum_mismatch() {
        let mut header = ChunkTableHeader::new();
        header.next_flake_id = 9;
        let bytes = header.to_bytes().unwrap();
        assert!(matches!(
            ChunkTableHeader::from_bytes(&bytes),
            Err(StorageError::CorruptedChunkTable { .. })
        ));
    }

    #[test]
    fn test_header_bad_magic() {
        let mut header = ChunkTableHeader::new();
        header.magic = 0xDEAD;
        header.update_checksum();
        assert!(header.validate().is_err());
    }

    #[test]
    fn test_slots_reused_before_growth() {
        let dir = tempfile::tempdir().unwrap();
        let (mut table, records) = ChunkTable::open(&dir.path().join("chunks"), 4).unwrap();
        assert!(records.is_empty());

        let slots: Vec<_> = (0..4).map(|_| table.allocate_slot().unwrap()).collect();
        assert_eq!(slots, (0..4).map(ChunkId::new).collect::<Vec<_>>());
        assert_eq!(table.free_slot_count(), 0);

        table.release_slot(ChunkId::new(1)).unwrap();
        assert_eq!(table.allocate_slot().unwrap(), ChunkId::new(1));
        assert_eq!(table.allocate_slot().unwrap(), ChunkId::new(4));
        assert_eq!(table.free_slot_count(), 3);
    }

    #[test]
    fn test_release_twice_is_double_free() {
        let dir = tempfile::tempdir().unwrap();
        let (mut table, _) = ChunkTable::open(&dir.path().join("chunks"), 4).unwrap();
        let slot = table.allocate_slot().unwrap();
        table.release_slot(slot).unwrap();
        assert!(matches!(
            table.release_slot(slot),
            Err(StorageError::DoubleFree { .. })
        ));
    }

    #[test]
    fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chunks");
        let record = {
            let (mut table, _) = ChunkTable::open(&path, 8).unwrap();
            let owner = table.next_flake_id().unwrap();
            let slot = table.allocate_slot().unwrap();
            let record = ChunkRecord {
                owner,
                chunk: Chunk::new(slot, 4096, 8192),
                used: 100,
                sequence: 0,
            };
            table.write_record(&record).unwrap();
            table.sync().unwrap();
            record
        };

        let (mut table, records) = ChunkTable::open(&path, 8).unwrap();
        assert_eq!(records, vec![record]);
        assert_eq!(table.free_slot_count(), 7);
        assert_eq!(table.next_flake_id().unwrap(), FlakeId::new(2));
    }
}
