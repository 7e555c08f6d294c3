//! Chunk memory: carves chunks out of the single data file.
//!
//! Free space is kept as merged byte extents and reused first fit before the
//! data file grows. Growth happens in batches sized by the configured increase
//! rate so appends do not resize the file byte by byte. Every chunk occupies a
//! slot in the persistent chunk table once it is saved for its owner.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::chunk::{Chunk, ChunkId, ChunkRecord, FlakeId};
use crate::chunk_table::ChunkTable;
use crate::config::StorageConfig;
use crate::data_file::DataFile;
#[cfg(any(test, feature = "testing"))]
use crate::data_file::FaultInjector;
use crate::error::{StorageError, StorageResult};
use crate::range::{IndexRangeSet, LongRange};

/// Placement of a chunk inside its owning flake, persisted with the chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkUsage {
    /// Bytes of the chunk holding flake content.
    pub used: u64,
    /// Position of the chunk in the flake's chunk list.
    pub sequence: u64,
}

/// Operations higher layers need from chunk memory.
pub trait ChunkStore: Send + Sync {
    /// Returns the chunk's physical space to the free pool.
    /// Deleting a chunk twice is a [`StorageError::DoubleFree`].
    fn delete_chunk(&self, chunk: &Chunk) -> StorageResult<()>;

    /// Persists `chunk` as belonging to `owner`.
    fn save_chunk(&self, owner: FlakeId, chunk: &Chunk, usage: ChunkUsage) -> StorageResult<()>;
}

#[derive(Debug, Clone, Copy)]
struct ChunkEntry {
    owner: Option<FlakeId>,
    chunk: Chunk,
}

struct ChunkMemoryInner {
    table: ChunkTable,
    live: HashMap<ChunkId, ChunkEntry>,
    free_extents: IndexRangeSet,
    total_allocations: u64,
    total_frees: u64,
}

/// Allocator for chunks of the data file. Thread-safe via internal mutex.
pub struct ChunkMemory {
    config: StorageConfig,
    data_file: DataFile,
    clear_buffer: Vec<u8>,
    inner: Mutex<ChunkMemoryInner>,
}

impl ChunkMemory {
    /// Opens the data file and chunk table named by `config`.
    /// Returns the memory together with every persisted chunk record.
    pub fn open(config: StorageConfig) -> StorageResult<(Self, Vec<ChunkRecord>)> {
        config.validate()?;
        let data_file = DataFile::open(&config.data_file_path)?;
        let (table, records) = ChunkTable::open(
            &config.chunk_table_file_path,
            config.maximum_chunk_data_table_size as u64,
        )?;

        let mut sorted: Vec<Chunk> = records.iter().map(|r| r.chunk).collect();
        sorted.sort_by_key(|c| c.position);
        let mut free_extents = IndexRangeSet::new();
        let mut cursor = 0u64;
        for chunk in &sorted {
            if chunk.position < cursor || chunk.end() > data_file.len() {
                return Err(StorageError::CorruptedChunkTable {
                    reason: format!(
                        "{} overlaps another chunk or the end of the data file",
                        chunk
                    ),
                });
            }
            free_extents.insert_range(LongRange::new(cursor, chunk.position));
            cursor = chunk.end();
        }
        free_extents.insert_range(LongRange::new(cursor, data_file.len()));

        let live = records
            .iter()
            .map(|r| {
                (
                    r.chunk.id,
                    ChunkEntry {
                        owner: Some(r.owner),
                        chunk: r.chunk,
                    },
                )
            })
            .collect();

        info!(
            data_file = %config.data_file_path.display(),
            chunks = records.len(),
            free_bytes = free_extents.free_count(),
            "opened chunk memory"
        );

        let clear_buffer = vec![0u8; config.clear_array_size as usize];
        Ok((
            Self {
                config,
                data_file,
                clear_buffer,
                inner: Mutex::new(ChunkMemoryInner {
                    table,
                    live,
                    free_extents,
                    total_allocations: 0,
                    total_frees: 0,
                }),
            },
            records,
        ))
    }

    /// The configuration this memory was opened with.
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Fault injection hooks of the data file.
    #[cfg(any(test, feature = "testing"))]
    pub fn faults(&self) -> &FaultInjector {
        self.data_file.faults()
    }

    /// Runs `f` with the fault injection hooks of the chunk table file.
    #[cfg(any(test, feature = "testing"))]
    pub fn with_table_faults<T>(&self, f: impl FnOnce(&FaultInjector) -> T) -> T {
        f(self.inner.lock().table.faults())
    }

    /// Allocates a chunk of at least `min_length` bytes (and at least the
    /// configured minimum chunk size). The chunk has no owner until saved.
    pub fn allocate_chunk(&self, min_length: u64) -> StorageResult<Chunk> {
        let length = min_length.max(self.config.minimum_chunk_size);
        let mut inner = self.inner.lock();

        let position = match inner.free_extents.allocate_first_fit(length) {
            Some(position) => position,
            None => {
                self.grow(&mut inner, length)?;
                inner.free_extents.allocate_first_fit(length).ok_or_else(|| {
                    StorageError::RangeAccounting(format!(
                        "no extent of {} bytes after growing the data file",
                        length
                    ))
                })?
            }
        };

        let id = match inner.table.allocate_slot() {
            Ok(id) => id,
            Err(e) => {
                inner
                    .free_extents
                    .insert_range(LongRange::new(position, position + length));
                return Err(e);
            }
        };
        let chunk = Chunk::new(id, position, length);
        inner.live.insert(id, ChunkEntry { owner: None, chunk });
        inner.total_allocations += 1;
        debug!(%chunk, "allocated chunk");
        Ok(chunk)
    }

    fn grow(&self, inner: &mut ChunkMemoryInner, needed: u64) -> StorageResult<()> {
        let file_length = self.data_file.len();
        let tail_free = inner
            .free_extents
            .last()
            .filter(|r| r.end == file_length)
            .map(|r| r.len())
            .unwrap_or(0);
        let missing = needed - tail_free.min(needed);
        let by_rate = (file_length as f64 * self.config.data_file_increase_rate) as u64;
        let mut growth = missing
            .max(by_rate)
            .max(self.config.minimum_chunk_size);

        let free_after = inner.free_extents.free_count() + growth - needed;
        if free_after < self.config.preferred_available_storage_size {
            growth += self.config.preferred_available_storage_size - free_after;
        }

        let new_length = file_length + growth;
        self.data_file.set_len(new_length)?;
        inner
            .free_extents
            .insert_range(LongRange::new(file_length, new_length));
        info!(from = file_length, to = new_length, "grew data file");
        Ok(())
    }

    /// Returns the tail of `chunk` beyond `new_length` to the free pool.
    pub fn shrink_chunk(&self, chunk: &Chunk, new_length: u64) -> StorageResult<Chunk> {
        if new_length == 0 || new_length > chunk.length {
            return Err(StorageError::RangeAccounting(format!(
                "cannot shrink {} to {} bytes",
                chunk, new_length
            )));
        }
        if new_length == chunk.length {
            return Ok(*chunk);
        }
        let mut inner = self.inner.lock();
        let entry = inner
            .live
            .get_mut(&chunk.id)
            .ok_or(StorageError::ChunkNotFound { chunk_id: chunk.id })?;
        let shrunk = Chunk::new(chunk.id, chunk.position, new_length);
        entry.chunk = shrunk;
        if !inner
            .free_extents
            .insert_range(LongRange::new(shrunk.end(), chunk.end()))
        {
            return Err(StorageError::RangeAccounting(format!(
                "tail of {} is already free",
                chunk
            )));
        }
        debug!(from = %chunk, to = %shrunk, "shrunk chunk");
        Ok(shrunk)
    }

    /// Merges `second` into `first`; the two must be physically adjacent.
    /// The slot of `second` is released. The caller saves the returned chunk.
    pub fn merge_chunks(&self, first: &Chunk, second: &Chunk) -> StorageResult<Chunk> {
        if !first.is_followed_by(second) {
            return Err(StorageError::RangeAccounting(format!(
                "{} and {} are not adjacent",
                first, second
            )));
        }
        let mut inner = self.inner.lock();
        let owner = inner.live.get(&first.id).and_then(|e| e.owner);
        let second_owner = inner.live.get(&second.id).and_then(|e| e.owner);
        if owner != second_owner {
            return Err(StorageError::RangeAccounting(format!(
                "{} and {} belong to different flakes",
                first, second
            )));
        }
        inner
            .live
            .remove(&second.id)
            .ok_or(StorageError::ChunkNotFound {
                chunk_id: second.id,
            })?;
        inner.table.release_slot(second.id)?;
        let merged = Chunk::new(first.id, first.position, first.length + second.length);
        inner
            .live
            .get_mut(&first.id)
            .ok_or(StorageError::ChunkNotFound { chunk_id: first.id })?
            .chunk = merged;
        debug!(%merged, "merged adjacent chunks");
        Ok(merged)
    }

    /// Reads `buffer.len()` bytes at `offset` inside `chunk`.
    pub fn read(&self, chunk: &Chunk, offset: u64, buffer: &mut [u8]) -> StorageResult<()> {
        debug_assert!(offset + buffer.len() as u64 <= chunk.length);
        self.data_file.read_at(chunk.position + offset, buffer)
    }

    /// Writes `buffer` at `offset` inside `chunk`.
    pub fn write(&self, chunk: &Chunk, offset: u64, buffer: &[u8]) -> StorageResult<()> {
        debug_assert!(offset + buffer.len() as u64 <= chunk.length);
        self.data_file.write_at(chunk.position + offset, buffer)
    }

    /// Zeroes `length` bytes at `offset` inside `chunk`.
    pub fn clear(&self, chunk: &Chunk, offset: u64, length: u64) -> StorageResult<()> {
        debug_assert!(offset + length <= chunk.length);
        self.data_file
            .clear(chunk.position + offset, length, &self.clear_buffer)
    }

    /// Copies `length` bytes from one chunk to another through a buffer of
    /// `buffer_size` bytes.
    pub fn transfer(
        &self,
        from: (&Chunk, u64),
        to: (&Chunk, u64),
        length: u64,
        buffer_size: usize,
    ) -> StorageResult<()> {
        let mut buffer = vec![0u8; buffer_size.max(1)];
        let mut done = 0u64;
        while done < length {
            let step = (length - done).min(buffer.len() as u64) as usize;
            self.read(from.0, from.1 + done, &mut buffer[..step])?;
            self.write(to.0, to.1 + done, &buffer[..step])?;
            done += step as u64;
        }
        Ok(())
    }

    /// Hands out a fresh flake identification.
    pub fn next_flake_id(&self) -> StorageResult<FlakeId> {
        self.inner.lock().table.next_flake_id()
    }

    /// Makes sure `id` is never handed out by [`ChunkMemory::next_flake_id`].
    pub fn reserve_flake_id(&self, id: FlakeId) -> StorageResult<()> {
        self.inner.lock().table.reserve_flake_id(id)
    }

    /// Every chunk saved for `owner`, in table order.
    pub fn chunks_of(&self, owner: FlakeId) -> Vec<Chunk> {
        let inner = self.inner.lock();
        let mut chunks: Vec<Chunk> = inner
            .live
            .values()
            .filter(|e| e.owner == Some(owner))
            .map(|e| e.chunk)
            .collect();
        chunks.sort_by_key(|c| c.id);
        chunks
    }

    /// Every allocated chunk with its owner, if it has been saved yet.
    pub fn live_chunks(&self) -> Vec<(Option<FlakeId>, Chunk)> {
        let inner = self.inner.lock();
        let mut chunks: Vec<_> = inner.live.values().map(|e| (e.owner, e.chunk)).collect();
        chunks.sort_by_key(|(_, c)| c.id);
        chunks
    }

    /// Shrinks the data file when its tail is free, keeping the preferred
    /// amount of available storage. Returns the number of bytes released.
    pub fn trim_data_file(&self) -> StorageResult<u64> {
        let mut inner = self.inner.lock();
        let file_length = self.data_file.len();
        let Some(tail) = inner.free_extents.last().filter(|r| r.end == file_length) else {
            return Ok(0);
        };
        let keep = tail.len().min(self.config.preferred_available_storage_size);
        let new_length = tail.begin + keep;
        if new_length == file_length {
            return Ok(0);
        }
        self.data_file.set_len(new_length)?;
        inner.free_extents.truncate(new_length);
        info!(from = file_length, to = new_length, "trimmed data file");
        Ok(file_length - new_length)
    }

    /// Returns current allocation statistics.
    pub fn stats(&self) -> ChunkMemoryStats {
        let inner = self.inner.lock();
        ChunkMemoryStats {
            data_file_bytes: self.data_file.len(),
            free_bytes: inner.free_extents.free_count(),
            allocated_bytes: inner.live.values().map(|e| e.chunk.length).sum(),
            chunk_count: inner.live.len(),
            free_extent_count: inner.free_extents.range_count(),
            free_chunk_slots: inner.table.free_slot_count(),
            total_allocations: inner.total_allocations,
            total_frees: inner.total_frees,
        }
    }

    /// Flushes the chunk table and data file to disk.
    pub fn sync(&self) -> StorageResult<()> {
        self.inner.lock().table.sync()?;
        self.data_file.sync()
    }
}

impl ChunkStore for ChunkMemory {
    fn delete_chunk(&self, chunk: &Chunk) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        let entry = *inner
            .live
            .get(&chunk.id)
            .ok_or(StorageError::DoubleFree { chunk_id: chunk.id })?;
        inner.table.release_slot(chunk.id)?;
        inner.live.remove(&chunk.id);
        let extent = LongRange::new(entry.chunk.position, entry.chunk.end());
        if !inner.free_extents.insert_range(extent) {
            return Err(StorageError::RangeAccounting(format!(
                "space of {} was already free",
                entry.chunk
            )));
        }
        inner.total_frees += 1;
        debug!(chunk = %entry.chunk, "deleted chunk");
        Ok(())
    }

    fn save_chunk(&self, owner: FlakeId, chunk: &Chunk, usage: ChunkUsage) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        let entry = inner
            .live
            .get_mut(&chunk.id)
            .ok_or(StorageError::ChunkNotFound { chunk_id: chunk.id })?;
        if entry.chunk != *chunk {
            return Err(StorageError::RangeAccounting(format!(
                "{} does not match the registered {}",
                chunk, entry.chunk
            )));
        }
        if let Some(previous) = entry.owner.filter(|o| *o != owner) {
            return Err(StorageError::RangeAccounting(format!(
                "{} is owned by {}, not {}",
                chunk, previous, owner
            )));
        }
        entry.owner = Some(owner);
        inner.table.write_record(&ChunkRecord {
            owner,
            chunk: *chunk,
            used: usage.used,
            sequence: usage.sequence,
        })
    }
}

/// Statistics about chunk memory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkMemoryStats {
    /// Physical length of the data file
    pub data_file_bytes: u64,
    /// Bytes of the data file not covered by any chunk
    pub free_bytes: u64,
    /// Bytes covered by chunks
    pub allocated_bytes: u64,
    /// Number of allocated chunks
    pub chunk_count: usize,
    /// Number of disjoint free extents
    pub free_extent_count: usize,
    /// Free slots in the chunk table
    pub free_chunk_slots: u64,
    /// Chunks allocated since open
    pub total_allocations: u64,
    /// Chunks deleted since open
    pub total_frees: u64,
}
