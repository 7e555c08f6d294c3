//! Flakes: logical byte streams laid over an ordered list of chunks.
//!
//! The logical space of a flake is the concatenation of its chunks. Bytes
//! between the logical length and the total chunk capacity are spare room for
//! appends. Every chunk record carries how many of its bytes hold content and
//! its place in the list, so a flake can be rebuilt from the chunk table alone.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::chunk::{Chunk, ChunkRecord, FlakeId};
use crate::chunk_memory::{ChunkMemory, ChunkStore, ChunkUsage};
use crate::error::{StorageError, StorageResult};
use crate::pointer::DataPointer;
use crate::stream::{FlakeInputStream, FlakeOutputStream};

/// Positioned writes through a [`DataPointer`]. Each write advances the pointer
/// past the written bytes and grows the flake when needed.
pub trait WriteAt {
    /// Writes one byte at the pointer.
    fn write_byte(&self, pointer: &mut DataPointer, byte: u8) -> StorageResult<()>;

    /// Writes all of `buffer` at the pointer.
    fn write(&self, pointer: &mut DataPointer, buffer: &[u8]) -> StorageResult<()>;

    /// Writes `length` bytes of `buffer` starting at `offset`.
    fn write_range(
        &self,
        pointer: &mut DataPointer,
        buffer: &[u8],
        offset: usize,
        length: usize,
    ) -> StorageResult<()> {
        let end = offset
            .checked_add(length)
            .filter(|&end| end <= buffer.len())
            .ok_or(StorageError::Decode {
                expected: offset.saturating_add(length),
                actual: buffer.len(),
            })?;
        self.write(pointer, &buffer[offset..end])
    }
}

#[derive(Debug, Clone, Copy)]
struct Segment {
    chunk: Chunk,
    offset: u64,
    len: u64,
    logical: u64,
}

#[derive(Debug, Default)]
struct FlakeState {
    chunks: Vec<Chunk>,
    /// Logical offset of each chunk.
    starts: Vec<u64>,
    capacity: u64,
    length: u64,
    deleted: bool,
}

impl FlakeState {
    fn push(&mut self, chunk: Chunk) {
        self.starts.push(self.capacity);
        self.capacity += chunk.length;
        self.chunks.push(chunk);
    }

    fn replace_all(&mut self, chunk: Chunk) {
        self.chunks.clear();
        self.starts.clear();
        self.capacity = 0;
        self.push(chunk);
    }

    fn rebuild_starts(&mut self) {
        self.starts.clear();
        self.capacity = 0;
        for chunk in &self.chunks {
            self.starts.push(self.capacity);
            self.capacity += chunk.length;
        }
    }

    fn locate(&self, position: u64) -> Option<(usize, u64)> {
        if position >= self.capacity {
            return None;
        }
        let index = self.starts.partition_point(|&start| start <= position) - 1;
        Some((index, position - self.starts[index]))
    }

    fn segments(&self, begin: u64, end: u64) -> Vec<Segment> {
        let mut segments = Vec::new();
        let mut position = begin;
        while position < end {
            let Some((index, offset)) = self.locate(position) else {
                break;
            };
            let chunk = self.chunks[index];
            let len = (chunk.length - offset).min(end - position);
            segments.push(Segment {
                chunk,
                offset,
                len,
                logical: position,
            });
            position += len;
        }
        segments
    }

    fn usage(&self, index: usize) -> ChunkUsage {
        ChunkUsage {
            used: self
                .length
                .saturating_sub(self.starts[index])
                .min(self.chunks[index].length),
            sequence: index as u64,
        }
    }
}

type DeleteHook = Box<dyn Fn(FlakeId) + Send + Sync>;

/// A logical, independently growable byte stream.
pub struct Flake {
    id: FlakeId,
    memory: Arc<ChunkMemory>,
    state: RwLock<FlakeState>,
    on_delete: Option<DeleteHook>,
}

impl std::fmt::Debug for Flake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("Flake")
            .field("id", &self.id)
            .field("length", &state.length)
            .field("capacity", &state.capacity)
            .field("chunks", &state.chunks.len())
            .field("deleted", &state.deleted)
            .finish()
    }
}

impl Flake {
    /// Creates an empty flake. Nothing is persisted until it grows.
    pub(crate) fn new(id: FlakeId, memory: Arc<ChunkMemory>) -> Self {
        Self {
            id,
            memory,
            state: RwLock::new(FlakeState::default()),
            on_delete: None,
        }
    }

    /// Calls `hook` with the flake's identification once it has been deleted.
    pub(crate) fn with_delete_hook(
        mut self,
        hook: impl Fn(FlakeId) + Send + Sync + 'static,
    ) -> Self {
        self.on_delete = Some(Box::new(hook));
        self
    }

    /// Rebuilds a flake from its persisted chunk records.
    pub(crate) fn restore(
        id: FlakeId,
        memory: Arc<ChunkMemory>,
        mut records: Vec<ChunkRecord>,
    ) -> StorageResult<Self> {
        records.sort_by_key(|r| r.sequence);
        let mut state = FlakeState::default();
        for record in &records {
            if record.used > record.chunk.length {
                return Err(StorageError::CorruptedChunkTable {
                    reason: format!(
                        "{} of {} claims {} used bytes",
                        record.chunk, id, record.used
                    ),
                });
            }
            state.length += record.used;
            state.push(record.chunk);
        }
        debug!(flake_id = %id, length = state.length, chunks = state.chunks.len(), "restored flake");
        Ok(Self {
            id,
            memory,
            state: RwLock::new(state),
            on_delete: None,
        })
    }

    /// Identification of the flake.
    pub fn id(&self) -> FlakeId {
        self.id
    }

    /// Logical length in bytes.
    pub fn len(&self) -> u64 {
        self.state.read().length
    }

    /// True if the flake holds no content.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// False once the flake has been deleted.
    pub fn is_valid(&self) -> bool {
        !self.state.read().deleted
    }

    /// Total bytes of the flake's chunks.
    pub fn capacity(&self) -> u64 {
        self.state.read().capacity
    }

    /// Number of chunks the flake occupies.
    pub fn chunk_count(&self) -> usize {
        self.state.read().chunks.len()
    }

    /// The flake's chunks in logical order.
    pub fn chunks(&self) -> Vec<Chunk> {
        self.state.read().chunks.clone()
    }

    /// Chunk and offset inside it holding logical `position`.
    pub fn locate(&self, position: u64) -> Option<(Chunk, u64)> {
        let state = self.state.read();
        state
            .locate(position)
            .map(|(index, offset)| (state.chunks[index], offset))
    }

    /// Data file position of logical `position`, if it is backed by a chunk.
    pub fn physical_position(&self, position: u64) -> Option<u64> {
        self.locate(position)
            .map(|(chunk, offset)| chunk.position + offset)
    }

    /// Sequential reader starting at position 0.
    pub fn input_stream(self: &Arc<Self>) -> FlakeInputStream {
        FlakeInputStream::new(DataPointer::new(Arc::clone(self)))
    }

    /// Buffered writer starting at position 0.
    pub fn output_stream(self: &Arc<Self>) -> FlakeOutputStream {
        FlakeOutputStream::new(DataPointer::new(Arc::clone(self)))
    }

    fn check(&self, state: &FlakeState) -> StorageResult<()> {
        if state.deleted {
            return Err(StorageError::FlakeDeleted { flake_id: self.id });
        }
        Ok(())
    }

    /// Reads up to `buffer.len()` bytes at `position`; returns how many were read.
    pub fn read_at(&self, position: u64, buffer: &mut [u8]) -> StorageResult<usize> {
        let state = self.state.read();
        self.check(&state)?;
        if position > state.length {
            return Err(StorageError::PositionOutOfRange {
                flake_id: self.id,
                position: position as i128,
                length: state.length,
            });
        }
        let end = state.length.min(position + buffer.len() as u64);
        for segment in state.segments(position, end) {
            let at = (segment.logical - position) as usize;
            self.memory.read(
                &segment.chunk,
                segment.offset,
                &mut buffer[at..at + segment.len as usize],
            )?;
        }
        Ok((end - position) as usize)
    }

    /// Writes `data` at `position`, growing the flake as needed. A gap between
    /// the current length and `position` reads back as zeros.
    pub fn write_at(&self, position: u64, data: &[u8]) -> StorageResult<()> {
        let mut state = self.state.write();
        self.check(&state)?;
        let end = position
            .checked_add(data.len() as u64)
            .ok_or(StorageError::PositionOutOfRange {
                flake_id: self.id,
                position: position as i128 + data.len() as i128,
                length: state.length,
            })?;
        let old_length = state.length;
        self.grow_capacity(&mut state, end)?;
        if position > old_length {
            self.clear_range(&state, old_length, position)?;
        }
        for segment in state.segments(position, end) {
            let at = (segment.logical - position) as usize;
            self.memory.write(
                &segment.chunk,
                segment.offset,
                &data[at..at + segment.len as usize],
            )?;
        }
        if end > old_length {
            state.length = end;
            self.save_usage(&state, old_length, end)?;
        }
        trace!(flake_id = %self.id, position, len = data.len(), "wrote flake");
        Ok(())
    }

    /// Sets the logical length. Growth is zero filled; shrinking keeps the
    /// chunks as spare capacity until [`Flake::trim_to`].
    pub fn set_length(&self, new_length: u64) -> StorageResult<()> {
        let mut state = self.state.write();
        self.check(&state)?;
        let old_length = state.length;
        if new_length > old_length {
            self.grow_capacity(&mut state, new_length)?;
            self.clear_range(&state, old_length, new_length)?;
        }
        state.length = new_length;
        self.save_usage(&state, old_length.min(new_length), old_length.max(new_length))
    }

    /// Makes sure at least `capacity` bytes are backed by chunks.
    pub fn ensure_capacity(&self, capacity: u64) -> StorageResult<()> {
        let mut state = self.state.write();
        self.check(&state)?;
        self.grow_capacity(&mut state, capacity)
    }

    /// Cuts the flake to at most `length` bytes and releases every chunk and
    /// chunk tail beyond it.
    pub fn trim_to(&self, length: u64) -> StorageResult<()> {
        let mut state = self.state.write();
        self.check(&state)?;
        state.length = state.length.min(length);
        let length = state.length;

        while state.starts.last().is_some_and(|&start| start >= length) {
            let chunk = state.chunks[state.chunks.len() - 1];
            self.memory.delete_chunk(&chunk)?;
            state.chunks.pop();
            state.starts.pop();
            state.capacity -= chunk.length;
        }
        if let Some(index) = state.chunks.len().checked_sub(1) {
            let keep = length - state.starts[index];
            let chunk = state.chunks[index];
            if keep < chunk.length {
                let shrunk = self.memory.shrink_chunk(&chunk, keep)?;
                state.chunks[index] = shrunk;
                state.capacity -= chunk.length - keep;
                self.memory.save_chunk(self.id, &shrunk, state.usage(index))?;
            }
        }
        debug!(flake_id = %self.id, length, capacity = state.capacity, "trimmed flake");
        Ok(())
    }

    /// Releases every chunk and invalidates the flake.
    ///
    /// The flake is invalid as soon as deletion starts. If releasing a chunk
    /// fails, the remaining chunks stay with the flake and a later call
    /// continues the release.
    pub fn delete(&self) -> StorageResult<()> {
        {
            let mut state = self.state.write();
            if state.deleted && state.chunks.is_empty() {
                return Err(StorageError::FlakeDeleted { flake_id: self.id });
            }
            state.deleted = true;
            state.length = 0;
            while let Some(&chunk) = state.chunks.last() {
                self.memory.delete_chunk(&chunk)?;
                state.chunks.pop();
                state.starts.pop();
                state.capacity -= chunk.length;
            }
        }
        debug!(flake_id = %self.id, "deleted flake");
        if let Some(hook) = &self.on_delete {
            hook(self.id);
        }
        Ok(())
    }

    /// Rewrites the usage of every chunk into the chunk table.
    pub fn sync(&self) -> StorageResult<()> {
        let state = self.state.read();
        if state.deleted {
            return Ok(());
        }
        for (index, chunk) in state.chunks.iter().enumerate() {
            self.memory.save_chunk(self.id, chunk, state.usage(index))?;
        }
        Ok(())
    }

    /// Merges runs of physically adjacent consecutive chunks into single
    /// chunks. Returns the number of chunks merged away.
    pub(crate) fn compact_chunks(&self) -> StorageResult<usize> {
        let mut state = self.state.write();
        self.check(&state)?;
        let mut merged_away = 0;
        let mut index = 0;
        while index + 1 < state.chunks.len() {
            let first = state.chunks[index];
            let second = state.chunks[index + 1];
            if first.is_followed_by(&second) {
                let merged = self.memory.merge_chunks(&first, &second)?;
                state.chunks[index] = merged;
                state.chunks.remove(index + 1);
                merged_away += 1;
            } else {
                index += 1;
            }
        }
        if merged_away > 0 {
            state.rebuild_starts();
            for (index, chunk) in state.chunks.iter().enumerate() {
                self.memory.save_chunk(self.id, chunk, state.usage(index))?;
            }
        }
        Ok(merged_away)
    }

    /// Moves the content into one freshly allocated chunk, copying through a
    /// buffer of `buffer_size` bytes. Returns false when there was nothing to do.
    pub(crate) fn relocate(&self, buffer_size: usize) -> StorageResult<bool> {
        let mut state = self.state.write();
        self.check(&state)?;
        if state.chunks.len() <= 1 || state.length == 0 {
            return Ok(false);
        }
        let target = self.memory.allocate_chunk(state.length)?;
        let copied = state
            .segments(0, state.length)
            .into_iter()
            .try_for_each(|segment| {
                self.memory.transfer(
                    (&segment.chunk, segment.offset),
                    (&target, segment.logical),
                    segment.len,
                    buffer_size,
                )
            });
        if let Err(e) = copied {
            self.memory.delete_chunk(&target)?;
            return Err(e);
        }

        let old_chunks = std::mem::take(&mut state.chunks);
        state.replace_all(target);
        self.memory.save_chunk(self.id, &target, state.usage(0))?;
        for chunk in &old_chunks {
            self.memory.delete_chunk(chunk)?;
        }
        debug!(flake_id = %self.id, chunks = old_chunks.len(), to = %target, "relocated flake");
        Ok(true)
    }

    fn grow_capacity(&self, state: &mut FlakeState, needed: u64) -> StorageResult<()> {
        if state.capacity >= needed {
            return Ok(());
        }
        let chunk = self.memory.allocate_chunk(needed - state.capacity)?;
        state.push(chunk);
        let index = state.chunks.len() - 1;
        if let Err(e) = self.memory.save_chunk(self.id, &chunk, state.usage(index)) {
            state.chunks.pop();
            state.starts.pop();
            state.capacity -= chunk.length;
            self.memory.delete_chunk(&chunk)?;
            return Err(e);
        }
        debug!(flake_id = %self.id, %chunk, capacity = state.capacity, "flake acquired chunk");
        Ok(())
    }

    fn clear_range(&self, state: &FlakeState, begin: u64, end: u64) -> StorageResult<()> {
        for segment in state.segments(begin, end) {
            self.memory.clear(&segment.chunk, segment.offset, segment.len)?;
        }
        Ok(())
    }

    /// Persists the usage of every chunk touching `[begin, end]`.
    fn save_usage(&self, state: &FlakeState, begin: u64, end: u64) -> StorageResult<()> {
        let first = state
            .starts
            .partition_point(|&start| start <= begin)
            .saturating_sub(1);
        for index in first..state.chunks.len() {
            if state.starts[index] > end {
                break;
            }
            self.memory
                .save_chunk(self.id, &state.chunks[index], state.usage(index))?;
        }
        Ok(())
    }
}

impl WriteAt for Flake {
    fn write_byte(&self, pointer: &mut DataPointer, byte: u8) -> StorageResult<()> {
        self.write(pointer, &[byte])
    }

    fn write(&self, pointer: &mut DataPointer, buffer: &[u8]) -> StorageResult<()> {
        if pointer.flake_id() != self.id {
            return Err(StorageError::RangeAccounting(format!(
                "pointer into {} used to write {}",
                pointer.flake_id(),
                self.id
            )));
        }
        let position = pointer.position_in_flake();
        self.write_at(position, buffer)?;
        pointer.advance(buffer.len() as u64);
        Ok(())
    }
}
