//! Fixed-record data table backed by one flake.
//!
//! Record `i` lives at byte `i * R::SIZE` of the flake. Free slots are all
//! zero and tracked in an [`IndexRangeSet`]; they are reused before the flake
//! grows, and growth adds a whole batch of slots at once. One mutex covers the
//! free set together with the flake's input and output streams, so allocation
//! and trim never interleave.

use std::marker::PhantomData;
use std::sync::Arc;

use flakestore_storage::{
    Flake, FlakeInputStream, FlakeOutputStream, IndexRangeSet, LongRange, ReadonlyStorageConfig,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{FsError, FsResult};
use crate::record::FixedRecord;

/// Writes one slot. A failed write leaves nothing buffered for a later retry.
fn write_slot(output: &mut FlakeOutputStream, position: u64, bytes: &[u8]) -> FsResult<()> {
    let written = output
        .set_position(position)
        .and_then(|_| output.write_all_bytes(bytes))
        .and_then(|_| output.flush_buffer());
    if written.is_err() {
        output.discard_buffer();
    }
    Ok(written?)
}

struct TableState {
    free: IndexRangeSet,
    input: FlakeInputStream,
    output: FlakeOutputStream,
}

/// Outcome of [`DataTable::trim`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrimOutcome {
    /// Free tail slots that were cut off.
    pub released: u64,
    /// Slots in the table afterwards, including the re-added batch.
    pub extent: u64,
}

/// Table of fixed-width records with index recycling.
pub struct DataTable<R: FixedRecord> {
    flake: Arc<Flake>,
    growth_batch: u64,
    clear_record: Vec<u8>,
    state: Mutex<TableState>,
    _record: PhantomData<fn() -> R>,
}

impl<R: FixedRecord> DataTable<R> {
    /// Opens a table over `flake`. Every all-zero slot found becomes free.
    pub fn open(flake: Arc<Flake>, growth_batch: u64) -> FsResult<Self> {
        let length = flake.len();
        if length % R::SIZE as u64 != 0 {
            return Err(FsError::Decode {
                expected: R::SIZE,
                actual: (length % R::SIZE as u64) as usize,
            });
        }

        let mut input = flake.input_stream();
        let mut free = IndexRangeSet::new();
        let mut buffer = vec![0u8; R::SIZE];
        let extent = length / R::SIZE as u64;
        for index in 0..extent {
            input.read_complete(&mut buffer)?;
            if is_zero(&buffer) {
                free.insert(index);
            }
        }
        debug!(
            flake_id = %flake.id(),
            extent,
            free = free.free_count(),
            "opened data table"
        );

        Ok(Self {
            clear_record: vec![0u8; R::SIZE],
            growth_batch: growth_batch.max(1),
            state: Mutex::new(TableState {
                free,
                input,
                output: flake.output_stream(),
            }),
            flake,
            _record: PhantomData,
        })
    }

    /// Opens a table growing by the configured table growth batch.
    pub fn with_config(flake: Arc<Flake>, config: &dyn ReadonlyStorageConfig) -> FsResult<Self> {
        Self::open(flake, config.table_growth_batch())
    }

    /// The backing flake.
    pub fn flake(&self) -> &Arc<Flake> {
        &self.flake
    }

    /// Number of slots, free or not.
    pub fn extent(&self) -> u64 {
        self.flake.len() / R::SIZE as u64
    }

    /// Number of free slots.
    pub fn free_count(&self) -> u64 {
        self.state.lock().free.free_count()
    }

    /// Slots handed out and not deleted since.
    pub fn allocated_count(&self) -> u64 {
        let state = self.state.lock();
        self.extent() - state.free.free_count()
    }

    /// True if `index` is a free slot.
    pub fn is_free(&self, index: u64) -> bool {
        self.state.lock().free.contains(index)
    }

    fn check_index(&self, index: u64) -> FsResult<()> {
        let extent = self.extent();
        if index >= extent {
            return Err(FsError::IndexOutOfRange { index, extent });
        }
        Ok(())
    }

    fn position(index: u64) -> u64 {
        index * R::SIZE as u64
    }

    /// Hands out a slot: the lowest free one, or the first of a fresh batch.
    pub fn available_index(&self) -> FsResult<u64> {
        let mut state = self.state.lock();
        if let Some(index) = state.free.pop_lowest() {
            return Ok(index);
        }
        let begin = self.extent();
        let end = begin + self.growth_batch;
        state.output.seek_eof()?;
        state
            .output
            .ensure_remaining_capacity(self.growth_batch * R::SIZE as u64)?;
        if !state.free.insert_range(LongRange::new(begin + 1, end)) {
            return Err(FsError::RangeAccounting(format!(
                "new slots [{}, {}) were already free",
                begin + 1,
                end
            )));
        }
        debug!(flake_id = %self.flake.id(), begin, end, "grew data table");
        Ok(begin)
    }

    /// Returns a slot from [`DataTable::available_index`] that was never saved.
    pub fn release_index(&self, index: u64) -> FsResult<()> {
        let mut state = self.state.lock();
        self.check_index(index)?;
        if !state.free.insert(index) {
            return Err(FsError::RangeAccounting(format!(
                "slot {} released while free",
                index
            )));
        }
        Ok(())
    }

    /// Writes `record` into its slot. A free slot is claimed by the write.
    pub fn save(&self, record: &R) -> FsResult<()> {
        let index = record.index();
        let mut buffer = vec![0u8; R::SIZE];
        record.encode(&mut buffer);
        if is_zero(&buffer) {
            return Err(FsError::AllZeroRecord { index });
        }
        let mut state = self.state.lock();
        self.check_index(index)?;
        write_slot(&mut state.output, Self::position(index), &buffer)?;
        state.free.remove(index);
        Ok(())
    }

    /// Reads the record at `index`.
    pub fn load(&self, index: u64) -> FsResult<R> {
        let mut state = self.state.lock();
        self.check_index(index)?;
        let mut buffer = vec![0u8; R::SIZE];
        state.input.set_position(Self::position(index))?;
        state.input.read_complete(&mut buffer)?;
        if is_zero(&buffer) {
            return Err(FsError::RecordNotFound { index });
        }
        R::decode(index, &buffer)
    }

    /// Zeroes the slot at `index` and returns it to the free slots.
    pub fn delete(&self, index: u64) -> FsResult<()> {
        let mut state = self.state.lock();
        self.check_index(index)?;
        if state.free.contains(index) {
            return Err(FsError::RangeAccounting(format!(
                "slot {} deleted while free",
                index
            )));
        }
        write_slot(&mut state.output, Self::position(index), &self.clear_record)?;
        state.free.insert(index);
        Ok(())
    }

    /// Every stored record, in index order.
    pub fn records(&self) -> FsResult<Vec<R>> {
        let mut state = self.state.lock();
        let extent = self.extent();
        let mut records = Vec::new();
        let mut buffer = vec![0u8; R::SIZE];
        state.input.set_position(0)?;
        for index in 0..extent {
            state.input.read_complete(&mut buffer)?;
            if !is_zero(&buffer) {
                records.push(R::decode(index, &buffer)?);
            }
        }
        Ok(records)
    }

    /// Cuts free slots off the end of the table, then re-adds one growth batch
    /// of spare slots.
    ///
    /// Scanning stops at the first slot from the end that is either non-zero
    /// or zero but handed out and not saved yet. A non-zero slot that is
    /// marked free is an accounting violation.
    pub fn trim(&self) -> FsResult<TrimOutcome> {
        let mut state = self.state.lock();
        let extent = self.extent();
        let mut buffer = vec![0u8; R::SIZE];
        let mut keep = extent;
        while keep > 0 {
            let index = keep - 1;
            state.input.set_position(Self::position(index))?;
            state.input.read_complete(&mut buffer)?;
            let free = state.free.contains(index);
            match (is_zero(&buffer), free) {
                (true, true) => keep = index,
                (true, false) => break,
                (false, false) => break,
                (false, true) => {
                    return Err(FsError::RangeAccounting(format!(
                        "slot {} holds a record but is marked free",
                        index
                    )))
                }
            }
        }

        let released = extent - keep;
        state.free.truncate(keep);
        state.output.set_position(Self::position(keep))?;
        state.output.trim()?;

        let new_extent = keep + self.growth_batch;
        state
            .output
            .ensure_remaining_capacity(self.growth_batch * R::SIZE as u64)?;
        state.output.seek_eof()?;
        if !state.free.insert_range(LongRange::new(keep, new_extent)) {
            return Err(FsError::RangeAccounting(format!(
                "re-added slots [{}, {}) were already free",
                keep, new_extent
            )));
        }
        info!(
            flake_id = %self.flake.id(),
            released,
            extent = new_extent,
            "trimmed data table"
        );
        Ok(TrimOutcome {
            released,
            extent: new_extent,
        })
    }
}

fn is_zero(buffer: &[u8]) -> bool {
    buffer.iter().all(|&b| b == 0)
}
