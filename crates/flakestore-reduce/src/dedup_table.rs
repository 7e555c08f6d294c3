//! Content-addressed table of deduplication blocks.
//!
//! Blocks live in a [`DataTable`] of [`BlockRecord`]s. An in-memory index maps
//! each BLAKE3 fingerprint to the slots holding blocks with that fingerprint;
//! a lookup only succeeds after the stored bytes compare equal.

use std::sync::Arc;

use dashmap::DashMap;
use flakestore_fs::{DataTable, FsError};
use flakestore_storage::{Flake, ReadonlyStorageConfig};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::block::{BlockRecord, DeduplicationBlock};
use crate::error::{ReduceError, ReduceResult};
use crate::fingerprint::BlockHash;

/// Maps content blocks to stable table indices.
pub struct DeduplicationTable {
    table: DataTable<BlockRecord>,
    index: DashMap<BlockHash, Vec<u64>>,
    register: Mutex<()>,
}

impl std::fmt::Debug for DeduplicationTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeduplicationTable")
            .field("flake_id", &self.table.flake().id())
            .field("blocks", &self.len())
            .finish()
    }
}

impl DeduplicationTable {
    /// Opens the table stored in `flake` and rebuilds the content index.
    pub fn open(flake: Arc<Flake>, growth_batch: u64) -> ReduceResult<Self> {
        let table: DataTable<BlockRecord> = DataTable::open(flake, growth_batch)?;
        let index: DashMap<BlockHash, Vec<u64>> = DashMap::new();
        for record in table.records()? {
            index
                .entry(record.block.hash())
                .or_default()
                .push(record.index);
        }
        debug!(
            flake_id = %table.flake().id(),
            fingerprints = index.len(),
            "opened deduplication table"
        );
        Ok(Self {
            table,
            index,
            register: Mutex::new(()),
        })
    }

    /// Opens the table with the growth batch of `config`.
    pub fn with_config(
        flake: Arc<Flake>,
        config: &dyn ReadonlyStorageConfig,
    ) -> ReduceResult<Self> {
        Self::open(flake, config.table_growth_batch())
    }

    /// The underlying record table.
    pub fn data_table(&self) -> &DataTable<BlockRecord> {
        &self.table
    }

    /// Number of stored blocks.
    pub fn len(&self) -> u64 {
        self.index
            .iter()
            .map(|entry| entry.value().len() as u64)
            .sum()
    }

    /// True if no block is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn find(&self, block: &DeduplicationBlock) -> ReduceResult<Option<u64>> {
        let candidates = match self.index.get(&block.hash()) {
            Some(entry) => entry.value().clone(),
            None => return Ok(None),
        };
        for candidate in candidates {
            if self.table.load(candidate)?.block == *block {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    /// True if an equal block is stored.
    pub fn is_registered(&self, block: &DeduplicationBlock) -> ReduceResult<bool> {
        Ok(self.find(block)?.is_some())
    }

    /// Index of the stored block equal to `block`.
    pub fn get_index(&self, block: &DeduplicationBlock) -> ReduceResult<Option<u64>> {
        self.find(block)
    }

    /// Stores `block`, which must not be registered yet, and returns its index.
    pub fn register(&self, block: &DeduplicationBlock) -> ReduceResult<u64> {
        let _guard = self.register.lock();
        if let Some(index) = self.find(block)? {
            return Err(ReduceError::AlreadyRegistered { index });
        }
        self.insert(block)
    }

    /// Index of the stored block equal to `block`, storing it first if needed.
    /// The flag is true when the block was newly stored.
    pub fn get_or_register(&self, block: &DeduplicationBlock) -> ReduceResult<(u64, bool)> {
        let _guard = self.register.lock();
        if let Some(index) = self.find(block)? {
            return Ok((index, false));
        }
        Ok((self.insert(block)?, true))
    }

    fn insert(&self, block: &DeduplicationBlock) -> ReduceResult<u64> {
        let index = self.table.available_index()?;
        let record = BlockRecord {
            index,
            block: block.clone(),
        };
        if let Err(e) = self.table.save(&record) {
            if let Err(release) = self.table.release_index(index) {
                warn!(index, error = %release, "failed to release unsaved block slot");
            }
            return Err(e.into());
        }
        let hash = block.hash();
        self.index.entry(hash).or_default().push(index);
        debug!(index, hash = %hash, "registered deduplication block");
        Ok(index)
    }

    /// The block stored at `index`.
    pub fn load_block(&self, index: u64) -> ReduceResult<DeduplicationBlock> {
        match self.table.load(index) {
            Ok(record) => Ok(record.block),
            Err(FsError::RecordNotFound { .. }) | Err(FsError::IndexOutOfRange { .. }) => {
                Err(ReduceError::UnknownBlock { index })
            }
            Err(e) => Err(e.into()),
        }
    }
}
