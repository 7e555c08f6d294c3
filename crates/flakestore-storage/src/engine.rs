//! Storage engine: the flake factory over chunk memory.
//!
//! This module provides the main entry point for the storage subsystem. It
//! opens the data file and chunk table, rebuilds every persisted flake and
//! hands out new ones.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::chunk::{Chunk, ChunkRecord, FlakeId};
use crate::chunk_memory::{ChunkMemory, ChunkMemoryStats};
use crate::config::StorageConfig;
#[cfg(any(test, feature = "testing"))]
use crate::data_file::FaultInjector;
use crate::defrag::{DefragConfig, DefragEngine, DefragOutcome, FragmentationReport};
use crate::error::{StorageError, StorageResult};
use crate::flake::Flake;

/// Factory for new flakes.
pub trait CreateFlake: Send + Sync {
    /// Creates an empty flake with a fresh identification.
    fn create_flake(&self) -> StorageResult<Arc<Flake>>;
}

/// Aggregate statistics for the storage engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageEngineStats {
    /// Number of live flakes
    pub flake_count: usize,
    /// Sum of the logical lengths of all flakes
    pub total_flake_bytes: u64,
    /// Chunk memory statistics
    pub memory: ChunkMemoryStats,
}

/// The main storage engine combining chunk memory and the flake registry.
pub struct StorageEngine {
    config: StorageConfig,
    memory: Arc<ChunkMemory>,
    flakes: Arc<DashMap<FlakeId, Arc<Flake>>>,
    defrag: DefragEngine,
}

impl StorageEngine {
    /// Opens or creates the storage described by `config`.
    pub fn open(config: StorageConfig) -> StorageResult<Self> {
        config.validate()?;
        let (memory, records) = ChunkMemory::open(config.clone())?;
        let memory = Arc::new(memory);

        let mut by_owner: HashMap<FlakeId, Vec<ChunkRecord>> = HashMap::new();
        for record in records {
            by_owner.entry(record.owner).or_default().push(record);
        }
        let flakes = Arc::new(DashMap::new());
        for (id, records) in by_owner {
            memory.reserve_flake_id(id)?;
            let flake = Flake::restore(id, Arc::clone(&memory), records)?;
            flakes.insert(id, Arc::new(registered(flake, &flakes)));
        }

        info!(
            data_file = %config.data_file_path.display(),
            flakes = flakes.len(),
            "opened storage engine"
        );
        let defrag = DefragEngine::new(DefragConfig::from_storage_config(&config));
        Ok(Self {
            config,
            memory,
            flakes,
            defrag,
        })
    }

    /// The configuration the engine was opened with.
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// The chunk memory backing every flake.
    pub fn memory(&self) -> &Arc<ChunkMemory> {
        &self.memory
    }

    /// Fault injection hooks of the data file.
    #[cfg(any(test, feature = "testing"))]
    pub fn faults(&self) -> &FaultInjector {
        self.memory.faults()
    }

    /// Looks up a registered flake. Deleted flakes are not found.
    pub fn flake(&self, id: FlakeId) -> StorageResult<Arc<Flake>> {
        self.flakes
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .filter(|flake| flake.is_valid())
            .ok_or(StorageError::FlakeNotFound { flake_id: id })
    }

    fn new_flake(&self, id: FlakeId) -> Arc<Flake> {
        Arc::new(registered(
            Flake::new(id, Arc::clone(&self.memory)),
            &self.flakes,
        ))
    }

    /// Returns the live flake registered under `id`, or registers an empty
    /// one in its place. An empty flake owns no chunks, so it is not found in
    /// the chunk table after a restart.
    pub fn open_flake(&self, id: FlakeId) -> StorageResult<Arc<Flake>> {
        if id.get() == 0 {
            return Err(StorageError::FlakeNotFound { flake_id: id });
        }
        if let Ok(flake) = self.flake(id) {
            return Ok(flake);
        }
        self.memory.reserve_flake_id(id)?;
        let mut entry = self.flakes.entry(id).or_insert_with(|| self.new_flake(id));
        if !entry.value().is_valid() {
            debug!(flake_id = %id, "replacing deleted flake");
            *entry.value_mut() = self.new_flake(id);
        }
        Ok(Arc::clone(entry.value()))
    }

    /// Deletes the flake and releases its chunks.
    pub fn delete_flake(&self, id: FlakeId) -> StorageResult<()> {
        let (_, flake) = self
            .flakes
            .remove(&id)
            .ok_or(StorageError::FlakeNotFound { flake_id: id })?;
        if flake.is_valid() {
            flake.delete()?;
        }
        Ok(())
    }

    /// Number of live flakes.
    pub fn flake_count(&self) -> usize {
        self.flakes.iter().filter(|f| f.is_valid()).count()
    }

    /// Every live flake.
    pub fn flakes(&self) -> Vec<Arc<Flake>> {
        let mut flakes: Vec<_> = self
            .flakes
            .iter()
            .filter(|f| f.is_valid())
            .map(|f| Arc::clone(f.value()))
            .collect();
        flakes.sort_by_key(|f| f.id());
        flakes
    }

    /// Persists every flake's chunk usage, the chunk table and the data file.
    pub fn sync(&self) -> StorageResult<()> {
        for flake in self.flakes() {
            flake.sync()?;
        }
        self.memory.sync()?;
        debug!("storage engine synced");
        Ok(())
    }

    /// Returns aggregate statistics.
    pub fn stats(&self) -> StorageEngineStats {
        let flakes = self.flakes();
        StorageEngineStats {
            flake_count: flakes.len(),
            total_flake_bytes: flakes.iter().map(|f| f.len()).sum(),
            memory: self.memory.stats(),
        }
    }

    /// Chunks allocated in chunk memory that no live flake references.
    pub fn orphaned_chunks(&self) -> Vec<Chunk> {
        let mut orphans = Vec::new();
        for (owner, chunk) in self.memory.live_chunks() {
            let referenced = owner
                .and_then(|id| self.flakes.get(&id).map(|f| Arc::clone(f.value())))
                .is_some_and(|flake| flake.chunks().contains(&chunk));
            if !referenced {
                orphans.push(chunk);
            }
        }
        if !orphans.is_empty() {
            warn!(count = orphans.len(), "found orphaned chunks");
        }
        orphans
    }

    /// Reports fragmentation over every live flake.
    pub fn analyze_fragmentation(&self) -> FragmentationReport {
        self.defrag.analyze(&self.flakes())
    }

    /// Runs a defragmentation pass over every live flake.
    pub fn defragment(&self) -> StorageResult<DefragOutcome> {
        self.defrag.defragment(&self.flakes())
    }

    /// The defragmentation engine.
    pub fn defrag_engine(&self) -> &DefragEngine {
        &self.defrag
    }

    /// Shrinks the data file when its tail is free.
    pub fn trim_data_file(&self) -> StorageResult<u64> {
        self.memory.trim_data_file()
    }
}

/// Attaches a hook that drops the flake from `registry` once it is deleted.
fn registered(flake: Flake, registry: &Arc<DashMap<FlakeId, Arc<Flake>>>) -> Flake {
    let registry: Weak<DashMap<FlakeId, Arc<Flake>>> = Arc::downgrade(registry);
    flake.with_delete_hook(move |id| {
        if let Some(registry) = registry.upgrade() {
            if registry.remove_if(&id, |_, flake| !flake.is_valid()).is_some() {
                debug!(flake_id = %id, "deregistered deleted flake");
            }
        }
    })
}

impl CreateFlake for StorageEngine {
    fn create_flake(&self) -> StorageResult<Arc<Flake>> {
        let id = self.memory.next_flake_id()?;
        let flake = self.new_flake(id);
        self.flakes.insert(id, Arc::clone(&flake));
        debug!(flake_id = %id, "created flake");
        Ok(flake)
    }
}
