//! Defragmentation of flake chunk lists.
//!
//! A pass first merges physically adjacent consecutive chunks of a flake into
//! one chunk, which only rewrites chunk table records. Small flakes that still
//! span several chunks afterwards are relocated into a single chunk.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::chunk::FlakeId;
use crate::config::ReadonlyStorageConfig;
use crate::error::StorageResult;
use crate::flake::Flake;

/// Configuration for the defragmentation engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefragConfig {
    /// Copy buffer size used when relocating a flake.
    pub transfer_buffer_size: usize,
    /// Flakes up to this length are relocated into one chunk.
    pub chunk_size_threshold: u64,
}

impl Default for DefragConfig {
    fn default() -> Self {
        Self {
            transfer_buffer_size: 8192,
            chunk_size_threshold: 200_000,
        }
    }
}

impl DefragConfig {
    /// Takes the defragmentation values of a storage configuration.
    pub fn from_storage_config(config: &dyn ReadonlyStorageConfig) -> Self {
        Self {
            transfer_buffer_size: config.defragmentation_transfer_buffer_size() as usize,
            chunk_size_threshold: config.defragmentation_chunk_size_threshold(),
        }
    }
}

/// Chunk layout of one fragmented flake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlakeFragmentation {
    /// The flake.
    pub flake_id: FlakeId,
    /// Logical length of the flake.
    pub length: u64,
    /// Number of chunks it spans.
    pub chunk_count: usize,
    /// Consecutive chunk pairs that are also physically adjacent.
    pub mergeable_pairs: usize,
    /// Whether the flake is small enough to be relocated into one chunk.
    pub relocatable: bool,
}

/// Fragmentation report over a set of flakes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FragmentationReport {
    /// Flakes inspected.
    pub flake_count: usize,
    /// Chunks held by the inspected flakes.
    pub chunk_count: usize,
    /// Flakes spanning more than one chunk.
    pub fragmented: Vec<FlakeFragmentation>,
    /// Whether any flake would change in a pass.
    pub needs_defrag: bool,
}

/// Result of defragmenting one flake.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefragOutcome {
    /// Chunks merged into their predecessor.
    pub merged: usize,
    /// Whether the content was moved into a single chunk.
    pub relocated: bool,
    /// Bytes copied by relocation.
    pub bytes_moved: u64,
}

/// Statistics about the defragmentation engine's operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DefragStats {
    /// Total passes performed.
    pub passes_performed: u64,
    /// Total chunks merged away.
    pub chunks_merged: u64,
    /// Total flakes relocated.
    pub flakes_relocated: u64,
    /// Total bytes moved.
    pub bytes_moved: u64,
}

/// Analyzes and compacts flake chunk lists.
pub struct DefragEngine {
    config: DefragConfig,
    stats: Mutex<DefragStats>,
}

impl DefragEngine {
    /// Creates a new defragmentation engine with the given configuration.
    pub fn new(config: DefragConfig) -> Self {
        debug!(
            transfer_buffer_size = config.transfer_buffer_size,
            threshold = config.chunk_size_threshold,
            "defrag engine created"
        );
        Self {
            config,
            stats: Mutex::new(DefragStats::default()),
        }
    }

    /// Reports which flakes are fragmented.
    pub fn analyze(&self, flakes: &[Arc<Flake>]) -> FragmentationReport {
        let mut report = FragmentationReport {
            flake_count: flakes.len(),
            ..FragmentationReport::default()
        };
        for flake in flakes {
            let chunks = flake.chunks();
            report.chunk_count += chunks.len();
            if chunks.len() <= 1 {
                continue;
            }
            let mergeable_pairs = chunks
                .windows(2)
                .filter(|pair| pair[0].is_followed_by(&pair[1]))
                .count();
            let length = flake.len();
            let relocatable = length > 0 && length <= self.config.chunk_size_threshold;
            report.needs_defrag |= mergeable_pairs > 0 || relocatable;
            report.fragmented.push(FlakeFragmentation {
                flake_id: flake.id(),
                length,
                chunk_count: chunks.len(),
                mergeable_pairs,
                relocatable,
            });
        }
        debug!(
            flakes = report.flake_count,
            chunks = report.chunk_count,
            fragmented = report.fragmented.len(),
            needs_defrag = report.needs_defrag,
            "fragmentation analysis"
        );
        report
    }

    /// Merges adjacent chunks of `flake`, then relocates it into one chunk if
    /// it is still fragmented and below the size threshold.
    pub fn defragment_flake(&self, flake: &Flake) -> StorageResult<DefragOutcome> {
        let mut outcome = DefragOutcome {
            merged: flake.compact_chunks()?,
            ..DefragOutcome::default()
        };
        let length = flake.len();
        if flake.chunk_count() > 1 && length <= self.config.chunk_size_threshold {
            outcome.relocated = flake.relocate(self.config.transfer_buffer_size)?;
            if outcome.relocated {
                outcome.bytes_moved = length;
            }
        }

        let mut stats = self.stats.lock();
        stats.chunks_merged += outcome.merged as u64;
        stats.flakes_relocated += outcome.relocated as u64;
        stats.bytes_moved += outcome.bytes_moved;
        Ok(outcome)
    }

    /// Defragments every flake and returns the summed outcome.
    pub fn defragment(&self, flakes: &[Arc<Flake>]) -> StorageResult<DefragOutcome> {
        let mut total = DefragOutcome::default();
        for flake in flakes.iter().filter(|f| f.is_valid()) {
            let outcome = self.defragment_flake(flake)?;
            total.merged += outcome.merged;
            total.relocated |= outcome.relocated;
            total.bytes_moved += outcome.bytes_moved;
        }
        self.stats.lock().passes_performed += 1;
        info!(
            merged = total.merged,
            bytes_moved = total.bytes_moved,
            "defragmentation pass finished"
        );
        Ok(total)
    }

    /// Returns defragmentation statistics.
    pub fn stats(&self) -> DefragStats {
        self.stats.lock().clone()
    }

    /// Returns the current configuration.
    pub fn config(&self) -> &DefragConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk_memory::ChunkMemory;
    use crate::config::StorageConfig;

    fn setup(dir: &std::path::Path) -> Arc<ChunkMemory> {
        let config = StorageConfig {
            minimum_chunk_size: 16,
            ..StorageConfig::in_directory(dir)
        };
        Arc::new(ChunkMemory::open(config).unwrap().0)
    }

    fn new_flake(memory: &Arc<ChunkMemory>) -> Arc<Flake> {
        Arc::new(Flake::new(memory.next_flake_id().unwrap(), Arc::clone(memory)))
    }

    fn read_all(flake: &Flake) -> Vec<u8> {
        let mut buffer = vec![0u8; flake.len() as usize];
        flake.read_at(0, &mut buffer).unwrap();
        buffer
    }

    #[test]
    fn test_default_config() {
        let config = DefragConfig::default();
        assert_eq!(config.transfer_buffer_size, 8192);
        assert_eq!(config.chunk_size_threshold, 200_000);
        let from_storage = DefragConfig::from_storage_config(&StorageConfig::default());
        assert_eq!(from_storage.chunk_size_threshold, 200_000);
    }

    #[test]
    fn test_analyze_and_defragment_interleaved_flakes() {
        let dir = tempfile::tempdir().unwrap();
        let memory = setup(dir.path());
        let a = new_flake(&memory);
        let b = new_flake(&memory);
        for round in 0..3u8 {
            a.write_at(a.len(), &[round; 16]).unwrap();
            b.write_at(b.len(), &[round + 10; 16]).unwrap();
        }
        let flakes = vec![Arc::clone(&a), Arc::clone(&b)];
        let expected_a = read_all(&a);
        let expected_b = read_all(&b);

        let engine = DefragEngine::new(DefragConfig {
            transfer_buffer_size: 5,
            chunk_size_threshold: 1024,
        });
        let report = engine.analyze(&flakes);
        assert_eq!(report.flake_count, 2);
        assert_eq!(report.chunk_count, 6);
        assert_eq!(report.fragmented.len(), 2);
        assert!(report.needs_defrag);
        assert!(report.fragmented.iter().all(|f| f.mergeable_pairs == 0));

        let outcome = engine.defragment(&flakes).unwrap();
        assert!(outcome.relocated);
        assert_eq!(outcome.bytes_moved, 96);
        assert_eq!(a.chunk_count(), 1);
        assert_eq!(b.chunk_count(), 1);
        assert_eq!(read_all(&a), expected_a);
        assert_eq!(read_all(&b), expected_b);

        assert!(!engine.analyze(&flakes).needs_defrag);
        let stats = engine.stats();
        assert_eq!(stats.passes_performed, 1);
        assert_eq!(stats.flakes_relocated, 2);
    }

    #[test]
    fn test_large_flake_only_merged() {
        let dir = tempfile::tempdir().unwrap();
        let memory = setup(dir.path());
        let a = new_flake(&memory);
        let b = new_flake(&memory);
        a.write_at(0, &[1; 16]).unwrap();
        b.write_at(0, &[2; 16]).unwrap();
        a.write_at(16, &[3; 16]).unwrap();
        a.write_at(32, &[4; 16]).unwrap();
        assert_eq!(a.chunk_count(), 3);

        let engine = DefragEngine::new(DefragConfig {
            transfer_buffer_size: 8,
            chunk_size_threshold: 8,
        });
        let before = read_all(&a);
        let outcome = engine.defragment_flake(&a).unwrap();
        assert_eq!(outcome.merged, 1);
        assert!(!outcome.relocated);
        assert_eq!(a.chunk_count(), 2);
        assert_eq!(read_all(&a), before);
    }
}
