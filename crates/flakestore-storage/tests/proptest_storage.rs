//! Property-based tests for flakestore-storage using proptest.
//!
//! These tests verify invariants of the free index tracking, chunk memory
//! accounting and flake content against simple in-memory models.

use std::collections::BTreeSet;
use std::sync::Arc;

use flakestore_storage::{
    ChunkMemory, ChunkStore, CreateFlake, IndexRangeSet, LongRange, StorageConfig, StorageEngine,
};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum IndexOp {
    Allocate,
    Free(usize),
}

fn any_index_op() -> impl Strategy<Value = IndexOp> {
    prop_oneof![
        3 => Just(IndexOp::Allocate),
        2 => any::<usize>().prop_map(IndexOp::Free),
    ]
}

#[derive(Debug, Clone)]
enum FlakeOp {
    Write { position: u64, data: Vec<u8> },
    SetLength(u64),
    Trim(u64),
}

fn any_flake_op() -> impl Strategy<Value = FlakeOp> {
    prop_oneof![
        4 => (0u64..600, proptest::collection::vec(any::<u8>(), 0..300))
            .prop_map(|(position, data)| FlakeOp::Write { position, data }),
        1 => (0u64..800).prop_map(FlakeOp::SetLength),
        1 => (0u64..800).prop_map(FlakeOp::Trim),
    ]
}

proptest! {
    /// Allocated and free indices never overlap and all stay below the extent.
    #[test]
    fn test_range_set_allocated_disjoint_from_free(
        ops in proptest::collection::vec(any_index_op(), 1..200),
        batch in 1u64..20,
    ) {
        let mut free = IndexRangeSet::new();
        let mut allocated = BTreeSet::new();
        let mut extent = 0u64;

        for op in ops {
            match op {
                IndexOp::Allocate => {
                    let index = match free.pop_lowest() {
                        Some(index) => index,
                        None => {
                            free.insert_range(LongRange::new(extent + 1, extent + batch));
                            extent += batch;
                            extent - batch
                        }
                    };
                    prop_assert!(allocated.insert(index), "index {} handed out twice", index);
                }
                IndexOp::Free(pick) => {
                    if allocated.is_empty() {
                        continue;
                    }
                    let index = *allocated.iter().nth(pick % allocated.len()).unwrap();
                    allocated.remove(&index);
                    prop_assert!(free.insert(index));
                }
            }
            for &index in &allocated {
                prop_assert!(index < extent);
                prop_assert!(!free.contains(index));
            }
            prop_assert_eq!(free.free_count() + allocated.len() as u64, extent);
        }
    }

    /// Free bytes plus chunk bytes always cover the data file exactly.
    #[test]
    fn test_chunk_memory_accounting(
        sizes in proptest::collection::vec(1u64..5000, 1..40),
        frees in proptest::collection::vec(any::<usize>(), 0..40),
    ) {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            minimum_chunk_size: 256,
            ..StorageConfig::in_directory(dir.path())
        };
        let (memory, _) = ChunkMemory::open(config).unwrap();
        let mut chunks = Vec::new();
        for (i, size) in sizes.into_iter().enumerate() {
            chunks.push(memory.allocate_chunk(size).unwrap());
            if let Some(&pick) = frees.get(i) {
                if pick % 3 == 0 && !chunks.is_empty() {
                    let chunk = chunks.swap_remove(pick % chunks.len());
                    memory.delete_chunk(&chunk).unwrap();
                }
            }
            let stats = memory.stats();
            prop_assert_eq!(stats.free_bytes + stats.allocated_bytes, stats.data_file_bytes);
            prop_assert_eq!(stats.chunk_count, chunks.len());
        }

        let mut sorted = chunks.clone();
        sorted.sort_by_key(|c| c.position);
        for pair in sorted.windows(2) {
            prop_assert!(pair[0].end() <= pair[1].position);
        }
    }

    /// A flake always reads back what an in-memory byte vector would hold.
    #[test]
    fn test_flake_matches_model(ops in proptest::collection::vec(any_flake_op(), 1..30)) {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            minimum_chunk_size: 64,
            ..StorageConfig::in_directory(dir.path())
        };
        let engine = StorageEngine::open(config).unwrap();
        let flake = engine.create_flake().unwrap();
        let noise = engine.create_flake().unwrap();
        let mut model: Vec<u8> = Vec::new();

        for op in ops {
            match op {
                FlakeOp::Write { position, data } => {
                    flake.write_at(position, &data).unwrap();
                    let end = position as usize + data.len();
                    if model.len() < position as usize {
                        model.resize(position as usize, 0);
                    }
                    if model.len() < end {
                        model.resize(end, 0);
                    }
                    model[position as usize..end].copy_from_slice(&data);
                }
                FlakeOp::SetLength(length) => {
                    flake.set_length(length).unwrap();
                    model.resize(length as usize, 0);
                }
                FlakeOp::Trim(length) => {
                    flake.trim_to(length).unwrap();
                    model.truncate(length as usize);
                }
            }
            // interleave another flake so chunks are not contiguous
            noise.write_at(noise.len(), &[0xEE; 50]).unwrap();

            prop_assert_eq!(flake.len(), model.len() as u64);
            let mut content = vec![0u8; model.len()];
            prop_assert_eq!(flake.read_at(0, &mut content).unwrap(), model.len());
            prop_assert_eq!(&content, &model);
        }
        prop_assert!(engine.orphaned_chunks().is_empty());
    }
}

#[test]
fn test_reopen_after_interleaved_growth() {
    let dir = tempfile::tempdir().unwrap();
    let config = StorageConfig {
        minimum_chunk_size: 64,
        ..StorageConfig::in_directory(dir.path())
    };
    let ids = {
        let engine = StorageEngine::open(config.clone()).unwrap();
        let flakes: Vec<_> = (0..5).map(|_| engine.create_flake().unwrap()).collect();
        for round in 0..10u8 {
            for (i, flake) in flakes.iter().enumerate() {
                flake
                    .write_at(flake.len(), &vec![round ^ i as u8; 37 + i * 11])
                    .unwrap();
            }
        }
        engine.sync().unwrap();
        flakes.iter().map(|f| (f.id(), f.len())).collect::<Vec<_>>()
    };

    let engine = Arc::new(StorageEngine::open(config).unwrap());
    for (i, (id, length)) in ids.into_iter().enumerate() {
        let flake = engine.flake(id).unwrap();
        assert_eq!(flake.len(), length);
        let mut content = vec![0u8; length as usize];
        flake.read_at(0, &mut content).unwrap();
        let chunk = 37 + i * 11;
        for (round, piece) in content.chunks(chunk).enumerate() {
            assert!(piece.iter().all(|&b| b == round as u8 ^ i as u8));
        }
    }
}
