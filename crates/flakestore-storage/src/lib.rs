#![warn(missing_docs)]

//! Flakestore storage subsystem: chunk memory over a single growable data file, flakes, data pointers
//!
//! This crate provides the foundational storage layer for Flakestore.
//! Many independently growable byte streams ("flakes") are multiplexed onto
//! one data file. Free space is recycled first fit before the file grows, and
//! a defragmentation pass compacts chunk lists.

pub mod chunk;
pub mod chunk_memory;
pub mod chunk_table;
pub mod config;
pub mod data_file;
pub mod defrag;
pub mod engine;
pub mod error;
pub mod flake;
pub mod pointer;
pub mod range;
pub mod stream;

pub use chunk::{Chunk, ChunkId, ChunkRecord, FlakeId, CHUNK_RECORD_SIZE};
pub use chunk_memory::{ChunkMemory, ChunkMemoryStats, ChunkStore, ChunkUsage};
pub use chunk_table::{ChunkTableHeader, CHUNK_TABLE_HEADER_SIZE, CHUNK_TABLE_MAGIC, CHUNK_TABLE_VERSION};
pub use config::{ReadonlyStorageConfig, StorageConfig};
pub use data_file::DataFile;
#[cfg(any(test, feature = "testing"))]
pub use data_file::FaultInjector;
pub use defrag::{DefragConfig, DefragEngine, DefragOutcome, DefragStats, FlakeFragmentation, FragmentationReport};
pub use engine::{CreateFlake, StorageEngine, StorageEngineStats};
pub use error::{StorageError, StorageResult};
pub use flake::{Flake, WriteAt};
pub use pointer::DataPointer;
pub use range::{IndexRangeSet, LongRange};
pub use stream::{FlakeInputStream, FlakeOutputStream, DEFAULT_OUTPUT_BUFFER_SIZE};
