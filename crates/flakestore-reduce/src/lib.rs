#![warn(missing_docs)]

//! Flakestore reduce subsystem: block-level deduplication of files
//!
//! Full blocks of a file's content are stored once in a content-addressed
//! table and replaced by fixed-width references. A background manager finds
//! candidate files in a tree and rewrites them one at a time.

pub mod block;
pub mod config;
pub mod dedup_table;
pub mod error;
pub mod fingerprint;
pub mod manager;
pub mod rewrite;

pub use block::{BlockRecord, DeduplicationBlock, REFERENCE_SIZE};
pub use config::DedupConfig;
pub use dedup_table::DeduplicationTable;
pub use error::{ReduceError, ReduceResult};
pub use fingerprint::{block_hash, BlockHash};
pub use manager::{
    CandidatePolicy, DedupStats, DeduplicationManager, DefaultCandidatePolicy, ManagerState,
};
pub use rewrite::{deduplicate_file, expand_file, RewriteOutcome};
