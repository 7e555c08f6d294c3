//! Error types for tables and the file veneer.

use flakestore_storage::StorageError;
use thiserror::Error;

/// Result type alias for file system operations.
pub type FsResult<T> = Result<T, FsError>;

/// Error variants for file system operations.
#[derive(Debug, Error)]
pub enum FsError {
    /// An error from the storage layer.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// A record buffer did not have the declared width.
    #[error("Decode error: expected {expected} bytes, got {actual}")]
    Decode {
        /// Declared record width.
        expected: usize,
        /// Width that was available.
        actual: usize,
    },

    /// A record encoded to all zero bytes, which marks a free slot.
    #[error("record {index} encodes to all zero bytes")]
    AllZeroRecord {
        /// Index of the rejected record.
        index: u64,
    },

    /// The slot holds no record.
    #[error("no record stored at index {index}")]
    RecordNotFound {
        /// The requested index.
        index: u64,
    },

    /// The index lies beyond the table.
    #[error("index {index} is outside of a table with {extent} slots")]
    IndexOutOfRange {
        /// The requested index.
        index: u64,
        /// Number of slots in the table.
        extent: u64,
    },

    /// The file is locked against output.
    #[error("file {index} is locked")]
    FileLocked {
        /// Index of the file.
        index: u64,
    },

    /// The file has been deleted.
    #[error("file {index} has been deleted")]
    FileDeleted {
        /// Index of the file.
        index: u64,
    },

    /// The free index bookkeeping disagrees with the table content.
    #[error("free index accounting violated: {0}")]
    RangeAccounting(String),

    /// A persisted attribute could not be interpreted.
    #[error("invalid attribute: {reason}")]
    InvalidAttribute {
        /// What was wrong with it.
        reason: String,
    },
}
