//! Error types for the storage subsystem.

use thiserror::Error;

use crate::chunk::{ChunkId, FlakeId};

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Error variants for storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Wraps standard I/O errors that carry no further context.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// An I/O failure on the data file or chunk table, with the failing operation.
    #[error("I/O error while {context}: {source}")]
    Io {
        /// What was being done, including the path or flake involved.
        context: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The flake has been deleted and can no longer be used.
    #[error("Flake {flake_id} has been deleted")]
    FlakeDeleted {
        /// The deleted flake.
        flake_id: FlakeId,
    },

    /// No flake with this identification is registered.
    #[error("Flake not found: {flake_id}")]
    FlakeNotFound {
        /// The requested flake.
        flake_id: FlakeId,
    },

    /// The chunk is not registered in chunk memory.
    #[error("Chunk not found: {chunk_id}")]
    ChunkNotFound {
        /// The requested chunk.
        chunk_id: ChunkId,
    },

    /// A chunk was deleted twice.
    #[error("Chunk {chunk_id} was already released")]
    DoubleFree {
        /// The chunk that was released a second time.
        chunk_id: ChunkId,
    },

    /// A data pointer was moved outside of `[0, length]`.
    #[error("Position {position} is outside of flake {flake_id} with length {length}")]
    PositionOutOfRange {
        /// The flake the pointer belongs to.
        flake_id: FlakeId,
        /// The rejected position.
        position: i128,
        /// The flake length at the time of the move.
        length: u64,
    },

    /// A configuration value violates its bounds.
    #[error("Invalid configuration value for {name}: {reason}")]
    InvalidConfig {
        /// Name of the configuration element.
        name: &'static str,
        /// Why the value was rejected.
        reason: String,
    },

    /// A fixed width buffer did not have the declared size.
    #[error("Decode error: expected {expected} bytes, got {actual}")]
    Decode {
        /// Declared width.
        expected: usize,
        /// Width that was available.
        actual: usize,
    },

    /// The free index bookkeeping disagrees with the backing storage.
    #[error("Free range accounting error: {0}")]
    RangeAccounting(String),

    /// The chunk table header is corrupted or of an unknown version.
    #[error("Corrupted chunk table: {reason}")]
    CorruptedChunkTable {
        /// Description of the corruption.
        reason: String,
    },

    /// Serialization/deserialization error.
    #[error("Serialization error: {reason}")]
    SerializationError {
        /// Description of the error.
        reason: String,
    },
}

impl StorageError {
    /// Wraps an I/O error together with the operation that failed.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        StorageError::Io {
            context: context.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_result_alias() {
        let ok: StorageResult<i32> = Ok(42);
        assert!(ok.is_ok());

        let err: StorageResult<i32> = Err(StorageError::RangeAccounting("x".into()));
        assert!(err.is_err());
    }

    #[test]
    fn test_io_error_from_std() {
        let std_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let storage_err = StorageError::from(std_err);
        assert!(matches!(storage_err, StorageError::IoError(_)));
    }

    #[test]
    fn test_io_with_context() {
        let std_err = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err = StorageError::io("writing /tmp/data.bin", std_err);
        let msg = format!("{}", err);
        assert!(msg.contains("/tmp/data.bin"));
        assert!(msg.contains("disk gone"));
    }

    #[test]
    fn test_flake_deleted() {
        let err = StorageError::FlakeDeleted {
            flake_id: FlakeId::new(7),
        };
        assert_eq!(format!("{}", err), "Flake Flake(7) has been deleted");
    }

    #[test]
    fn test_position_out_of_range() {
        let err = StorageError::PositionOutOfRange {
            flake_id: FlakeId::new(3),
            position: -1,
            length: 10,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("-1"));
        assert!(msg.contains("10"));
    }

    #[test]
    fn test_decode() {
        let err = StorageError::Decode {
            expected: 25,
            actual: 24,
        };
        assert_eq!(format!("{}", err), "Decode error: expected 25 bytes, got 24");
    }

    #[test]
    fn test_double_free() {
        let err = StorageError::DoubleFree {
            chunk_id: ChunkId::new(12),
        };
        assert!(format!("{}", err).contains("Chunk(12)"));
    }
}
