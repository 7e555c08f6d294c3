//! Error types for the deduplication subsystem

use flakestore_fs::FsError;
use flakestore_storage::StorageError;

use crate::manager::ManagerState;

/// Result type alias for deduplication operations.
pub type ReduceResult<T> = Result<T, ReduceError>;

/// All errors that can occur while deduplicating or expanding files
#[derive(Debug, thiserror::Error)]
pub enum ReduceError {
    /// Storage layer failure
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    /// Table or file veneer failure
    #[error("file system error: {0}")]
    Fs(#[from] FsError),
    /// Another pass would push the level past the signed 8-bit range
    #[error("file {index} is at deduplication level {level}, which cannot be raised")]
    LevelOverflow {
        /// Index of the file.
        index: u64,
        /// Current level.
        level: i8,
    },
    /// Expansion was requested for content that was never deduplicated
    #[error("file {index} is not deduplicated")]
    NotDeduplicated {
        /// Index of the file.
        index: u64,
    },
    /// The reference section of a deduplicated file is not known
    #[error("file {index} at level {level} has no recorded reference section")]
    UnknownReferenceSection {
        /// Index of the file.
        index: u64,
        /// Current level.
        level: i8,
    },
    /// A reference points at no stored block
    #[error("no deduplication block stored at index {index}")]
    UnknownBlock {
        /// The dangling block index.
        index: u64,
    },
    /// Deduplicated content does not match its description
    #[error("corrupted deduplicated content in file {index}: {reason}")]
    Corrupted {
        /// Index of the file.
        index: u64,
        /// What was inconsistent.
        reason: String,
    },
    /// A block buffer had the wrong width
    #[error("block must be {expected} bytes, got {actual}")]
    BlockSize {
        /// Block size.
        expected: usize,
        /// Width that was provided.
        actual: usize,
    },
    /// The block is already stored in the table
    #[error("block already registered at index {index}")]
    AlreadyRegistered {
        /// Index of the stored block.
        index: u64,
    },
    /// Operation not allowed in the manager's current state
    #[error("cannot {operation} a deduplication manager in state {state:?}")]
    InvalidState {
        /// The attempted operation.
        operation: &'static str,
        /// State at the time of the call.
        state: ManagerState,
    },
    /// Background tasks need a tokio runtime
    #[error("no tokio runtime available: {0}")]
    NoRuntime(String),
    /// A blocking worker panicked or was cancelled
    #[error("deduplication worker failed: {0}")]
    Worker(String),
}

impl From<tokio::task::JoinError> for ReduceError {
    fn from(e: tokio::task::JoinError) -> Self {
        ReduceError::Worker(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_panicked_task_becomes_worker_error() {
        let joined = tokio::spawn(async { panic!("worker exploded") }).await;
        let err: ReduceError = joined.unwrap_err().into();
        assert!(matches!(err, ReduceError::Worker(_)));
        assert!(err.to_string().contains("panicked"));
    }

    #[test]
    fn test_fs_error_wraps() {
        let err: ReduceError = FsError::FileLocked { index: 4 }.into();
        assert!(matches!(err, ReduceError::Fs(FsError::FileLocked { index: 4 })));
        assert!(err.to_string().contains("file 4 is locked"));
    }

    #[test]
    fn test_level_overflow_message() {
        let err = ReduceError::LevelOverflow {
            index: 9,
            level: i8::MAX,
        };
        assert_eq!(
            err.to_string(),
            "file 9 is at deduplication level 127, which cannot be raised"
        );
    }

    #[test]
    fn test_invalid_state_message() {
        let err = ReduceError::InvalidState {
            operation: "close",
            state: ManagerState::None,
        };
        assert_eq!(
            err.to_string(),
            "cannot close a deduplication manager in state None"
        );
    }
}
