#![warn(missing_docs)]

//! Flakestore file layer: fixed-record data tables and a file/directory veneer over flakes
//!
//! Tables store fixed-width binary records in one flake and recycle freed
//! slots before growing. Files own a data flake and an attribute flake and
//! can be locked against output while their content is rewritten.

pub mod error;
pub mod file_data;
pub mod filesystem;
pub mod node;
pub mod record;
pub mod table;

pub use error::{FsError, FsResult};
pub use file_data::FileData;
pub use filesystem::{FileSystem, ROOT_DIRECTORY_INDEX};
pub use node::{DeduplicationDescription, Directory, File, FileLock, FileTree, Node};
pub use record::{check_width, FixedRecord};
pub use table::{DataTable, TrimOutcome};
