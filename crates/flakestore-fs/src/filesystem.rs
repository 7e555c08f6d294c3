//! A file tree whose file records live in a [`DataTable`] of [`FileData`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use flakestore_storage::{CreateFlake, FlakeId, StorageEngine};
use tracing::{debug, warn};

use crate::error::FsResult;
use crate::file_data::FileData;
use crate::node::{Directory, File, FileTree, Node};
use crate::table::DataTable;

/// Index of the root directory.
pub const ROOT_DIRECTORY_INDEX: u64 = 0;

/// Files and directories over one storage engine.
///
/// File records are persisted in the file table; the directory structure is
/// kept in memory and files are reattached with [`FileSystem::load_file`].
pub struct FileSystem {
    engine: Arc<StorageEngine>,
    files: DataTable<FileData>,
    root: Arc<Directory>,
    next_directory: AtomicU64,
}

impl FileSystem {
    /// Opens the file table stored in `file_table` and creates an empty root.
    pub fn open(engine: Arc<StorageEngine>, file_table: FlakeId) -> FsResult<Self> {
        let flake = engine.open_flake(file_table)?;
        let files = DataTable::with_config(flake, engine.config())?;
        Ok(Self {
            engine,
            files,
            root: Arc::new(Directory::new(ROOT_DIRECTORY_INDEX)),
            next_directory: AtomicU64::new(ROOT_DIRECTORY_INDEX + 1),
        })
    }

    /// The storage engine.
    pub fn engine(&self) -> &Arc<StorageEngine> {
        &self.engine
    }

    /// The table of file records.
    pub fn file_table(&self) -> &DataTable<FileData> {
        &self.files
    }

    /// Creates an empty directory below `parent`.
    pub fn create_directory(&self, parent: &Arc<Directory>) -> Arc<Directory> {
        let index = self.next_directory.fetch_add(1, Ordering::Relaxed);
        let directory = Arc::new(Directory::new(index));
        parent.add_child(Node::Directory(Arc::clone(&directory)));
        directory
    }

    /// Creates an empty file below `parent` and persists its record.
    pub fn create_file(&self, parent: &Arc<Directory>) -> FsResult<Arc<File>> {
        let index = self.files.available_index()?;
        let attributes = self.engine.create_flake()?;
        let data = self.engine.create_flake()?;
        let file = Arc::new(File::new(index, parent.index(), attributes, data));
        if let Err(e) = self.files.save(&file.file_data()) {
            if let Err(cleanup) = file.delete() {
                warn!(index, error = %cleanup, "failed to release flakes of unsaved file");
            }
            return Err(e);
        }
        parent.add_child(Node::File(Arc::clone(&file)));
        debug!(index, parent = parent.index(), "created file");
        Ok(file)
    }

    /// Rebuilds the file stored at `index` and attaches it to `parent`.
    pub fn load_file(&self, index: u64, parent: &Arc<Directory>) -> FsResult<Arc<File>> {
        let record = self.files.load(index)?;
        let attributes = self.engine.open_flake(record.attribute_flake_id)?;
        let data = self.engine.open_flake(record.data_flake_id)?;
        let file = Arc::new(File::new(
            index,
            record.parent_directory_id,
            attributes,
            data,
        ));
        parent.add_child(Node::File(Arc::clone(&file)));
        Ok(file)
    }

    /// Rewrites the record of `file`, e.g. after its content flake changed.
    pub fn save_file(&self, file: &File) -> FsResult<()> {
        self.files.save(&file.file_data())
    }

    /// Deletes `file`, its flakes and its record.
    pub fn delete_file(&self, parent: &Arc<Directory>, file: &Arc<File>) -> FsResult<()> {
        file.delete()?;
        self.files.delete(file.index())?;
        parent.remove_child(&Node::File(Arc::clone(file)));
        debug!(index = file.index(), "deleted file");
        Ok(())
    }
}

impl FileTree for FileSystem {
    fn root(&self) -> Arc<Directory> {
        Arc::clone(&self.root)
    }

    fn content_replaced(&self, file: &File) -> FsResult<()> {
        self.save_file(file)
    }
}
