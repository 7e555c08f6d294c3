//! Files and directories over flakes.
//!
//! A file owns an attribute flake and a data flake. The attribute flake holds
//! the typed [`DeduplicationDescription`]:
//! `[0] tag (0x01 = present), [1] level i8, [2:10) aux i64`, big-endian.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use flakestore_storage::{Flake, FlakeInputStream, FlakeOutputStream};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{FsError, FsResult};
use crate::file_data::FileData;

const DESCRIPTION_TAG: u8 = 0x01;
const DESCRIPTION_SIZE: usize = 10;

/// Deduplication state of a file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeduplicationDescription {
    /// Number of deduplication passes applied to the content.
    pub level: i8,
    /// Byte offset where the raw tail of deduplicated content starts.
    pub aux: i64,
}

impl DeduplicationDescription {
    /// Creates a description.
    pub fn new(level: i8, aux: i64) -> Self {
        Self { level, aux }
    }

    fn encode(&self) -> [u8; DESCRIPTION_SIZE] {
        let mut buffer = [0u8; DESCRIPTION_SIZE];
        buffer[0] = DESCRIPTION_TAG;
        buffer[1] = self.level as u8;
        buffer[2..10].copy_from_slice(&self.aux.to_be_bytes());
        buffer
    }

    fn decode(buffer: &[u8; DESCRIPTION_SIZE]) -> FsResult<Option<Self>> {
        match buffer[0] {
            0 => Ok(None),
            DESCRIPTION_TAG => {
                let mut aux = [0u8; 8];
                aux.copy_from_slice(&buffer[2..10]);
                Ok(Some(Self {
                    level: buffer[1] as i8,
                    aux: i64::from_be_bytes(aux),
                }))
            }
            other => Err(FsError::InvalidAttribute {
                reason: format!("unknown deduplication description tag {:#04x}", other),
            }),
        }
    }
}

/// A file: content in a data flake, attributes in an attribute flake.
pub struct File {
    index: u64,
    parent: u64,
    attributes: Arc<Flake>,
    data: RwLock<Arc<Flake>>,
    locked: AtomicBool,
    deleted: AtomicBool,
    description: Mutex<Option<DeduplicationDescription>>,
}

impl std::fmt::Debug for File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("File")
            .field("index", &self.index)
            .field("parent", &self.parent)
            .field("attributes", &self.attributes.id())
            .field("data", &self.data.read().id())
            .field("locked", &self.is_locked())
            .finish()
    }
}

impl File {
    /// Creates a file over existing flakes.
    pub fn new(index: u64, parent: u64, attributes: Arc<Flake>, data: Arc<Flake>) -> Self {
        Self {
            index,
            parent,
            attributes,
            data: RwLock::new(data),
            locked: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
            description: Mutex::new(None),
        }
    }

    /// Index of the file.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Index of the containing directory.
    pub fn parent(&self) -> u64 {
        self.parent
    }

    /// The attribute flake.
    pub fn attribute_flake(&self) -> &Arc<Flake> {
        &self.attributes
    }

    /// The current data flake.
    pub fn data_flake(&self) -> Arc<Flake> {
        Arc::clone(&self.data.read())
    }

    /// Content length in bytes.
    pub fn len(&self) -> u64 {
        self.data.read().len()
    }

    /// True if the file has no content.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// False once the file or its data flake has been deleted.
    pub fn is_valid(&self) -> bool {
        !self.deleted.load(Ordering::Acquire) && self.data.read().is_valid()
    }

    fn check(&self) -> FsResult<()> {
        if self.deleted.load(Ordering::Acquire) {
            return Err(FsError::FileDeleted { index: self.index });
        }
        Ok(())
    }

    /// Takes the file lock. While it is held no output stream can be opened.
    pub fn lock(self: &Arc<Self>) -> FsResult<FileLock> {
        self.check()?;
        self.locked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| FsError::FileLocked { index: self.index })?;
        Ok(FileLock {
            file: Arc::clone(self),
        })
    }

    /// True while a [`FileLock`] is held.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    /// Reader over the content. Allowed while locked.
    pub fn input_stream(&self) -> FsResult<FlakeInputStream> {
        self.check()?;
        Ok(self.data.read().input_stream())
    }

    /// Writer over the content. Fails while the file is locked.
    pub fn output_stream(&self) -> FsResult<FlakeOutputStream> {
        self.check()?;
        if self.is_locked() {
            return Err(FsError::FileLocked { index: self.index });
        }
        Ok(self.data.read().output_stream())
    }

    /// The file's deduplication description. A file that never had one gets
    /// `(0, 0)`, which is persisted on first access.
    pub fn deduplication_description(&self) -> FsResult<DeduplicationDescription> {
        self.check()?;
        let mut cached = self.description.lock();
        if let Some(description) = *cached {
            return Ok(description);
        }
        let description = match self.read_description()? {
            Some(description) => description,
            None => {
                let description = DeduplicationDescription::default();
                self.attributes.write_at(0, &description.encode())?;
                description
            }
        };
        *cached = Some(description);
        Ok(description)
    }

    /// Replaces and persists the deduplication description.
    pub fn set_deduplication_description(
        &self,
        description: DeduplicationDescription,
    ) -> FsResult<()> {
        self.check()?;
        let mut cached = self.description.lock();
        self.attributes.write_at(0, &description.encode())?;
        *cached = Some(description);
        Ok(())
    }

    fn read_description(&self) -> FsResult<Option<DeduplicationDescription>> {
        if self.attributes.len() < DESCRIPTION_SIZE as u64 {
            return Ok(None);
        }
        let mut buffer = [0u8; DESCRIPTION_SIZE];
        self.attributes.read_at(0, &mut buffer)?;
        DeduplicationDescription::decode(&buffer)
    }

    /// Makes `flake` the file's content and returns the previous data flake
    /// untouched. Only the holder of this file's lock may swap the content.
    pub fn swap_data_flake(&self, lock: &FileLock, flake: Arc<Flake>) -> FsResult<Arc<Flake>> {
        self.check()?;
        if !std::ptr::eq(Arc::as_ptr(&lock.file), self) {
            return Err(FsError::FileLocked { index: self.index });
        }
        let new = flake.id();
        let old = std::mem::replace(&mut *self.data.write(), flake);
        debug!(index = self.index, old = %old.id(), %new, "swapped file content");
        Ok(old)
    }

    /// Makes `flake` the file's content and deletes the previous data flake.
    pub fn replace_data_flake(&self, lock: &FileLock, flake: Arc<Flake>) -> FsResult<()> {
        let old = self.swap_data_flake(lock, flake)?;
        if old.is_valid() {
            old.delete()?;
        }
        Ok(())
    }

    /// The record describing this file in the file table.
    pub fn file_data(&self) -> FileData {
        let data = self.data.read();
        FileData {
            index: self.index,
            attribute_flake_id: self.attributes.id(),
            data_flake_id: data.id(),
            parent_directory_id: self.parent,
            is_empty: data.is_empty(),
        }
    }

    /// Deletes both flakes and invalidates the file.
    pub fn delete(&self) -> FsResult<()> {
        if self.deleted.swap(true, Ordering::AcqRel) {
            return Err(FsError::FileDeleted { index: self.index });
        }
        let data = self.data.read();
        if data.is_valid() {
            data.delete()?;
        }
        if self.attributes.is_valid() {
            self.attributes.delete()?;
        }
        debug!(index = self.index, "deleted file");
        Ok(())
    }
}

/// Exclusive lock on a file, released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: Arc<File>,
}

impl FileLock {
    /// The locked file.
    pub fn file(&self) -> &Arc<File> {
        &self.file
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        self.file.locked.store(false, Ordering::Release);
    }
}

/// A directory holding child nodes.
#[derive(Debug)]
pub struct Directory {
    index: u64,
    children: RwLock<Vec<Node>>,
}

impl Directory {
    /// Creates an empty directory.
    pub fn new(index: u64) -> Self {
        Self {
            index,
            children: RwLock::new(Vec::new()),
        }
    }

    /// Index of the directory.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Appends a child.
    pub fn add_child(&self, node: Node) {
        self.children.write().push(node);
    }

    /// Removes `node` if it is a child. Returns whether it was.
    pub fn remove_child(&self, node: &Node) -> bool {
        let mut children = self.children.write();
        let before = children.len();
        children.retain(|child| !child.is_same(node));
        children.len() != before
    }

    /// Snapshot of the children.
    pub fn child_nodes(&self) -> Vec<Node> {
        self.children.read().clone()
    }
}

/// A node of the file tree.
#[derive(Debug, Clone)]
pub enum Node {
    /// A file.
    File(Arc<File>),
    /// A directory.
    Directory(Arc<Directory>),
}

impl Node {
    /// Index of the file or directory.
    pub fn index(&self) -> u64 {
        match self {
            Node::File(file) => file.index(),
            Node::Directory(directory) => directory.index(),
        }
    }

    /// The file, if this node is one.
    pub fn as_file(&self) -> Option<&Arc<File>> {
        match self {
            Node::File(file) => Some(file),
            Node::Directory(_) => None,
        }
    }

    /// The directory, if this node is one.
    pub fn as_directory(&self) -> Option<&Arc<Directory>> {
        match self {
            Node::File(_) => None,
            Node::Directory(directory) => Some(directory),
        }
    }

    /// True if both refer to the same file or directory.
    pub fn is_same(&self, other: &Node) -> bool {
        match (self, other) {
            (Node::File(a), Node::File(b)) => Arc::ptr_eq(a, b),
            (Node::Directory(a), Node::Directory(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// A tree of nodes with a single root directory.
pub trait FileTree: Send + Sync {
    /// The root directory.
    fn root(&self) -> Arc<Directory>;

    /// Called after the content flake of `file` was swapped and before the
    /// previous one is deleted. An error rolls the swap back.
    fn content_replaced(&self, file: &File) -> FsResult<()> {
        let _ = file;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flakestore_storage::{CreateFlake, StorageConfig, StorageEngine};
    use std::io::{Read, Write};

    fn new_file(engine: &StorageEngine, index: u64) -> Arc<File> {
        Arc::new(File::new(
            index,
            0,
            engine.create_flake().unwrap(),
            engine.create_flake().unwrap(),
        ))
    }

    fn engine(dir: &std::path::Path) -> StorageEngine {
        StorageEngine::open(StorageConfig {
            minimum_chunk_size: 64,
            ..StorageConfig::in_directory(dir)
        })
        .unwrap()
    }

    #[test]
    fn test_lock_blocks_output_not_input() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let file = new_file(&engine, 1);
        file.output_stream().unwrap().write_all(b"content").unwrap();

        let lock = file.lock().unwrap();
        assert!(file.is_locked());
        assert!(matches!(file.lock(), Err(FsError::FileLocked { index: 1 })));
        assert!(matches!(
            file.output_stream(),
            Err(FsError::FileLocked { .. })
        ));
        let mut content = String::new();
        file.input_stream()
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "content");

        drop(lock);
        assert!(!file.is_locked());
        assert!(file.output_stream().is_ok());
    }

    #[test]
    fn test_description_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let file = new_file(&engine, 1);
        let first = file.deduplication_description().unwrap();
        let second = file.deduplication_description().unwrap();
        assert_eq!(first, DeduplicationDescription::new(0, 0));
        assert_eq!(first, second);

        file.set_deduplication_description(DeduplicationDescription::new(3, 800))
            .unwrap();
        assert_eq!(
            file.deduplication_description().unwrap(),
            DeduplicationDescription::new(3, 800)
        );
    }

    #[test]
    fn test_description_persisted_in_attribute_flake() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let attributes = engine.create_flake().unwrap();
        let data = engine.create_flake().unwrap();
        let file = File::new(1, 0, Arc::clone(&attributes), Arc::clone(&data));
        file.set_deduplication_description(DeduplicationDescription::new(-2, -5))
            .unwrap();

        let reloaded = File::new(1, 0, attributes, data);
        assert_eq!(
            reloaded.deduplication_description().unwrap(),
            DeduplicationDescription::new(-2, -5)
        );
    }

    #[test]
    fn test_unknown_description_tag() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let file = new_file(&engine, 1);
        file.attribute_flake().write_at(0, &[0x7F; 10]).unwrap();
        assert!(matches!(
            file.deduplication_description(),
            Err(FsError::InvalidAttribute { .. })
        ));
    }

    #[test]
    fn test_replace_data_flake_requires_own_lock() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let file = new_file(&engine, 1);
        let other = new_file(&engine, 2);
        let old = file.data_flake();
        old.write_at(0, b"old").unwrap();

        let replacement = engine.create_flake().unwrap();
        replacement.write_at(0, b"new!").unwrap();
        let foreign = other.lock().unwrap();
        assert!(file
            .replace_data_flake(&foreign, Arc::clone(&replacement))
            .is_err());

        let lock = file.lock().unwrap();
        file.replace_data_flake(&lock, Arc::clone(&replacement))
            .unwrap();
        assert!(!old.is_valid());
        assert_eq!(file.len(), 4);
        assert_eq!(file.file_data().data_flake_id, replacement.id());
    }

    #[test]
    fn test_swap_keeps_previous_flake() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let file = new_file(&engine, 1);
        let original = file.data_flake();
        original.write_at(0, b"kept").unwrap();
        let replacement = engine.create_flake().unwrap();

        let lock = file.lock().unwrap();
        let previous = file.swap_data_flake(&lock, Arc::clone(&replacement)).unwrap();
        assert!(Arc::ptr_eq(&previous, &original));
        assert!(previous.is_valid());
        assert!(file.is_empty());

        file.swap_data_flake(&lock, previous).unwrap();
        assert_eq!(file.len(), 4);
        assert_eq!(file.file_data().data_flake_id, original.id());
    }

    #[test]
    fn test_delete_file() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let file = new_file(&engine, 1);
        file.output_stream().unwrap().write_all(&[1; 100]).unwrap();
        file.delete().unwrap();
        assert!(!file.is_valid());
        assert!(matches!(file.lock(), Err(FsError::FileDeleted { .. })));
        assert!(file.delete().is_err());
        assert_eq!(engine.flake_count(), 0);
    }

    #[test]
    fn test_directory_children() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let root = Arc::new(Directory::new(0));
        let sub = Arc::new(Directory::new(1));
        let file = Node::File(new_file(&engine, 5));
        root.add_child(Node::Directory(Arc::clone(&sub)));
        root.add_child(file.clone());
        assert_eq!(root.child_nodes().len(), 2);
        assert_eq!(file.index(), 5);
        assert!(file.as_file().is_some());
        assert!(root.remove_child(&file));
        assert!(!root.remove_child(&file));
        assert_eq!(root.child_nodes().len(), 1);
        assert!(root.child_nodes()[0].as_directory().is_some());
    }
}
