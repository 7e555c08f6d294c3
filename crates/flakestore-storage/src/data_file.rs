//! The single physical data file all chunks live in.
//!
//! Positioned reads and writes go through `pread`/`pwrite` so they do not
//! serialize on a shared cursor; only resizing takes the length lock.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{StorageError, StorageResult};

/// Injects write failures into a [`DataFile`], used to exercise rollback paths.
#[cfg(any(test, feature = "testing"))]
#[derive(Debug, Default)]
pub struct FaultInjector {
    write_budget: Mutex<Option<u64>>,
}

#[cfg(any(test, feature = "testing"))]
impl FaultInjector {
    /// Lets `bytes` more bytes be written, then fails every write.
    pub fn fail_writes_after(&self, bytes: u64) {
        *self.write_budget.lock() = Some(bytes);
    }

    /// Disables fault injection.
    pub fn clear(&self) {
        *self.write_budget.lock() = None;
    }

    fn charge(&self, len: u64) -> std::io::Result<()> {
        let mut budget = self.write_budget.lock();
        match budget.as_mut() {
            None => Ok(()),
            Some(remaining) if *remaining >= len => {
                *remaining -= len;
                Ok(())
            }
            Some(remaining) => {
                *remaining = 0;
                Err(std::io::Error::other("injected write failure"))
            }
        }
    }
}

/// Growable data file addressed by absolute byte positions.
#[derive(Debug)]
pub struct DataFile {
    path: PathBuf,
    file: File,
    length: Mutex<u64>,
    #[cfg(any(test, feature = "testing"))]
    faults: FaultInjector,
}

impl DataFile {
    /// Opens the data file at `path`, creating it if needed.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| StorageError::io(format!("opening {}", path.display()), e))?;
        let length = file
            .metadata()
            .map_err(|e| StorageError::io(format!("reading metadata of {}", path.display()), e))?
            .len();
        debug!(path = %path.display(), length, "opened data file");
        Ok(Self {
            path: path.to_path_buf(),
            file,
            length: Mutex::new(length),
            #[cfg(any(test, feature = "testing"))]
            faults: FaultInjector::default(),
        })
    }

    /// Path of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current physical length in bytes.
    pub fn len(&self) -> u64 {
        *self.length.lock()
    }

    /// True if the file holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fault injection hooks for this file.
    #[cfg(any(test, feature = "testing"))]
    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// Reads exactly `buffer.len()` bytes starting at `position`.
    pub fn read_at(&self, position: u64, buffer: &mut [u8]) -> StorageResult<()> {
        self.file.read_exact_at(buffer, position).map_err(|e| {
            StorageError::io(
                format!(
                    "reading {} bytes at {} from {}",
                    buffer.len(),
                    position,
                    self.path.display()
                ),
                e,
            )
        })
    }

    /// Writes all of `buffer` starting at `position`.
    pub fn write_at(&self, position: u64, buffer: &[u8]) -> StorageResult<()> {
        let context = || {
            format!(
                "writing {} bytes at {} to {}",
                buffer.len(),
                position,
                self.path.display()
            )
        };
        #[cfg(any(test, feature = "testing"))]
        self.faults
            .charge(buffer.len() as u64)
            .map_err(|e| StorageError::io(context(), e))?;
        self.file
            .write_all_at(buffer, position)
            .map_err(|e| StorageError::io(context(), e))
    }

    /// Overwrites `[position, position + length)` with zeros using `clear_buffer`.
    pub fn clear(&self, position: u64, length: u64, clear_buffer: &[u8]) -> StorageResult<()> {
        let mut done = 0u64;
        while done < length {
            let step = (length - done).min(clear_buffer.len() as u64) as usize;
            self.write_at(position + done, &clear_buffer[..step])?;
            done += step as u64;
        }
        Ok(())
    }

    /// Resizes the file to `new_length` bytes.
    pub fn set_len(&self, new_length: u64) -> StorageResult<()> {
        let mut length = self.length.lock();
        self.file.set_len(new_length).map_err(|e| {
            StorageError::io(
                format!("resizing {} to {} bytes", self.path.display(), new_length),
                e,
            )
        })?;
        debug!(path = %self.path.display(), from = *length, to = new_length, "resized data file");
        *length = new_length;
        Ok(())
    }

    /// Flushes file content and metadata to disk.
    pub fn sync(&self) -> StorageResult<()> {
        self.file
            .sync_all()
            .map_err(|e| StorageError::io(format!("syncing {}", self.path.display()), e))
    }
}
