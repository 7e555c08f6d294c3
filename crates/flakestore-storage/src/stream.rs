//! Sequential read and buffered write views over a flake.
//!
//! Streams are not synchronized with each other. Callers sharing a flake
//! between streams guard the whole sequence of operations with their own lock.

use std::io::{self, Read, Seek, SeekFrom, Write};

use tracing::warn;

use crate::error::{StorageError, StorageResult};
use crate::flake::WriteAt;
use crate::pointer::DataPointer;

/// Default size of the output stream write buffer.
pub const DEFAULT_OUTPUT_BUFFER_SIZE: usize = 8192;

fn to_io(error: StorageError) -> io::Error {
    match error {
        StorageError::IoError(e) => e,
        StorageError::Io { source, .. } => source,
        other => io::Error::other(other),
    }
}

/// Reads a flake front to back.
#[derive(Debug)]
pub struct FlakeInputStream {
    pointer: DataPointer,
}

impl FlakeInputStream {
    /// Stream reading from the pointer's position.
    pub fn new(pointer: DataPointer) -> Self {
        Self { pointer }
    }

    /// The stream's cursor.
    pub fn pointer(&self) -> &DataPointer {
        &self.pointer
    }

    /// Moves the cursor, see [`DataPointer::set_position`].
    pub fn set_position(&mut self, position: u64) -> StorageResult<()> {
        self.pointer.set_position(position)
    }

    /// Fills `buffer` completely or fails without moving the cursor.
    pub fn read_complete(&mut self, buffer: &mut [u8]) -> StorageResult<()> {
        let remaining = self.pointer.remaining_bytes();
        if remaining < buffer.len() as u64 {
            return Err(StorageError::Decode {
                expected: buffer.len(),
                actual: remaining as usize,
            });
        }
        let read = self
            .pointer
            .flake()
            .read_at(self.pointer.position_in_flake(), buffer)?;
        self.pointer.advance(read as u64);
        Ok(())
    }
}

impl Read for FlakeInputStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self
            .pointer
            .flake()
            .read_at(self.pointer.position_in_flake(), buf)
            .map_err(to_io)?;
        self.pointer.advance(read as u64);
        Ok(read)
    }
}

impl Seek for FlakeInputStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match pos {
            SeekFrom::Start(position) => self.pointer.set_position(position),
            SeekFrom::End(delta) => {
                self.pointer.seek_eof();
                self.pointer.change_position(delta)
            }
            SeekFrom::Current(delta) => self.pointer.change_position(delta),
        }
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        Ok(self.pointer.position_in_flake())
    }
}

/// Buffered writer into a flake. Pending bytes are written on
/// [`Write::flush`], on any repositioning and on drop.
#[derive(Debug)]
pub struct FlakeOutputStream {
    pointer: DataPointer,
    buffer: Vec<u8>,
    buffer_size: usize,
}

impl FlakeOutputStream {
    /// Stream writing at the pointer's position.
    pub fn new(pointer: DataPointer) -> Self {
        Self::with_buffer_size(pointer, DEFAULT_OUTPUT_BUFFER_SIZE)
    }

    /// Stream with a custom buffer size.
    pub fn with_buffer_size(pointer: DataPointer, buffer_size: usize) -> Self {
        Self {
            pointer,
            buffer: Vec::with_capacity(buffer_size),
            buffer_size: buffer_size.max(1),
        }
    }

    /// Logical position the next byte lands at.
    pub fn position(&self) -> u64 {
        self.pointer.position_in_flake() + self.buffer.len() as u64
    }

    /// Writes out buffered bytes.
    pub fn flush_buffer(&mut self) -> StorageResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let flake = std::sync::Arc::clone(self.pointer.flake());
        flake.write(&mut self.pointer, &self.buffer)?;
        self.buffer.clear();
        Ok(())
    }

    /// Moves to the end of the flake for appending.
    pub fn seek_eof(&mut self) -> StorageResult<()> {
        self.flush_buffer()?;
        self.pointer.seek_eof();
        Ok(())
    }

    /// Moves to `position`, which must lie in `[0, length]`.
    pub fn set_position(&mut self, position: u64) -> StorageResult<()> {
        self.flush_buffer()?;
        self.pointer.set_position(position)
    }

    /// Makes sure at least `count` bytes lie between the position and the end
    /// of the flake, extending it with zeros if needed.
    pub fn ensure_remaining_capacity(&mut self, count: u64) -> StorageResult<()> {
        self.flush_buffer()?;
        let needed = self.pointer.position_in_flake() + count;
        let flake = self.pointer.flake();
        if flake.len() < needed {
            flake.set_length(needed)?;
        }
        Ok(())
    }

    /// Cuts the flake at the current position and releases the storage behind it.
    pub fn trim(&mut self) -> StorageResult<()> {
        self.flush_buffer()?;
        let position = self.pointer.position_in_flake();
        self.pointer.flake().trim_to(position)
    }

    /// Writes `data` at the current position.
    pub fn write_all_bytes(&mut self, data: &[u8]) -> StorageResult<()> {
        if self.buffer.len() + data.len() > self.buffer_size {
            self.flush_buffer()?;
        }
        if data.len() >= self.buffer_size {
            let flake = std::sync::Arc::clone(self.pointer.flake());
            return flake.write(&mut self.pointer, data);
        }
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    /// The stream's cursor. Buffered bytes are not yet reflected in it.
    pub fn pointer(&self) -> &DataPointer {
        &self.pointer
    }

    /// Forgets buffered bytes without writing them.
    pub fn discard_buffer(&mut self) {
        self.buffer.clear();
    }

    /// Drops the stream without writing buffered bytes.
    pub fn discard(mut self) {
        self.discard_buffer();
    }
}

impl Write for FlakeOutputStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_all_bytes(buf).map_err(to_io)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_buffer().map_err(to_io)
    }
}

impl Drop for FlakeOutputStream {
    fn drop(&mut self) {
        if let Err(e) = self.flush_buffer() {
            warn!(
                flake_id = %self.pointer.flake_id(),
                error = %e,
                lost = self.buffer.len(),
                "failed to flush flake output stream on drop"
            );
        }
    }
}
