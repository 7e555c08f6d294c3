//! Cursor into the logical byte space of a flake.

use std::sync::Arc;

use crate::chunk::FlakeId;
use crate::error::{StorageError, StorageResult};
use crate::flake::Flake;

/// A logical position inside a flake. Translation to a physical position is
/// done on demand, so a pointer stays valid when the flake's chunk layout
/// changes.
#[derive(Debug, Clone)]
pub struct DataPointer {
    flake: Arc<Flake>,
    position: u64,
}

impl DataPointer {
    /// Pointer to the start of `flake`.
    pub fn new(flake: Arc<Flake>) -> Self {
        Self { flake, position: 0 }
    }

    /// The flake this pointer moves in.
    pub fn flake(&self) -> &Arc<Flake> {
        &self.flake
    }

    /// Identification of the flake.
    pub fn flake_id(&self) -> FlakeId {
        self.flake.id()
    }

    /// Current logical position.
    pub fn position_in_flake(&self) -> u64 {
        self.position
    }

    /// Current length of the flake.
    pub fn flake_length(&self) -> u64 {
        self.flake.len()
    }

    /// Bytes between the position and the end of the flake.
    pub fn remaining_bytes(&self) -> u64 {
        self.flake_length().saturating_sub(self.position)
    }

    /// Moves to the current end of the flake.
    pub fn seek_eof(&mut self) {
        self.position = self.flake_length();
    }

    /// Moves by `delta` bytes. The target must lie in `[0, length]`.
    pub fn change_position(&mut self, delta: i64) -> StorageResult<()> {
        let target = self.position as i128 + delta as i128;
        self.move_to(target)
    }

    /// Moves to `position`, which must lie in `[0, length]`.
    pub fn set_position(&mut self, position: u64) -> StorageResult<()> {
        self.move_to(position as i128)
    }

    fn move_to(&mut self, target: i128) -> StorageResult<()> {
        let length = self.flake_length();
        if target < 0 || target > length as i128 {
            return Err(StorageError::PositionOutOfRange {
                flake_id: self.flake_id(),
                position: target,
                length,
            });
        }
        self.position = target as u64;
        Ok(())
    }

    /// Moves forward after a write that extended the flake up to here.
    pub(crate) fn advance(&mut self, count: u64) {
        self.position += count;
    }

    /// Data file position backing the current logical position, if any.
    pub fn physical_position(&self) -> Option<u64> {
        self.flake.physical_position(self.position)
    }
}
