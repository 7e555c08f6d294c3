//! The persisted record of a file.
//!
//! Layout (25 bytes, big-endian):
//! - `[0:8)` attribute flake identification
//! - `[8:16)` data flake identification
//! - `[16:24)` parent directory index
//! - `[24]` flags, bit 0 = file is empty

use flakestore_storage::FlakeId;
use serde::{Deserialize, Serialize};

use crate::error::FsResult;
use crate::record::{check_width, get_u64, put_u64, FixedRecord};

const ATTRIBUTE_FLAKE_POSITION: usize = 0;
const DATA_FLAKE_POSITION: usize = 8;
const PARENT_DIRECTORY_POSITION: usize = 16;
const FLAGS_POSITION: usize = 24;

const FLAG_IS_EMPTY: u8 = 0x01;

/// Where the content and attributes of a file live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileData {
    /// Index of the file, also its slot in the file table.
    pub index: u64,
    /// Flake holding the file's attributes.
    pub attribute_flake_id: FlakeId,
    /// Flake holding the file's content.
    pub data_flake_id: FlakeId,
    /// Index of the directory containing the file.
    pub parent_directory_id: u64,
    /// Whether the file has no content.
    pub is_empty: bool,
}

impl FixedRecord for FileData {
    const SIZE: usize = 25;

    fn index(&self) -> u64 {
        self.index
    }

    fn encode(&self, buffer: &mut [u8]) {
        put_u64(buffer, ATTRIBUTE_FLAKE_POSITION, self.attribute_flake_id.get());
        put_u64(buffer, DATA_FLAKE_POSITION, self.data_flake_id.get());
        put_u64(buffer, PARENT_DIRECTORY_POSITION, self.parent_directory_id);
        buffer[FLAGS_POSITION] = if self.is_empty { FLAG_IS_EMPTY } else { 0 };
    }

    fn decode(index: u64, buffer: &[u8]) -> FsResult<Self> {
        check_width(Self::SIZE, buffer)?;
        Ok(Self {
            index,
            attribute_flake_id: FlakeId::new(get_u64(buffer, ATTRIBUTE_FLAKE_POSITION)),
            data_flake_id: FlakeId::new(get_u64(buffer, DATA_FLAKE_POSITION)),
            parent_directory_id: get_u64(buffer, PARENT_DIRECTORY_POSITION),
            is_empty: buffer[FLAGS_POSITION] & FLAG_IS_EMPTY != 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FsError;

    fn roundtrip(record: FileData) -> FileData {
        let mut buffer = [0u8; FileData::SIZE];
        record.encode(&mut buffer);
        FileData::decode(record.index, &buffer).unwrap()
    }

    #[test]
    fn test_boundary_values() {
        for (ids, parent, is_empty) in [
            (0u64, 0u64, false),
            (u64::MAX, u64::MAX, true),
            (i64::MAX as u64, 1, true),
        ] {
            let record = FileData {
                index: 3,
                attribute_flake_id: FlakeId::new(ids),
                data_flake_id: FlakeId::new(ids),
                parent_directory_id: parent,
                is_empty,
            };
            assert_eq!(roundtrip(record), record);
        }
    }

    #[test]
    fn test_layout() {
        let record = FileData {
            index: 0,
            attribute_flake_id: FlakeId::new(1),
            data_flake_id: FlakeId::new(2),
            parent_directory_id: 3,
            is_empty: true,
        };
        let mut buffer = [0u8; FileData::SIZE];
        record.encode(&mut buffer);
        assert_eq!(buffer[7], 1);
        assert_eq!(buffer[15], 2);
        assert_eq!(buffer[23], 3);
        assert_eq!(buffer[24], 1);
    }

    #[test]
    fn test_wrong_width() {
        assert!(matches!(
            FileData::decode(0, &[1u8; 24]),
            Err(FsError::Decode {
                expected: 25,
                actual: 24
            })
        ));
    }
}
