//! Fixed-width binary records stored in a [`crate::table::DataTable`].

use crate::error::{FsError, FsResult};

/// A record with a constant serialized width, addressed by a stable index.
///
/// Encodings are written at absolute byte offsets and never contain
/// variable-length fields. An all-zero encoding marks a free slot, so a real
/// record must never encode to all zero bytes.
pub trait FixedRecord: Sized + Send + Sync {
    /// Serialized width in bytes.
    const SIZE: usize;

    /// Slot of the record in its table.
    fn index(&self) -> u64;

    /// Writes the record into `buffer`, which is exactly [`FixedRecord::SIZE`] bytes.
    fn encode(&self, buffer: &mut [u8]);

    /// Reads the record stored at `index` from `buffer`.
    fn decode(index: u64, buffer: &[u8]) -> FsResult<Self>;
}

/// Rejects buffers whose width differs from `expected`.
pub fn check_width(expected: usize, buffer: &[u8]) -> FsResult<()> {
    if buffer.len() != expected {
        return Err(FsError::Decode {
            expected,
            actual: buffer.len(),
        });
    }
    Ok(())
}

pub(crate) fn put_u64(buffer: &mut [u8], at: usize, value: u64) {
    buffer[at..at + 8].copy_from_slice(&value.to_be_bytes());
}

pub(crate) fn get_u64(buffer: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buffer[at..at + 8]);
    u64::from_be_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_width() {
        assert!(check_width(4, &[0; 4]).is_ok());
        assert!(matches!(
            check_width(4, &[0; 3]),
            Err(FsError::Decode {
                expected: 4,
                actual: 3
            })
        ));
    }

    #[test]
    fn test_u64_big_endian() {
        let mut buffer = [0u8; 10];
        put_u64(&mut buffer, 1, 0x0102_0304_0506_0708);
        assert_eq!(&buffer[1..9], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(get_u64(&buffer, 1), 0x0102_0304_0506_0708);
    }
}
