//! Deduplication and expansion passes over a single file.
//!
//! A pass streams the file's current content into a fresh flake, then swaps
//! the fresh flake in under the file lock and lets the tree persist the new
//! record. Only then is the original content deleted; a failed pass swaps the
//! original back and deletes the fresh flake again.

use std::sync::Arc;

use flakestore_fs::{DeduplicationDescription, File, FileLock, FileTree};
use flakestore_storage::{CreateFlake, Flake, FlakeInputStream, FlakeOutputStream};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::block::{decode_reference, encode_reference, DeduplicationBlock, REFERENCE_SIZE};
use crate::dedup_table::DeduplicationTable;
use crate::error::{ReduceError, ReduceResult};

/// Result of one pass over a file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewriteOutcome {
    /// Index of the file.
    pub index: u64,
    /// Deduplication level after the pass.
    pub level: i8,
    /// Content length before the pass.
    pub length_before: u64,
    /// Content length after the pass.
    pub length_after: u64,
    /// Full blocks converted to or from references.
    pub blocks: u64,
    /// Blocks newly stored in the table.
    pub new_blocks: u64,
    /// Raw tail bytes copied through.
    pub tail_bytes: u64,
}

#[derive(Debug, Default)]
struct BlockCounts {
    blocks: u64,
    new_blocks: u64,
    tail_bytes: u64,
}

/// Replaces every full block of `file` with a reference into `table`.
///
/// The new content is `N` big-endian 8-byte indices followed by the raw
/// final partial block; the description becomes `(level + 1, N * 8)`.
pub fn deduplicate_file(
    file: &Arc<File>,
    tree: &dyn FileTree,
    table: &DeduplicationTable,
    flakes: &dyn CreateFlake,
) -> ReduceResult<RewriteOutcome> {
    let lock = file.lock()?;
    let description = file.deduplication_description()?;
    let level = description
        .level
        .checked_add(1)
        .ok_or(ReduceError::LevelOverflow {
            index: file.index(),
            level: description.level,
        })?;

    let source = file.data_flake();
    let target = flakes.create_flake()?;
    let counts = match rewrite(&source, &target, |input, output| {
        encode_blocks(input, output, table)
    }) {
        Ok(counts) => counts,
        Err(e) => {
            discard(&target);
            return Err(e);
        }
    };

    let aux = counts.blocks * REFERENCE_SIZE as u64;
    let outcome = RewriteOutcome {
        index: file.index(),
        level,
        length_before: source.len(),
        length_after: target.len(),
        blocks: counts.blocks,
        new_blocks: counts.new_blocks,
        tail_bytes: counts.tail_bytes,
    };
    commit(
        file,
        tree,
        &lock,
        description,
        DeduplicationDescription::new(level, aux as i64),
        target,
    )?;
    info!(
        index = outcome.index,
        level,
        blocks = outcome.blocks,
        new_blocks = outcome.new_blocks,
        before = outcome.length_before,
        after = outcome.length_after,
        "deduplicated file"
    );
    Ok(outcome)
}

/// Resolves the references of a deduplicated file back into raw blocks.
///
/// The reference section of the previous level is not kept, so content
/// expanded to a level above zero cannot be expanded further.
pub fn expand_file(
    file: &Arc<File>,
    tree: &dyn FileTree,
    table: &DeduplicationTable,
    flakes: &dyn CreateFlake,
) -> ReduceResult<RewriteOutcome> {
    let lock = file.lock()?;
    let description = file.deduplication_description()?;
    if description.level < 1 {
        return Err(ReduceError::NotDeduplicated {
            index: file.index(),
        });
    }
    if description.aux < 0 {
        return Err(ReduceError::UnknownReferenceSection {
            index: file.index(),
            level: description.level,
        });
    }

    let source = file.data_flake();
    let references = description.aux as u64;
    if references % REFERENCE_SIZE as u64 != 0 || references > source.len() {
        return Err(ReduceError::Corrupted {
            index: file.index(),
            reason: format!(
                "reference section of {} bytes in {} bytes of content",
                references,
                source.len()
            ),
        });
    }

    let level = description.level - 1;
    let target = flakes.create_flake()?;
    let counts = match rewrite(&source, &target, |input, output| {
        decode_blocks(input, output, table, references / REFERENCE_SIZE as u64)
    }) {
        Ok(counts) => counts,
        Err(e) => {
            discard(&target);
            return Err(e);
        }
    };

    let aux = if level == 0 { 0 } else { -1 };
    let outcome = RewriteOutcome {
        index: file.index(),
        level,
        length_before: source.len(),
        length_after: target.len(),
        blocks: counts.blocks,
        new_blocks: 0,
        tail_bytes: counts.tail_bytes,
    };
    commit(
        file,
        tree,
        &lock,
        description,
        DeduplicationDescription::new(level, aux),
        target,
    )?;
    info!(
        index = outcome.index,
        level,
        blocks = outcome.blocks,
        before = outcome.length_before,
        after = outcome.length_after,
        "expanded file"
    );
    Ok(outcome)
}

fn rewrite<F>(source: &Arc<Flake>, target: &Arc<Flake>, pass: F) -> ReduceResult<BlockCounts>
where
    F: FnOnce(&mut FlakeInputStream, &mut FlakeOutputStream) -> ReduceResult<BlockCounts>,
{
    let mut input = source.input_stream();
    let mut output = target.output_stream();
    let result = pass(&mut input, &mut output).and_then(|counts| {
        output.flush_buffer()?;
        Ok(counts)
    });
    if result.is_err() {
        output.discard();
    }
    result
}

fn encode_blocks(
    input: &mut FlakeInputStream,
    output: &mut FlakeOutputStream,
    table: &DeduplicationTable,
) -> ReduceResult<BlockCounts> {
    let mut counts = BlockCounts::default();
    let mut buffer = vec![0u8; DeduplicationBlock::SIZE];
    while input.pointer().remaining_bytes() >= DeduplicationBlock::SIZE as u64 {
        input.read_complete(&mut buffer)?;
        let block = DeduplicationBlock::from_slice(&buffer)?;
        let (index, new) = table.get_or_register(&block)?;
        output.write_all_bytes(&encode_reference(index))?;
        counts.blocks += 1;
        if new {
            counts.new_blocks += 1;
        }
    }
    counts.tail_bytes = copy_rest(input, output, &mut buffer)?;
    Ok(counts)
}

fn decode_blocks(
    input: &mut FlakeInputStream,
    output: &mut FlakeOutputStream,
    table: &DeduplicationTable,
    references: u64,
) -> ReduceResult<BlockCounts> {
    let mut counts = BlockCounts::default();
    let mut reference = [0u8; REFERENCE_SIZE];
    for _ in 0..references {
        input.read_complete(&mut reference)?;
        let block = table.load_block(decode_reference(reference))?;
        output.write_all_bytes(block.as_bytes())?;
        counts.blocks += 1;
    }
    let mut buffer = vec![0u8; DeduplicationBlock::SIZE];
    counts.tail_bytes = copy_rest(input, output, &mut buffer)?;
    Ok(counts)
}

fn copy_rest(
    input: &mut FlakeInputStream,
    output: &mut FlakeOutputStream,
    buffer: &mut [u8],
) -> ReduceResult<u64> {
    let mut copied = 0u64;
    loop {
        let remaining = input.pointer().remaining_bytes();
        if remaining == 0 {
            return Ok(copied);
        }
        let step = remaining.min(buffer.len() as u64) as usize;
        input.read_complete(&mut buffer[..step])?;
        output.write_all_bytes(&buffer[..step])?;
        copied += step as u64;
    }
}

/// Persists the new description, swaps in `target` and hands the file to
/// `tree`. The previous content flake is deleted only after all three
/// succeeded; otherwise the file is put back as it was and `target` deleted.
fn commit(
    file: &File,
    tree: &dyn FileTree,
    lock: &FileLock,
    previous: DeduplicationDescription,
    description: DeduplicationDescription,
    target: Arc<Flake>,
) -> ReduceResult<()> {
    if let Err(e) = file.set_deduplication_description(description) {
        discard(&target);
        return Err(e.into());
    }
    let old = match file.swap_data_flake(lock, Arc::clone(&target)) {
        Ok(old) => old,
        Err(e) => {
            restore_description(file, previous);
            discard(&target);
            return Err(e.into());
        }
    };
    if let Err(e) = tree.content_replaced(file) {
        if let Err(swap) = file.swap_data_flake(lock, old) {
            warn!(index = file.index(), error = %swap, "failed to restore content flake");
        }
        restore_description(file, previous);
        discard(&target);
        return Err(e.into());
    }
    discard(&old);
    Ok(())
}

fn restore_description(file: &File, previous: DeduplicationDescription) {
    if let Err(e) = file.set_deduplication_description(previous) {
        warn!(index = file.index(), error = %e, "failed to restore deduplication description");
    }
}

fn discard(flake: &Flake) {
    if let Err(e) = flake.delete() {
        warn!(flake_id = %flake.id(), error = %e, "failed to delete unused flake");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flakestore_fs::{Directory, FsError};
    use flakestore_storage::{StorageConfig, StorageEngine};
    use std::io::{Read, Write};

    /// Tree without a file table; `fail` makes every record update fail.
    struct Detached {
        root: Arc<Directory>,
        fail: bool,
    }

    impl FileTree for Detached {
        fn root(&self) -> Arc<Directory> {
            Arc::clone(&self.root)
        }

        fn content_replaced(&self, file: &File) -> flakestore_fs::FsResult<()> {
            if self.fail {
                return Err(FsError::RecordNotFound {
                    index: file.index(),
                });
            }
            Ok(())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        engine: StorageEngine,
        tree: Detached,
        table: DeduplicationTable,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let engine = StorageEngine::open(StorageConfig::in_directory(dir.path())).unwrap();
        let table = DeduplicationTable::open(engine.create_flake().unwrap(), 8).unwrap();
        Fixture {
            _dir: dir,
            engine,
            tree: Detached {
                root: Arc::new(Directory::new(0)),
                fail: false,
            },
            table,
        }
    }

    fn file_with(engine: &StorageEngine, content: &[u8]) -> Arc<File> {
        let file = Arc::new(File::new(
            7,
            0,
            engine.create_flake().unwrap(),
            engine.create_flake().unwrap(),
        ));
        let mut out = file.output_stream().unwrap();
        out.write_all(content).unwrap();
        out.flush().unwrap();
        file
    }

    fn content(file: &File) -> Vec<u8> {
        let mut bytes = Vec::new();
        file.input_stream().unwrap().read_to_end(&mut bytes).unwrap();
        bytes
    }

    #[test]
    fn test_short_file_is_copied_raw() {
        let f = fixture();
        let file = file_with(&f.engine, b"tiny");
        let outcome = deduplicate_file(&file, &f.tree, &f.table, &f.engine).unwrap();
        assert_eq!(outcome.blocks, 0);
        assert_eq!(outcome.tail_bytes, 4);
        assert_eq!(content(&file), b"tiny");
        assert_eq!(
            file.deduplication_description().unwrap(),
            DeduplicationDescription::new(1, 0)
        );
    }

    #[test]
    fn test_exact_blocks_have_no_tail() {
        let f = fixture();
        let mut data = vec![1u8; DeduplicationBlock::SIZE];
        data.extend(vec![2u8; DeduplicationBlock::SIZE]);
        let file = file_with(&f.engine, &data);
        let outcome = deduplicate_file(&file, &f.tree, &f.table, &f.engine).unwrap();
        assert_eq!(outcome.blocks, 2);
        assert_eq!(outcome.new_blocks, 2);
        assert_eq!(outcome.tail_bytes, 0);
        assert_eq!(file.len(), 16);
    }

    #[test]
    fn test_expand_restores_content() {
        let f = fixture();
        let mut data: Vec<u8> = (0..3 * DeduplicationBlock::SIZE).map(|i| (i % 251) as u8).collect();
        data.extend_from_slice(b"raw tail");
        let file = file_with(&f.engine, &data);
        deduplicate_file(&file, &f.tree, &f.table, &f.engine).unwrap();
        assert_eq!(file.len(), 3 * 8 + 8);

        let outcome = expand_file(&file, &f.tree, &f.table, &f.engine).unwrap();
        assert_eq!(outcome.level, 0);
        assert_eq!(content(&file), data);
        assert_eq!(
            file.deduplication_description().unwrap(),
            DeduplicationDescription::new(0, 0)
        );
        assert!(matches!(
            expand_file(&file, &f.tree, &f.table, &f.engine),
            Err(ReduceError::NotDeduplicated { index: 7 })
        ));
    }

    #[test]
    fn test_locked_file_is_rejected() {
        let f = fixture();
        let file = file_with(&f.engine, &[3u8; 5000]);
        let _lock = file.lock().unwrap();
        let flakes = f.engine.flake_count();
        assert!(matches!(
            deduplicate_file(&file, &f.tree, &f.table, &f.engine),
            Err(ReduceError::Fs(FsError::FileLocked { index: 7 }))
        ));
        assert_eq!(f.engine.flake_count(), flakes);
    }

    #[test]
    fn test_dangling_reference_fails_expansion() {
        let f = fixture();
        let file = file_with(&f.engine, &999u64.to_be_bytes());
        file.set_deduplication_description(DeduplicationDescription::new(1, 8))
            .unwrap();
        let flakes = f.engine.flake_count();
        assert!(matches!(
            expand_file(&file, &f.tree, &f.table, &f.engine),
            Err(ReduceError::UnknownBlock { index: 999 })
        ));
        assert_eq!(f.engine.flake_count(), flakes);
        assert_eq!(content(&file), 999u64.to_be_bytes());
    }

    #[test]
    fn test_inconsistent_reference_section() {
        let f = fixture();
        let file = file_with(&f.engine, &[0u8; 12]);
        file.set_deduplication_description(DeduplicationDescription::new(1, 12))
            .unwrap();
        assert!(matches!(
            expand_file(&file, &f.tree, &f.table, &f.engine),
            Err(ReduceError::Corrupted { .. })
        ));
    }

    #[test]
    fn test_second_level_round_trip_stops_at_unknown_section() {
        let f = fixture();
        let data = vec![5u8; 4 * DeduplicationBlock::SIZE * 200];
        let file = file_with(&f.engine, &data);
        deduplicate_file(&file, &f.tree, &f.table, &f.engine).unwrap();
        let first = content(&file);
        deduplicate_file(&file, &f.tree, &f.table, &f.engine).unwrap();
        assert_eq!(file.deduplication_description().unwrap().level, 2);

        expand_file(&file, &f.tree, &f.table, &f.engine).unwrap();
        assert_eq!(content(&file), first);
        assert!(matches!(
            expand_file(&file, &f.tree, &f.table, &f.engine),
            Err(ReduceError::UnknownReferenceSection { level: 1, .. })
        ));
    }

    #[test]
    fn test_rejected_record_update_rolls_back() {
        let mut f = fixture();
        let data: Vec<u8> = (0..2 * DeduplicationBlock::SIZE + 10).map(|i| (i % 13) as u8).collect();
        let file = file_with(&f.engine, &data);
        let source = file.data_flake();
        let description = file.deduplication_description().unwrap();
        let flakes = f.engine.flake_count();

        f.tree.fail = true;
        assert!(matches!(
            deduplicate_file(&file, &f.tree, &f.table, &f.engine),
            Err(ReduceError::Fs(FsError::RecordNotFound { index: 7 }))
        ));
        assert!(Arc::ptr_eq(&file.data_flake(), &source));
        assert!(source.is_valid());
        assert_eq!(file.deduplication_description().unwrap(), description);
        assert_eq!(content(&file), data);
        assert_eq!(f.engine.flake_count(), flakes);
        assert!(!file.is_locked());

        f.tree.fail = false;
        deduplicate_file(&file, &f.tree, &f.table, &f.engine).unwrap();
        assert!(!source.is_valid());
        f.tree.fail = true;
        let reduced = content(&file);
        assert!(expand_file(&file, &f.tree, &f.table, &f.engine).is_err());
        assert_eq!(content(&file), reduced);
        assert_eq!(file.deduplication_description().unwrap().level, 1);
    }
}
