//! Compaction: rewriting a record log with only its live records.
//!
//! Superseded puts, deletes and clears accumulate in the log. Compaction
//! writes the current table into a new file and swaps it in:
//! 1. Write live records to `<file>.compact`
//! 2. durable_sync the new file
//! 3. Rename it over the original (atomic on POSIX)
//! 4. durable_sync the parent directory
//!
//! A crash before step 3 leaves the original intact and an orphaned temp file.

use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::durability::{durable_sync, sync_parent_dir};
use crate::error::{ShelfError, ShelfResult};
use crate::format::{serialize_record, FileHeader, Operation};
use crate::log::temp_sibling;
use crate::value::ValueShape;

/// Result of a compaction operation.
#[derive(Debug, Clone)]
pub struct CompactionResult {
    /// Path to the compacted file
    pub file_path: PathBuf,
    /// Records in the log before compaction
    pub original_entries: u64,
    /// Records written to the compacted log
    pub live_entries: u64,
    /// Records dropped (tombstones, clears, stale overwrites)
    pub removed_entries: u64,
    /// Original file size in bytes
    pub original_bytes: u64,
    /// Compacted file size in bytes
    pub compacted_bytes: u64,
}

impl CompactionResult {
    /// Ratio of dead records in the original log (0.0 = no waste, 1.0 = all waste).
    pub fn dead_space_ratio(&self) -> f64 {
        if self.original_entries == 0 {
            return 0.0;
        }
        self.removed_entries as f64 / self.original_entries as f64
    }

    /// Space saved in bytes.
    pub fn bytes_saved(&self) -> u64 {
        self.original_bytes.saturating_sub(self.compacted_bytes)
    }
}

/// Where a compaction stopped.
#[derive(Debug)]
pub enum CompactionError {
    /// The original log was never replaced
    BeforeRename(ShelfError),
    /// The compacted log is in place; only the directory sync failed
    AfterRename {
        result: CompactionResult,
        error: ShelfError,
    },
}

impl CompactionError {
    /// Length and record count of the log now on disk, given the
    /// original log's.
    pub fn log_extent(&self, original_bytes: u64, original_entries: u64) -> (u64, u64) {
        match self {
            CompactionError::BeforeRename(_) => (original_bytes, original_entries),
            CompactionError::AfterRename { result, .. } => (result.compacted_bytes, result.live_entries),
        }
    }

    pub fn error(&self) -> &ShelfError {
        match self {
            CompactionError::BeforeRename(error) | CompactionError::AfterRename { error, .. } => error,
        }
    }

    pub fn into_error(self) -> ShelfError {
        match self {
            CompactionError::BeforeRename(error) | CompactionError::AfterRename { error, .. } => error,
        }
    }
}

/// Write `records` (key, encoded value) to `tmp` and sync it.
///
/// Returns (records written, file length).
fn stage_snapshot<'a, I>(tmp: &Path, shape: ValueShape, records: I) -> ShelfResult<(u64, u64)>
where
    I: IntoIterator<Item = (&'a [u8], Vec<u8>)>,
{
    let mut written = 0u64;
    let mut length = 0u64;

    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(tmp)
        .map_err(|e| ShelfError::io_at(tmp, &e, "failed to create compact file"))?;
    let mut out = BufWriter::new(file);

    let header = FileHeader::new(shape).to_bytes();
    out.write_all(&header)
        .map_err(|e| ShelfError::io_at(tmp, &e, "failed to write compact header"))?;
    length += header.len() as u64;

    for (key, value) in records {
        let bytes = serialize_record(key, &value, Operation::Put)?;
        out.write_all(&bytes)
            .map_err(|e| ShelfError::io_at(tmp, &e, "failed to write compacted record"))?;
        length += bytes.len() as u64;
        written += 1;
    }

    let file = out
        .into_inner()
        .map_err(|e| ShelfError::io_at(tmp, e.error(), "failed to flush compact file"))?;
    durable_sync(&file).map_err(|e| ShelfError::io_at(tmp, &e, "failed to sync compacted file"))?;
    Ok((written, length))
}

fn install(tmp: &Path, dest: &Path) -> ShelfResult<()> {
    fs::rename(tmp, dest).map_err(|e| ShelfError::io_at(dest, &e, "failed to rename compacted file"))
}

fn sync_installed(dest: &Path) -> ShelfResult<()> {
    sync_parent_dir(dest).map_err(|e| ShelfError::io_at(dest, &e, "failed to sync directory after compaction"))
}

/// Write `records` (key, encoded value) as a fresh log at `dest`, atomically.
///
/// Returns (records written, file length).
pub fn write_snapshot<'a, I>(dest: &Path, shape: ValueShape, records: I) -> ShelfResult<(u64, u64)>
where
    I: IntoIterator<Item = (&'a [u8], Vec<u8>)>,
{
    let tmp = temp_sibling(dest, "compact");
    let counts = stage_snapshot(&tmp, shape, records)?;
    install(&tmp, dest)?;
    sync_installed(dest)?;
    Ok(counts)
}

/// Compact the log at `path` down to `records`, the store's live table.
pub fn compact_log<'a, I>(
    path: &Path,
    shape: ValueShape,
    original_entries: u64,
    original_bytes: u64,
    records: I,
) -> Result<CompactionResult, CompactionError>
where
    I: IntoIterator<Item = (&'a [u8], Vec<u8>)>,
{
    let tmp = temp_sibling(path, "compact");
    let (live_entries, compacted_bytes) = stage_snapshot(&tmp, shape, records)
        .and_then(|counts| install(&tmp, path).map(|_| counts))
        .map_err(CompactionError::BeforeRename)?;

    let result = CompactionResult {
        file_path: path.to_path_buf(),
        original_entries,
        live_entries,
        removed_entries: original_entries.saturating_sub(live_entries),
        original_bytes,
        compacted_bytes,
    };
    match sync_installed(path) {
        Ok(()) => Ok(result),
        Err(error) => Err(CompactionError::AfterRename { result, error }),
    }
}
