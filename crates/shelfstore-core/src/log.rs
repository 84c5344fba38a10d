//! Record log: the single append-only file behind a persistent store.
//!
//! Write ordering for every mutation:
//! 1. Serialize record with CRC32C
//! 2. Append to the log file
//! 3. Sync according to the [`SyncPolicy`]
//! 4. Return; only then does the caller touch the hash table
//!
//! Replay reads the file front to back, resyncs past corrupt records by
//! scanning for the next record magic, and stops at a torn tail.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::config::SyncPolicy;
use crate::durability::{durable_sync, sync_for_policy, sync_parent_dir};
use crate::error::{ShelfError, ShelfResult};
use crate::format::{
    deserialize_record, record_len, serialize_record, FileHeader, LogRecord, Operation,
    FILE_HEADER_SIZE, HEADER_SIZE, MAGIC_ARRAY,
};
use crate::value::ValueShape;

/// Appends records to an open log file.
///
/// INVARIANT: `append` completes (including the policy sync) before the
/// caller applies the mutation in memory.
pub struct LogWriter {
    file: File,
    path: PathBuf,
    /// Current file length in bytes (tracked to avoid stat calls)
    size: u64,
    /// Records in the file, live or not
    entries: u64,
    policy: SyncPolicy,
}

impl LogWriter {
    /// Create (or truncate) `path` and write a fresh file header.
    pub fn create(path: &Path, shape: ValueShape, policy: SyncPolicy) -> ShelfResult<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(|e| ShelfError::io_at(path, &e, "failed to create log file"))?;

        file.write_all(&FileHeader::new(shape).to_bytes())
            .map_err(|e| ShelfError::io_at(path, &e, "failed to write file header"))?;
        durable_sync(&file).map_err(|e| ShelfError::io_at(path, &e, "failed to sync file header"))?;
        sync_parent_dir(path).map_err(|e| ShelfError::io_at(path, &e, "failed to sync directory"))?;

        debug!(path = %path.display(), shape = shape.as_str(), "created log file");
        Ok(Self {
            file,
            path: path.to_path_buf(),
            size: FILE_HEADER_SIZE as u64,
            entries: 0,
            policy,
        })
    }

    /// Reopen an existing log for appending after replay.
    ///
    /// Bytes past `valid_len` (a torn tail) are cut off so new records
    /// start on a clean boundary.
    pub fn resume(path: &Path, replay: &Replay, policy: SyncPolicy) -> ShelfResult<Self> {
        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| ShelfError::io_at(path, &e, "failed to open log file"))?;

        if replay.file_len > replay.valid_len {
            warn!(
                path = %path.display(),
                discarded = replay.file_len - replay.valid_len,
                "truncating torn tail of log"
            );
            file.set_len(replay.valid_len)
                .map_err(|e| ShelfError::io_at(path, &e, "failed to truncate torn tail"))?;
            durable_sync(&file).map_err(|e| ShelfError::io_at(path, &e, "failed to sync truncation"))?;
        }

        Self::attach(file, path, replay.valid_len, replay.records.len() as u64, policy)
    }

    /// Reopen a log whose length and record count are already known, e.g.
    /// right after compaction replaced the file.
    pub fn reopen(path: &Path, size: u64, entries: u64, policy: SyncPolicy) -> ShelfResult<Self> {
        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| ShelfError::io_at(path, &e, "failed to reopen log file"))?;
        Self::attach(file, path, size, entries, policy)
    }

    fn attach(file: File, path: &Path, size: u64, entries: u64, policy: SyncPolicy) -> ShelfResult<Self> {
        let mut writer = Self {
            file,
            path: path.to_path_buf(),
            size,
            entries,
            policy,
        };
        writer.seek_end()?;
        Ok(writer)
    }

    fn seek_end(&mut self) -> ShelfResult<()> {
        use std::io::{Seek, SeekFrom};
        self.file
            .seek(SeekFrom::Start(self.size))
            .map_err(|e| ShelfError::io_at(&self.path, &e, "failed to seek log end"))?;
        Ok(())
    }

    /// Append one record and sync it per the configured policy.
    pub fn append(&mut self, key: &[u8], value: &[u8], op: Operation) -> ShelfResult<()> {
        let bytes = serialize_record(key, value, op)?;

        let written = self
            .file
            .write_all(&bytes)
            .map_err(|e| ShelfError::io_at(&self.path, &e, "log write failed"))
            .and_then(|_| {
                sync_for_policy(&self.file, self.policy)
                    .map_err(|e| ShelfError::io_at(&self.path, &e, "log durable_sync failed"))
            });
        if let Err(e) = written {
            self.rollback();
            return Err(e);
        }

        self.size += bytes.len() as u64;
        self.entries += 1;
        Ok(())
    }

    /// Cut off whatever a failed append left past `size`.
    fn rollback(&mut self) {
        let restored = self
            .file
            .set_len(self.size)
            .map_err(|e| ShelfError::io_at(&self.path, &e, "failed to cut partial record"))
            .and_then(|_| self.seek_end());
        if let Err(e) = restored {
            warn!(path = %self.path.display(), error = %e, "log may hold a partial record");
        }
    }

    /// Force everything appended so far to persistent storage.
    pub fn sync(&self) -> ShelfResult<()> {
        durable_sync(&self.file).map_err(|e| ShelfError::io_at(&self.path, &e, "log sync failed"))
    }

    /// Current file length in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Records appended to this file, including superseded ones.
    pub fn entries(&self) -> u64 {
        self.entries
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn policy(&self) -> SyncPolicy {
        self.policy
    }
}

/// Outcome of reading a log file front to back.
#[derive(Debug)]
pub struct Replay {
    pub header: FileHeader,
    /// Records that passed checksum verification, in file order
    pub records: Vec<LogRecord>,
    /// End offset of the last intact record
    pub valid_len: u64,
    /// File length on disk
    pub file_len: u64,
    /// Corrupt regions skipped by resync
    pub skipped: usize,
}

/// Read every intact record from `path`.
pub fn replay(path: &Path) -> ShelfResult<Replay> {
    let mut file = File::open(path)
        .map_err(|e| ShelfError::io_at(path, &e, "failed to open log file for replay"))?;
    let mut buffer = Vec::new();
    file.read_to_end(&mut buffer)
        .map_err(|e| ShelfError::io_at(path, &e, "failed to read log file"))?;

    let header = FileHeader::from_bytes(&buffer, path)?;

    let mut records = Vec::new();
    let mut offset = FILE_HEADER_SIZE;
    let mut valid_len = FILE_HEADER_SIZE;
    let mut skipped = 0;

    while offset + HEADER_SIZE <= buffer.len() {
        let total = match record_len(&buffer[offset..]) {
            Some(total) => total,
            None => {
                warn!(path = %path.display(), offset, "bad record magic, scanning for next record");
                skipped += 1;
                match find_next_magic(&buffer, offset + 1) {
                    Some(next) => { offset = next; continue; }
                    None => break,
                }
            }
        };

        if offset + total > buffer.len() {
            // The length field is outside the CRC; an intact record further on
            // means this one is corrupt, not torn.
            match next_intact_record(&buffer, offset + 1) {
                Some(next) => {
                    warn!(path = %path.display(), offset, need = total, "bad record length, resyncing");
                    skipped += 1;
                    offset = next;
                    continue;
                }
                None => {
                    debug!(path = %path.display(), offset, need = total, "torn record at end of log");
                    break;
                }
            }
        }

        match deserialize_record(&buffer[offset..offset + total], offset as u64) {
            Ok(record) => {
                records.push(record);
                offset += total;
                valid_len = offset;
            }
            Err(e) => {
                warn!(path = %path.display(), offset, error = %e, "skipping corrupt record");
                skipped += 1;
                match find_next_magic(&buffer, offset + 1) {
                    Some(next) => { offset = next; continue; }
                    None => break,
                }
            }
        }
    }

    Ok(Replay {
        header,
        records,
        valid_len: valid_len as u64,
        file_len: buffer.len() as u64,
        skipped,
    })
}

/// Scan forward for the next record magic (resync after corruption).
fn find_next_magic(buffer: &[u8], start: usize) -> Option<usize> {
    buffer
        .get(start..)?
        .windows(MAGIC_ARRAY.len())
        .position(|w| w == MAGIC_ARRAY)
        .map(|pos| start + pos)
}

/// Offset of the first record at or after `start` that passes its checksum.
fn next_intact_record(buffer: &[u8], start: usize) -> Option<usize> {
    let mut candidate = find_next_magic(buffer, start)?;
    loop {
        if let Some(total) = record_len(&buffer[candidate..]) {
            let end = candidate + total;
            if end <= buffer.len() && deserialize_record(&buffer[candidate..end], candidate as u64).is_ok() {
                return Some(candidate);
            }
        }
        candidate = find_next_magic(buffer, candidate + 1)?;
    }
}

/// Copy `src` to `dest` through a temp file and an atomic rename.
///
/// Returns the number of bytes copied.
pub fn copy_file_atomic(src: &Path, dest: &Path) -> ShelfResult<u64> {
    let tmp = temp_sibling(dest, "copy");
    let copied = fs::copy(src, &tmp)
        .map_err(|e| ShelfError::io_at(&tmp, &e, "failed to copy log file"))?;
    {
        let file = File::open(&tmp).map_err(|e| ShelfError::io_at(&tmp, &e, "failed to reopen copy"))?;
        durable_sync(&file).map_err(|e| ShelfError::io_at(&tmp, &e, "failed to sync copy"))?;
    }
    fs::rename(&tmp, dest).map_err(|e| ShelfError::io_at(dest, &e, "failed to rename copy"))?;
    sync_parent_dir(dest).map_err(|e| ShelfError::io_at(dest, &e, "failed to sync directory"))?;
    Ok(copied)
}

/// `<dest>.<tag>` in the same directory, so the rename stays on one file system.
pub(crate) fn temp_sibling(dest: &Path, tag: &str) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(format!(".{}", tag));
    dest.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_three(path: &Path) -> LogWriter {
        let mut writer = LogWriter::create(path, ValueShape::Flat, SyncPolicy::Durable).unwrap();
        writer.append(b"key1", b"value1", Operation::Put).unwrap();
        writer.append(b"key2", b"value2", Operation::Put).unwrap();
        writer.append(b"key1", b"", Operation::Delete).unwrap();
        writer
    }

    #[test]
    fn test_write_replay_roundtrip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("db.shelf");
        let writer = write_three(&path);
        assert_eq!(writer.entries(), 3);
        let size = writer.size();
        drop(writer);

        let replay = replay(&path).unwrap();
        assert_eq!(replay.header.shape, ValueShape::Flat);
        assert_eq!(replay.records.len(), 3);
        assert_eq!(replay.records[0].key, b"key1");
        assert_eq!(replay.records[1].value, b"value2");
        assert_eq!(replay.records[2].operation, Operation::Delete);
        assert_eq!(replay.valid_len, size);
        assert_eq!(replay.file_len, std::fs::metadata(&path).unwrap().len());
    }

    #[test]
    fn test_corruption_recovery_skips_bad_record() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("db.shelf");
        let mut writer = LogWriter::create(&path, ValueShape::Flat, SyncPolicy::Durable).unwrap();
        writer.append(b"good1", b"val1", Operation::Put).unwrap();
        let second = writer.size() as usize;
        writer.append(b"good2", b"val2", Operation::Put).unwrap();
        writer.append(b"good3", b"val3", Operation::Put).unwrap();
        drop(writer);

        let mut data = std::fs::read(&path).unwrap();
        data[second + HEADER_SIZE + 9] ^= 0xFF;
        std::fs::write(&path, data).unwrap();

        let replay = replay(&path).unwrap();
        let keys: Vec<&[u8]> = replay.records.iter().map(|r| r.key.as_slice()).collect();
        assert_eq!(keys, vec![&b"good1"[..], &b"good3"[..]]);
        assert_eq!(replay.skipped, 1);
    }

    #[test]
    fn test_torn_write_stops_cleanly() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("db.shelf");
        let mut writer = LogWriter::create(&path, ValueShape::Flat, SyncPolicy::Durable).unwrap();
        writer.append(b"complete", b"entry", Operation::Put).unwrap();
        let intact = writer.size();
        drop(writer);

        let mut data = std::fs::read(&path).unwrap();
        data.extend_from_slice(&MAGIC_ARRAY);
        data.extend_from_slice(&[0xFF, 0x00, 0x00, 0x00]);
        data.extend_from_slice(&[0u8; 24]);
        std::fs::write(&path, data).unwrap();

        let replay = replay(&path).unwrap();
        assert_eq!(replay.records.len(), 1);
        assert_eq!(replay.valid_len, intact);
        assert!(replay.file_len > intact);

        let writer = LogWriter::resume(&path, &replay, SyncPolicy::Durable).unwrap();
        assert_eq!(writer.size(), intact);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), intact);
    }

    #[test]
    fn test_resume_appends_after_existing_records() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("db.shelf");
        drop(write_three(&path));

        let first = replay(&path).unwrap();
        let mut writer = LogWriter::resume(&path, &first, SyncPolicy::Buffered).unwrap();
        writer.append(b"key3", b"value3", Operation::Put).unwrap();
        writer.sync().unwrap();
        drop(writer);

        let second = replay(&path).unwrap();
        assert_eq!(second.records.len(), 4);
        assert_eq!(second.records[3].key, b"key3");
    }

    #[test]
    fn test_bad_length_mid_file_resyncs_instead_of_truncating() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("db.shelf");
        let mut writer = LogWriter::create(&path, ValueShape::Flat, SyncPolicy::Durable).unwrap();
        writer.append(b"first", b"v", Operation::Put).unwrap();
        let second = writer.size() as usize;
        for i in 0..10 {
            writer.append(format!("later{}", i).as_bytes(), b"v", Operation::Put).unwrap();
        }
        let size = writer.size();
        drop(writer);

        // high byte of the second record's length field
        let mut data = std::fs::read(&path).unwrap();
        data[second + 7] ^= 0x01;
        std::fs::write(&path, data).unwrap();

        let replay = replay(&path).unwrap();
        assert_eq!(replay.records.len(), 10);
        assert_eq!(replay.records[1].key, b"later1");
        assert_eq!(replay.skipped, 1);
        assert_eq!(replay.valid_len, size);

        let writer = LogWriter::resume(&path, &replay, SyncPolicy::Durable).unwrap();
        assert_eq!(writer.size(), size);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), size);
    }

    #[test]
    fn test_rollback_cuts_partial_record() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("db.shelf");
        let mut writer = write_three(&path);
        let size = writer.size();

        // what an interrupted write_all leaves behind
        writer.file.write_all(&MAGIC_ARRAY).unwrap();
        writer.file.write_all(&[0xAB; 11]).unwrap();
        writer.rollback();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), size);

        writer.append(b"key4", b"value4", Operation::Put).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), writer.size());
        drop(writer);

        let replay = replay(&path).unwrap();
        assert_eq!(replay.records.len(), 4);
        assert_eq!(replay.skipped, 0);
    }

    #[test]
    fn test_failed_append_keeps_size() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("db.shelf");
        let size = write_three(&path).size();

        let mut writer = LogWriter {
            file: File::open(&path).unwrap(),
            path: path.clone(),
            size,
            entries: 3,
            policy: SyncPolicy::Durable,
        };
        assert!(writer.append(b"key4", b"value4", Operation::Put).is_err());
        assert_eq!(writer.size(), size);
        assert_eq!(writer.entries(), 3);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), size);
    }

    #[test]
    fn test_missing_header_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("junk");
        std::fs::write(&path, b"not a shelf file").unwrap();
        assert!(matches!(replay(&path), Err(ShelfError::Corrupted { .. })));
    }

    #[test]
    fn test_copy_file_atomic() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("db.shelf");
        drop(write_three(&path));

        let dest = temp.path().join("copy.shelf");
        let copied = copy_file_atomic(&path, &dest).unwrap();
        assert_eq!(copied, std::fs::metadata(&path).unwrap().len());
        assert_eq!(std::fs::read(&path).unwrap(), std::fs::read(&dest).unwrap());
        assert!(!temp_sibling(&dest, "copy").exists());
    }
}
