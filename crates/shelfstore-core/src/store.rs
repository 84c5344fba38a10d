//! Store: the local record store.
//!
//! A [`SlotTable`] behind a RwLock, optionally backed by a record log.
//!
//! **Read path**: shared lock, straight from the table
//! **Write path**: exclusive lock, log append (synced per policy), then table,
//! then version bump when the key set changed
//!
//! Holding the lock across the log append means a failed append never
//! leaves the table ahead of the file.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

use crate::compaction::{compact_log, write_snapshot, CompactionError, CompactionResult};
use crate::config::{Config, OpenFlags, SyncPolicy};
use crate::error::{ShelfError, ShelfResult};
use crate::format::{LogRecord, Operation};
use crate::iter::CursorSource;
use crate::kv::KvStore;
use crate::log::{copy_file_atomic, replay, LogWriter};
use crate::table::SlotTable;
use crate::value::{validate_key, FieldMap, RecordValue, ValueShape};

/// Store of flat binary values.
pub type FlatStore = Store<Vec<u8>>;

/// Store of multi-field records.
pub type FieldStore = Store<FieldMap>;

enum Backing {
    /// Nothing on disk
    Memory,
    /// Opened without WRITER; the file is never written
    ReadOnly { path: PathBuf, file_len: u64, entries: u64 },
    Log(LogWriter),
}

struct StoreState<V> {
    table: SlotTable<V>,
    backing: Backing,
    /// Bumped whenever the key set changes
    version: u64,
    closed: bool,
}

impl<V: RecordValue> StoreState<V> {
    fn append(&mut self, key: &[u8], value: &[u8], op: Operation) -> ShelfResult<()> {
        match &mut self.backing {
            Backing::Log(writer) => writer.append(key, value, op),
            Backing::Memory => Ok(()),
            Backing::ReadOnly { .. } => Err(ShelfError::ReadOnly),
        }
    }

    fn live_bytes(&self) -> u64 {
        self.table
            .slots()
            .map(|slot| (slot.key.len() + slot.value.byte_len()) as u64)
            .sum()
    }

    fn byte_size(&self) -> u64 {
        match &self.backing {
            Backing::Log(writer) => writer.size(),
            Backing::ReadOnly { file_len, .. } => *file_len,
            Backing::Memory => self.live_bytes(),
        }
    }

    fn log_entries(&self) -> u64 {
        match &self.backing {
            Backing::Log(writer) => writer.entries(),
            Backing::ReadOnly { entries, .. } => *entries,
            Backing::Memory => 0,
        }
    }

    fn path(&self) -> Option<&Path> {
        match &self.backing {
            Backing::Log(writer) => Some(writer.path()),
            Backing::ReadOnly { path, .. } => Some(path),
            Backing::Memory => None,
        }
    }
}

/// Point-in-time statistics for a store.
#[derive(Debug, Clone)]
pub struct StoreStats {
    /// Live records
    pub records: u64,
    /// Backing file length, or live bytes for a memory store
    pub byte_size: u64,
    /// Records in the log, including superseded ones
    pub log_entries: u64,
    /// Key plus value bytes of live records
    pub live_bytes: u64,
    /// Current mutation version
    pub version: u64,
    pub shape: ValueShape,
    pub path: Option<PathBuf>,
    pub read_only: bool,
    pub sync_policy: SyncPolicy,
}

impl StoreStats {
    /// Share of log records that no longer contribute to the table.
    pub fn dead_ratio(&self) -> f64 {
        if self.log_entries == 0 {
            return 0.0;
        }
        self.log_entries.saturating_sub(self.records) as f64 / self.log_entries as f64
    }
}

/// Hash-table record store with version-checked iteration.
///
/// All public methods take `&self`; a store is shared across threads by
/// reference or `Arc`.
pub struct Store<V: RecordValue = Vec<u8>> {
    state: RwLock<StoreState<V>>,
    config: Config,
}

impl<V: RecordValue> Store<V> {
    /// Empty in-memory store with the default configuration.
    pub fn memory() -> Self {
        Self::from_parts(SlotTable::with_capacity(0), Backing::Memory, Config::default())
    }

    /// Empty in-memory store with an explicit configuration.
    pub fn memory_with(config: Config) -> ShelfResult<Self> {
        config.validate().map_err(ShelfError::invalid)?;
        let table = SlotTable::with_capacity(config.initial_capacity);
        Ok(Self::from_parts(table, Backing::Memory, config))
    }

    /// Open a file-backed store with the default configuration.
    pub fn open<P: AsRef<Path>>(path: P, flags: OpenFlags) -> ShelfResult<Self> {
        Self::open_with(path, flags, Config::default())
    }

    /// Open a file-backed store.
    ///
    /// An existing file is replayed into memory. With WRITER its torn tail
    /// is cut off and new records are appended; without WRITER the file is
    /// left untouched and every mutation fails `ReadOnly`.
    pub fn open_with<P: AsRef<Path>>(path: P, flags: OpenFlags, config: Config) -> ShelfResult<Self> {
        let path = path.as_ref();
        config.validate().map_err(ShelfError::invalid)?;
        flags.validate().map_err(ShelfError::invalid)?;

        let mut table = SlotTable::with_capacity(config.initial_capacity);
        let exists = path.exists();

        let backing = if !exists || flags.contains(OpenFlags::TRUNCATE) {
            if !exists && !flags.contains(OpenFlags::CREATE) {
                return Err(ShelfError::Io {
                    path: Some(path.to_path_buf()),
                    kind: std::io::ErrorKind::NotFound,
                    message: "store file does not exist and CREATE was not given".to_string(),
                });
            }
            Backing::Log(LogWriter::create(path, V::SHAPE, config.sync_policy)?)
        } else {
            let replay = replay(path)?;
            if replay.header.shape != V::SHAPE {
                return Err(ShelfError::ShapeMismatch {
                    path: path.to_path_buf(),
                    expected: V::SHAPE.as_str(),
                    found: replay.header.shape.as_str(),
                });
            }
            for record in &replay.records {
                apply_record(&mut table, record, path)?;
            }
            if replay.skipped > 0 {
                warn!(path = %path.display(), skipped = replay.skipped, "skipped corrupt log regions");
            }
            info!(
                path = %path.display(),
                records = table.len(),
                log_entries = replay.records.len(),
                "recovered store"
            );

            if flags.is_writer() {
                Backing::Log(LogWriter::resume(path, &replay, config.sync_policy)?)
            } else {
                Backing::ReadOnly {
                    path: path.to_path_buf(),
                    file_len: replay.file_len,
                    entries: replay.records.len() as u64,
                }
            }
        };

        Ok(Self::from_parts(table, backing, config))
    }

    fn from_parts(table: SlotTable<V>, backing: Backing, config: Config) -> Self {
        Self {
            state: RwLock::new(StoreState {
                table,
                backing,
                version: 0,
                closed: false,
            }),
            config,
        }
    }

    fn readable(&self) -> ShelfResult<RwLockReadGuard<'_, StoreState<V>>> {
        let state = self.state.read();
        if state.closed {
            return Err(ShelfError::Closed);
        }
        Ok(state)
    }

    fn writable(&self) -> ShelfResult<RwLockWriteGuard<'_, StoreState<V>>> {
        let state = self.state.write();
        if state.closed {
            return Err(ShelfError::Closed);
        }
        if matches!(state.backing, Backing::ReadOnly { .. }) {
            return Err(ShelfError::ReadOnly);
        }
        Ok(state)
    }

    fn check_key(&self, key: &[u8]) -> ShelfResult<()> {
        validate_key(key)?;
        if key.len() > self.config.max_key_size {
            return Err(ShelfError::OversizedEntry {
                entry_size: key.len() as u64,
                max_size: self.config.max_key_size as u64,
                component: "key",
            });
        }
        Ok(())
    }

    /// Log and apply a full value under the write lock.
    fn store_value(&self, state: &mut StoreState<V>, key: &[u8], value: V) -> ShelfResult<()> {
        let encoded = value.encode();
        if encoded.len() > self.config.max_value_size {
            return Err(ShelfError::OversizedEntry {
                entry_size: encoded.len() as u64,
                max_size: self.config.max_value_size as u64,
                component: "value",
            });
        }
        state.append(key, &encoded, Operation::Put)?;
        if state.table.upsert(key, value) {
            state.version += 1;
        }
        Ok(())
    }

    /// Bytes used by the store: the log file length for file-backed stores,
    /// live key plus value bytes for memory stores.
    pub fn byte_size(&self) -> ShelfResult<u64> {
        Ok(self.readable()?.byte_size())
    }

    /// Force all appended records to persistent storage.
    pub fn sync(&self) -> ShelfResult<()> {
        let state = self.readable()?;
        match &state.backing {
            Backing::Log(writer) => writer.sync(),
            _ => Ok(()),
        }
    }

    /// Write a consistent copy of the store to `dest`, replacing it atomically.
    ///
    /// Writers are blocked for the duration. The copy opens as a store of
    /// the same shape with the same records. Returns the copy's length.
    pub fn copy_to<P: AsRef<Path>>(&self, dest: P) -> ShelfResult<u64> {
        let dest = dest.as_ref();
        let state = self.readable()?;
        if state.path() == Some(dest) {
            return Err(ShelfError::invalid("cannot copy a store onto its own file"));
        }
        let copied = match &state.backing {
            Backing::Log(writer) => {
                writer.sync()?;
                copy_file_atomic(writer.path(), dest)?
            }
            Backing::ReadOnly { path, .. } => copy_file_atomic(path, dest)?,
            Backing::Memory => {
                let records = state
                    .table
                    .slots()
                    .map(|slot| (slot.key.as_slice(), slot.value.encode()));
                write_snapshot(dest, V::SHAPE, records)?.1
            }
        };
        debug!(dest = %dest.display(), bytes = copied, "copied store");
        Ok(copied)
    }

    /// Rewrite the log with only live records.
    ///
    /// Does not change the key set, so live iterators stay valid.
    pub fn optimize(&self) -> ShelfResult<CompactionResult> {
        let mut state = self.writable()?;
        let (path, entries, size, policy) = match &state.backing {
            Backing::Log(writer) => (
                writer.path().to_path_buf(),
                writer.entries(),
                writer.size(),
                writer.policy(),
            ),
            _ => {
                let live = state.table.len() as u64;
                let bytes = state.live_bytes();
                return Ok(CompactionResult {
                    file_path: PathBuf::new(),
                    original_entries: live,
                    live_entries: live,
                    removed_entries: 0,
                    original_bytes: bytes,
                    compacted_bytes: bytes,
                });
            }
        };

        // release the old handle before the rename replaces its file
        state.backing = Backing::Memory;

        let compacted = compact_log(
            &path,
            V::SHAPE,
            entries,
            size,
            state
                .table
                .slots()
                .map(|slot| (slot.key.as_slice(), slot.value.encode())),
        );

        let (size, entries) = match &compacted {
            Ok(result) => (result.compacted_bytes, result.live_entries),
            Err(e) => {
                warn!(path = %path.display(), error = %e.error(), "compaction failed");
                e.log_extent(size, entries)
            }
        };
        match LogWriter::reopen(&path, size, entries, policy) {
            Ok(writer) => state.backing = Backing::Log(writer),
            Err(e) => {
                // without a log every later write would be lost silently
                state.closed = true;
                return Err(e);
            }
        }

        let result = compacted.map_err(CompactionError::into_error)?;
        info!(
            path = %path.display(),
            removed = result.removed_entries,
            saved = result.bytes_saved(),
            "optimized store"
        );
        Ok(result)
    }

    pub fn stats(&self) -> ShelfResult<StoreStats> {
        let state = self.readable()?;
        Ok(StoreStats {
            records: state.table.len() as u64,
            byte_size: state.byte_size(),
            log_entries: state.log_entries(),
            live_bytes: state.live_bytes(),
            version: state.version,
            shape: V::SHAPE,
            path: state.path().map(Path::to_path_buf),
            read_only: matches!(state.backing, Backing::ReadOnly { .. }),
            sync_policy: self.config.sync_policy,
        })
    }

    /// Backing file, if any.
    pub fn path(&self) -> Option<PathBuf> {
        self.state.read().path().map(Path::to_path_buf)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.state.read().closed
    }

    /// Sync and release the backing file. Every later operation fails `Closed`.
    pub fn close(&self) -> ShelfResult<()> {
        let mut state = self.state.write();
        if state.closed {
            return Err(ShelfError::Closed);
        }
        let synced = match &state.backing {
            Backing::Log(writer) => writer.sync(),
            _ => Ok(()),
        };
        state.backing = Backing::Memory;
        state.table.clear();
        state.closed = true;
        state.version += 1;
        debug!("closed store");
        synced
    }
}

fn apply_record<V: RecordValue>(table: &mut SlotTable<V>, record: &LogRecord, path: &Path) -> ShelfResult<()> {
    match record.operation {
        Operation::Put => {
            let value = V::decode(&record.value).map_err(|e| ShelfError::Corrupted {
                path: path.to_path_buf(),
                offset: record.offset,
                reason: format!("undecodable value: {}", e),
            })?;
            table.upsert(&record.key, value);
        }
        Operation::Delete => {
            table.remove(&record.key);
        }
        Operation::Clear => table.clear(),
    }
    Ok(())
}

impl<V: RecordValue> CursorSource for Store<V> {
    type Value = V;

    fn cursor_version(&self) -> ShelfResult<u64> {
        Ok(self.readable()?.version)
    }

    fn key_at(&self, version: u64, position: usize) -> ShelfResult<Option<Vec<u8>>> {
        let state = self.readable()?;
        if state.version != version {
            return Err(ShelfError::Stale { expected: version, current: state.version });
        }
        Ok(state.table.slot(position).map(|slot| slot.key.clone()))
    }

    fn entry_at(&self, version: u64, position: usize) -> ShelfResult<Option<(Vec<u8>, V)>> {
        let state = self.readable()?;
        if state.version != version {
            return Err(ShelfError::Stale { expected: version, current: state.version });
        }
        Ok(state
            .table
            .slot(position)
            .map(|slot| (slot.key.clone(), slot.value.clone())))
    }
}

impl<V: RecordValue> KvStore for Store<V> {
    fn contains(&self, key: &[u8]) -> ShelfResult<bool> {
        validate_key(key)?;
        Ok(self.readable()?.table.contains(key))
    }

    fn lookup(&self, key: &[u8]) -> ShelfResult<Option<V>> {
        validate_key(key)?;
        Ok(self.readable()?.table.get(key).cloned())
    }

    fn put(&self, key: &[u8], value: V) -> ShelfResult<()> {
        self.check_key(key)?;
        value.validate()?;
        let mut state = self.writable()?;
        self.store_value(&mut state, key, value)
    }

    fn putkeep(&self, key: &[u8], value: V) -> ShelfResult<()> {
        self.check_key(key)?;
        value.validate()?;
        let mut state = self.writable()?;
        if state.table.contains(key) {
            return Err(ShelfError::AlreadyExists { key: key.to_vec() });
        }
        self.store_value(&mut state, key, value)
    }

    fn putcat(&self, key: &[u8], value: V) -> ShelfResult<()> {
        self.check_key(key)?;
        value.validate()?;
        let mut state = self.writable()?;
        let merged = match state.table.get(key) {
            Some(existing) => {
                let mut merged = existing.clone();
                merged.concat(value);
                merged
            }
            None => value,
        };
        self.store_value(&mut state, key, merged)
    }

    fn remove(&self, key: &[u8]) -> ShelfResult<()> {
        validate_key(key)?;
        let mut state = self.writable()?;
        if !state.table.contains(key) {
            return Err(ShelfError::NotFound { key: key.to_vec() });
        }
        state.append(key, &[], Operation::Delete)?;
        state.table.remove(key);
        state.version += 1;
        Ok(())
    }

    fn clear(&self) -> ShelfResult<()> {
        let mut state = self.writable()?;
        state.append(&[], &[], Operation::Clear)?;
        state.table.clear();
        state.version += 1;
        Ok(())
    }

    fn len(&self) -> ShelfResult<usize> {
        Ok(self.readable()?.table.len())
    }

    fn search_keys(&self, prefix: &[u8], limit: Option<usize>) -> ShelfResult<HashSet<Vec<u8>>> {
        validate_key(prefix)?;
        let state = self.readable()?;
        let limit = limit.unwrap_or(usize::MAX);
        Ok(state
            .table
            .slots()
            .filter(|slot| slot.key.starts_with(prefix))
            .take(limit)
            .map(|slot| slot.key.clone())
            .collect())
    }
}

impl<V: RecordValue> fmt::Debug for Store<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("Store")
            .field("shape", &V::SHAPE)
            .field("path", &state.path())
            .field("records", &state.table.len())
            .field("version", &state.version)
            .field("closed", &state.closed)
            .finish()
    }
}
