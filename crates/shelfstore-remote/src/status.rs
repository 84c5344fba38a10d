//! Server counters and the status report built from them.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use shelfstore_core::{ErrorKind, FieldStore, ShelfResult, StoreStats};

use crate::protocol::{Opcode, OPCODE_COUNT, PROTOCOL_VERSION};

/// Number of entries in a status report.
pub const STATUS_FIELDS: usize = 48;

/// Counters shared by every connection of one server.
pub struct ServerStats {
    started: Instant,
    started_unix: u64,
    session_id: u64,
    connections_open: AtomicU64,
    connections_total: AtomicU64,
    requests: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    /// One counter per opcode, in `Opcode::ALL` order
    ops: [AtomicU64; OPCODE_COUNT],
    miss_get: AtomicU64,
    miss_remove: AtomicU64,
    miss_putkeep: AtomicU64,
    errors_invalid: AtomicU64,
    errors_stale: AtomicU64,
    errors_failure: AtomicU64,
}

impl ServerStats {
    pub fn new() -> Self {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        Self {
            started: Instant::now(),
            started_unix: now.as_secs(),
            session_id: ((std::process::id() as u64) << 32) ^ now.subsec_nanos() as u64,
            connections_open: AtomicU64::new(0),
            connections_total: AtomicU64::new(0),
            requests: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            ops: std::array::from_fn(|_| AtomicU64::new(0)),
            miss_get: AtomicU64::new(0),
            miss_remove: AtomicU64::new(0),
            miss_putkeep: AtomicU64::new(0),
            errors_invalid: AtomicU64::new(0),
            errors_stale: AtomicU64::new(0),
            errors_failure: AtomicU64::new(0),
        }
    }

    pub fn connection_opened(&self) {
        self.connections_open.fetch_add(1, Ordering::Relaxed);
        self.connections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections_open.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn traffic(&self, received: usize, sent: usize) {
        self.bytes_in.fetch_add(received as u64, Ordering::Relaxed);
        self.bytes_out.fetch_add(sent as u64, Ordering::Relaxed);
    }

    /// Count one request and classify its outcome.
    pub fn record<T>(&self, op: Opcode, result: &ShelfResult<T>) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if let Some(i) = Opcode::ALL.iter().position(|o| *o == op) {
            self.ops[i].fetch_add(1, Ordering::Relaxed);
        }
        let Err(err) = result else { return };
        let counter = match (err.kind(), op) {
            (ErrorKind::NotFound, Opcode::Get) => &self.miss_get,
            (ErrorKind::NotFound, Opcode::Remove) => &self.miss_remove,
            (ErrorKind::AlreadyExists, Opcode::PutKeep) => &self.miss_putkeep,
            (ErrorKind::NotFound, _) | (ErrorKind::AlreadyExists, _) => return,
            (ErrorKind::InvalidArgument, _) => &self.errors_invalid,
            (ErrorKind::Staleness, _) => &self.errors_stale,
            _ => &self.errors_failure,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    fn op_count(&self, op: Opcode) -> u64 {
        Opcode::ALL
            .iter()
            .position(|o| *o == op)
            .map_or(0, |i| self.ops[i].load(Ordering::Relaxed))
    }

    /// Full status report for `store` served at `bind`.
    pub fn report(&self, store: &FieldStore, bind: SocketAddr) -> Vec<(String, String)> {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed).to_string();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let stats = store.stats().ok();

        let fields: [(&str, String); STATUS_FIELDS] = [
            ("version", env!("CARGO_PKG_VERSION").to_string()),
            ("protocol_version", PROTOCOL_VERSION.to_string()),
            ("os", std::env::consts::OS.to_string()),
            ("arch", std::env::consts::ARCH.to_string()),
            ("pid", std::process::id().to_string()),
            ("session_id", format!("{:016x}", self.session_id)),
            ("time", now.to_string()),
            ("started", self.started_unix.to_string()),
            ("uptime_secs", self.started.elapsed().as_secs().to_string()),
            ("bind", bind.to_string()),
            // 10
            ("path", store_field(&stats, |s| s.path.as_ref().map(|p| p.display().to_string()).unwrap_or_default())),
            ("shape", store_field(&stats, |s| s.shape.as_str().to_string())),
            ("records", store_field(&stats, |s| s.records.to_string())),
            ("size", store_field(&stats, |s| s.byte_size.to_string())),
            ("log_entries", store_field(&stats, |s| s.log_entries.to_string())),
            ("live_bytes", store_field(&stats, |s| s.live_bytes.to_string())),
            ("dead_ratio", store_field(&stats, |s| format!("{:.4}", s.dead_ratio()))),
            ("read_only", store_field(&stats, |s| s.read_only.to_string())),
            ("sync_policy", store_field(&stats, |s| s.sync_policy.as_str().to_string())),
            ("db_version", store_field(&stats, |s| s.version.to_string())),
            // 20
            ("connections_open", load(&self.connections_open)),
            ("connections_total", load(&self.connections_total)),
            ("requests", load(&self.requests)),
            ("bytes_in", load(&self.bytes_in)),
            ("bytes_out", load(&self.bytes_out)),
            ("op_put", self.op_count(Opcode::Put).to_string()),
            ("op_putkeep", self.op_count(Opcode::PutKeep).to_string()),
            ("op_putcat", self.op_count(Opcode::PutCat).to_string()),
            ("op_remove", self.op_count(Opcode::Remove).to_string()),
            ("op_get", self.op_count(Opcode::Get).to_string()),
            // 30
            ("op_contains", self.op_count(Opcode::Contains).to_string()),
            ("op_key_at", self.op_count(Opcode::KeyAt).to_string()),
            ("op_entry_at", self.op_count(Opcode::EntryAt).to_string()),
            ("op_version", self.op_count(Opcode::Version).to_string()),
            ("op_search", self.op_count(Opcode::Search).to_string()),
            ("op_sync", self.op_count(Opcode::Sync).to_string()),
            ("op_optimize", self.op_count(Opcode::Optimize).to_string()),
            ("op_clear", self.op_count(Opcode::Clear).to_string()),
            ("op_copy", self.op_count(Opcode::Copy).to_string()),
            ("op_len", self.op_count(Opcode::Len).to_string()),
            // 40
            ("op_size", self.op_count(Opcode::Size).to_string()),
            ("op_status", self.op_count(Opcode::Status).to_string()),
            ("miss_get", load(&self.miss_get)),
            ("miss_remove", load(&self.miss_remove)),
            ("miss_putkeep", load(&self.miss_putkeep)),
            ("errors_invalid", load(&self.errors_invalid)),
            ("errors_stale", load(&self.errors_stale)),
            ("errors_failure", load(&self.errors_failure)),
        ];

        fields
            .into_iter()
            .map(|(name, value)| (name.to_string(), value))
            .collect()
    }
}

fn store_field(stats: &Option<StoreStats>, field: impl Fn(&StoreStats) -> String) -> String {
    stats.as_ref().map(field).unwrap_or_else(|| "closed".to_string())
}

impl Default for ServerStats {
    fn default() -> Self { Self::new() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shelfstore_core::{KvStore, ShelfError, Store};

    #[test]
    fn test_report_has_all_fields() {
        let stats = ServerStats::new();
        let store: FieldStore = Store::memory();
        let report = stats.report(&store, "127.0.0.1:9".parse().unwrap());
        assert_eq!(report.len(), STATUS_FIELDS);

        let mut names: Vec<&str> = report.iter().map(|(n, _)| n.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), STATUS_FIELDS);
    }

    #[test]
    fn test_record_classifies_outcomes() {
        let stats = ServerStats::new();
        stats.record::<()>(Opcode::Get, &Err(ShelfError::NotFound { key: b"k".to_vec() }));
        stats.record::<()>(Opcode::Put, &Err(ShelfError::invalid("nul")));
        stats.record(Opcode::Len, &Ok(3u64));
        assert_eq!(stats.requests(), 3);
        assert_eq!(stats.miss_get.load(Ordering::Relaxed), 1);
        assert_eq!(stats.errors_invalid.load(Ordering::Relaxed), 1);
        assert_eq!(stats.op_count(Opcode::Len), 1);
    }

    #[test]
    fn test_report_reflects_store() {
        let stats = ServerStats::new();
        let store: FieldStore = Store::memory();
        store.put(b"a", Default::default()).unwrap();
        let report = stats.report(&store, "127.0.0.1:9".parse().unwrap());
        let records = report.iter().find(|(n, _)| n == "records").map(|(_, v)| v.as_str());
        assert_eq!(records, Some("1"));

        store.close().unwrap();
        let report = stats.report(&store, "127.0.0.1:9".parse().unwrap());
        assert_eq!(report.len(), STATUS_FIELDS);
    }
}
