//! RemoteClient: a `KvStore` whose records live on a server.
//!
//! One TCP connection, one request in flight at a time (the connection sits
//! behind a mutex). Any I/O or framing failure drops the connection; later
//! calls fail `Connectivity` until `open` is called again. Nothing is retried.

use std::collections::HashSet;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::path::Path;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use shelfstore_core::{
    validate_key, CompactionResult, CursorSource, ErrorKind, FieldMap, KvStore, RecordValue,
    ShelfError, ShelfResult,
};

use crate::config::ClientConfig;
use crate::protocol::{
    decode_error, put_blob, read_frame, write_frame, Opcode, PayloadReader, Status, UNBOUNDED,
};

struct Connection {
    stream: TcpStream,
    peer: String,
}

/// Client for a shelfstore server holding multi-field records.
pub struct RemoteClient {
    conn: Mutex<Option<Connection>>,
    config: ClientConfig,
}

impl RemoteClient {
    /// Unconnected client with default settings.
    pub fn new() -> Self {
        Self::with_config(ClientConfig::default())
    }

    pub fn with_config(config: ClientConfig) -> Self {
        Self {
            conn: Mutex::new(None),
            config,
        }
    }

    /// Connect to `host:port`, replacing any existing connection.
    pub fn open(&self, host: &str, port: u16) -> ShelfResult<()> {
        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(|e| ShelfError::connectivity(format!("cannot resolve {}:{}: {}", host, port, e)))?;

        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.config.connect_timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    stream.set_read_timeout(self.config.io_timeout)?;
                    stream.set_write_timeout(self.config.io_timeout)?;
                    let peer = addr.to_string();
                    info!(peer = %peer, "connected");
                    if let Some(old) = self.conn.lock().replace(Connection { stream, peer }) {
                        let _ = old.stream.shutdown(Shutdown::Both);
                    }
                    return Ok(());
                }
                Err(e) => last_error = Some(e),
            }
        }
        Err(ShelfError::connectivity(match last_error {
            Some(e) => format!("cannot connect to {}:{}: {}", host, port, e),
            None => format!("{}:{} resolved to no addresses", host, port),
        }))
    }

    /// Drop the connection. Fails `Connectivity` if there is none.
    pub fn close(&self) -> ShelfResult<()> {
        match self.conn.lock().take() {
            Some(conn) => {
                let _ = conn.stream.shutdown(Shutdown::Both);
                debug!(peer = %conn.peer, "connection closed");
                Ok(())
            }
            None => Err(ShelfError::connectivity("not connected")),
        }
    }

    pub fn is_open(&self) -> bool {
        self.conn.lock().is_some()
    }

    /// One request/response exchange. Transport failures drop the connection.
    fn call(&self, op: Opcode, payload: &[u8]) -> ShelfResult<(Status, Bytes)> {
        let mut guard = self.conn.lock();
        let conn = guard
            .as_mut()
            .ok_or_else(|| ShelfError::connectivity("not connected"))?;

        let exchange = write_frame(&mut conn.stream, op as u8, payload)
            .and_then(|_| read_frame(&mut conn.stream, self.config.max_frame))
            .and_then(|frame| {
                let frame = frame.ok_or_else(|| ShelfError::connectivity("server closed the connection"))?;
                let status = Status::from_u8(frame.code).ok_or_else(|| {
                    ShelfError::protocol(format!("unknown response status {}", frame.code))
                })?;
                Ok((status, frame.payload))
            });

        if let Err(e) = &exchange {
            warn!(peer = %conn.peer, op = op.name(), error = %e, "dropping connection");
            if let Some(dead) = guard.take() {
                let _ = dead.stream.shutdown(Shutdown::Both);
            }
        }
        exchange
    }

    /// Run `op` and turn a non-Ok status into the matching error.
    fn request(&self, op: Opcode, payload: &[u8], key: Option<&[u8]>) -> ShelfResult<Bytes> {
        let (status, body) = self.call(op, payload)?;
        if status == Status::Ok {
            Ok(body)
        } else {
            Err(decode_error(status, &body, key))
        }
    }

    fn request_u64(&self, op: Opcode) -> ShelfResult<u64> {
        let body = self.request(op, &[], None)?;
        let mut reader = PayloadReader::new(&body);
        let value = reader.u64()?;
        reader.finish()?;
        Ok(value)
    }

    fn put_with(&self, op: Opcode, key: &[u8], value: &FieldMap) -> ShelfResult<()> {
        validate_key(key)?;
        value.validate()?;
        let mut payload = BytesMut::new();
        put_blob(&mut payload, key);
        put_blob(&mut payload, &value.encode());
        self.request(op, &payload, Some(key)).map(drop)
    }

    fn key_request(&self, op: Opcode, key: &[u8]) -> ShelfResult<Bytes> {
        validate_key(key)?;
        let mut payload = BytesMut::new();
        put_blob(&mut payload, key);
        self.request(op, &payload, Some(key))
    }

    /// Server status report: 48 named entries in a fixed order.
    pub fn status(&self) -> ShelfResult<Vec<(String, String)>> {
        let body = self.request(Opcode::Status, &[], None)?;
        let mut reader = PayloadReader::new(&body);
        let count = reader.u32()? as usize;
        let mut fields = Vec::with_capacity(count);
        for _ in 0..count {
            let name = reader.string()?;
            let value = reader.string()?;
            fields.push((name, value));
        }
        reader.finish()?;
        Ok(fields)
    }

    /// Size in bytes of the server's database file.
    pub fn byte_size(&self) -> ShelfResult<u64> {
        self.request_u64(Opcode::Size)
    }

    /// Have the server write a copy of its database to `path` (a path on
    /// the server's file system). Returns the copy's length.
    pub fn copy<P: AsRef<Path>>(&self, path: P) -> ShelfResult<u64> {
        let path = path
            .as_ref()
            .to_str()
            .ok_or_else(|| ShelfError::invalid("copy path is not valid UTF-8"))?;
        if path.is_empty() {
            return Err(ShelfError::invalid("copy path is empty"));
        }
        let mut payload = BytesMut::new();
        put_blob(&mut payload, path.as_bytes());
        let body = self.request(Opcode::Copy, &payload, None)?;
        let mut reader = PayloadReader::new(&body);
        let copied = reader.u64()?;
        reader.finish()?;
        Ok(copied)
    }

    /// Flush the server's log to persistent storage.
    pub fn sync(&self) -> ShelfResult<()> {
        self.request(Opcode::Sync, &[], None).map(drop)
    }

    /// Compact the server's log.
    pub fn optimize(&self) -> ShelfResult<CompactionResult> {
        let body = self.request(Opcode::Optimize, &[], None)?;
        let mut reader = PayloadReader::new(&body);
        let original_entries = reader.u64()?;
        let live_entries = reader.u64()?;
        let original_bytes = reader.u64()?;
        let compacted_bytes = reader.u64()?;
        reader.finish()?;
        Ok(CompactionResult {
            file_path: Default::default(),
            original_entries,
            live_entries,
            removed_entries: original_entries.saturating_sub(live_entries),
            original_bytes,
            compacted_bytes,
        })
    }
}

impl Default for RemoteClient {
    fn default() -> Self { Self::new() }
}

fn position_payload(version: u64, position: usize) -> BytesMut {
    let mut payload = BytesMut::with_capacity(16);
    payload.put_u64_le(version);
    payload.put_u64_le(position as u64);
    payload
}

impl CursorSource for RemoteClient {
    type Value = FieldMap;

    fn cursor_version(&self) -> ShelfResult<u64> {
        self.request_u64(Opcode::Version)
    }

    fn key_at(&self, version: u64, position: usize) -> ShelfResult<Option<Vec<u8>>> {
        let body = self.request(Opcode::KeyAt, &position_payload(version, position), None)?;
        let mut reader = PayloadReader::new(&body);
        let key = if reader.bool()? { Some(reader.blob()?.to_vec()) } else { None };
        reader.finish()?;
        Ok(key)
    }

    fn entry_at(&self, version: u64, position: usize) -> ShelfResult<Option<(Vec<u8>, FieldMap)>> {
        let body = self.request(Opcode::EntryAt, &position_payload(version, position), None)?;
        let mut reader = PayloadReader::new(&body);
        let entry = if reader.bool()? {
            let key = reader.blob()?.to_vec();
            let value = decode_field_map(reader.blob()?)?;
            Some((key, value))
        } else {
            None
        };
        reader.finish()?;
        Ok(entry)
    }
}

/// A field map the server sent that does not decode is a protocol fault.
fn decode_field_map(bytes: &[u8]) -> ShelfResult<FieldMap> {
    FieldMap::decode(bytes).map_err(|e| match e.kind() {
        ErrorKind::InvalidArgument => ShelfError::protocol(format!("bad field map from server: {}", e)),
        _ => e,
    })
}

impl KvStore for RemoteClient {
    fn contains(&self, key: &[u8]) -> ShelfResult<bool> {
        let body = self.key_request(Opcode::Contains, key)?;
        let mut reader = PayloadReader::new(&body);
        let present = reader.bool()?;
        reader.finish()?;
        Ok(present)
    }

    fn lookup(&self, key: &[u8]) -> ShelfResult<Option<FieldMap>> {
        match self.get(key) {
            Ok(value) => Ok(Some(value)),
            Err(ShelfError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn get(&self, key: &[u8]) -> ShelfResult<FieldMap> {
        let body = self.key_request(Opcode::Get, key)?;
        let mut reader = PayloadReader::new(&body);
        let value = decode_field_map(reader.blob()?)?;
        reader.finish()?;
        Ok(value)
    }

    fn put(&self, key: &[u8], value: FieldMap) -> ShelfResult<()> {
        self.put_with(Opcode::Put, key, &value)
    }

    fn putkeep(&self, key: &[u8], value: FieldMap) -> ShelfResult<()> {
        self.put_with(Opcode::PutKeep, key, &value)
    }

    fn putcat(&self, key: &[u8], value: FieldMap) -> ShelfResult<()> {
        self.put_with(Opcode::PutCat, key, &value)
    }

    fn remove(&self, key: &[u8]) -> ShelfResult<()> {
        self.key_request(Opcode::Remove, key).map(drop)
    }

    fn clear(&self) -> ShelfResult<()> {
        self.request(Opcode::Clear, &[], None).map(drop)
    }

    fn len(&self) -> ShelfResult<usize> {
        Ok(self.request_u64(Opcode::Len)? as usize)
    }

    fn search_keys(&self, prefix: &[u8], limit: Option<usize>) -> ShelfResult<HashSet<Vec<u8>>> {
        validate_key(prefix)?;
        let mut payload = BytesMut::new();
        put_blob(&mut payload, prefix);
        payload.put_u64_le(limit.map_or(UNBOUNDED, |n| n as u64));
        let body = self.request(Opcode::Search, &payload, None)?;

        let mut reader = PayloadReader::new(&body);
        let count = reader.u32()? as usize;
        let mut keys = HashSet::with_capacity(count);
        for _ in 0..count {
            keys.insert(reader.blob()?.to_vec());
        }
        reader.finish()?;
        Ok(keys)
    }
}
