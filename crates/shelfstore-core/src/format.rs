//! Binary format definitions for the shelfstore record log
//!
//! A database file is a 16-byte [`FileHeader`] followed by log records:
//! ChunkHeader (32 bytes) + key_len(u16) + value_len(u32) + operation(u8) + padding(u8) + key_bytes + value_bytes

use crate::error::{ShelfError, ShelfResult};
use crate::value::ValueShape;

/// File magic: "SHLF"
pub const FILE_MAGIC: [u8; 4] = *b"SHLF";

/// Record magic: "SHRC"
pub const MAGIC_ARRAY: [u8; 4] = *b"SHRC";

/// Current file format version
pub const FORMAT_VERSION: u8 = 1;

/// File header size in bytes
pub const FILE_HEADER_SIZE: usize = 16;

/// Record header size in bytes
pub const HEADER_SIZE: usize = 32;

/// Fixed payload prefix: key_len(2) + value_len(4) + op(1) + pad(1)
pub const PAYLOAD_PREFIX_SIZE: usize = 8;

/// Hard key limit imposed by the u16 length field
pub const MAX_KEY_SIZE: usize = u16::MAX as usize;

/// Hard value limit (256MB)
pub const MAX_VALUE_SIZE: usize = 256 * 1024 * 1024;

/// Log operation types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Operation {
    /// Insert or replace a record
    Put = 1,
    /// Delete a record
    Delete = 2,
    /// Drop every record
    Clear = 3,
}

impl Operation {
    fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Operation::Put),
            2 => Some(Operation::Delete),
            3 => Some(Operation::Clear),
            _ => None,
        }
    }
}

/// First 16 bytes of every database file.
///
/// Layout:
///   [0..4]   magic:   "SHLF"
///   [4]      version: u8
///   [5]      shape:   u8  - ValueShape tag
///   [6..16]  reserved, zero
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub version: u8,
    pub shape: ValueShape,
}

impl FileHeader {
    pub fn new(shape: ValueShape) -> Self {
        Self { version: FORMAT_VERSION, shape }
    }

    pub fn to_bytes(&self) -> [u8; FILE_HEADER_SIZE] {
        let mut buf = [0u8; FILE_HEADER_SIZE];
        buf[0..4].copy_from_slice(&FILE_MAGIC);
        buf[4] = self.version;
        buf[5] = self.shape as u8;
        buf
    }

    /// Parse and validate; `path` is only used for error context.
    pub fn from_bytes(bytes: &[u8], path: &std::path::Path) -> ShelfResult<Self> {
        if bytes.len() < FILE_HEADER_SIZE || bytes[0..4] != FILE_MAGIC {
            return Err(ShelfError::Corrupted {
                path: path.to_path_buf(),
                offset: 0,
                reason: "missing SHLF file header".to_string(),
            });
        }
        if bytes[4] != FORMAT_VERSION {
            return Err(ShelfError::Corrupted {
                path: path.to_path_buf(),
                offset: 4,
                reason: format!("unsupported format version {}", bytes[4]),
            });
        }
        let shape = ValueShape::from_u8(bytes[5]).ok_or_else(|| ShelfError::Corrupted {
            path: path.to_path_buf(),
            offset: 5,
            reason: format!("unknown value shape tag {}", bytes[5]),
        })?;
        Ok(Self { version: bytes[4], shape })
    }
}

/// Fixed-size header for each log record
/// Size: 32 bytes
///
/// Layout:
///   [0..4]   magic:      "SHRC"
///   [4..8]   length:     u32  - payload length in bytes
///   [8..12]  checksum:   u32  - CRC32C of payload bytes
///   [12]     entry_type: u8   - operation type
///   [13..32] reserved, zero
#[derive(Debug, Clone, Copy)]
pub struct ChunkHeader {
    pub magic: [u8; 4],
    pub length: u32,
    pub checksum: u32,
    pub entry_type: u8,
}

impl ChunkHeader {
    pub fn new(length: u32, checksum: u32, entry_type: Operation) -> Self {
        Self {
            magic: MAGIC_ARRAY,
            length,
            checksum,
            entry_type: entry_type as u8,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic);
        buf[4..8].copy_from_slice(&self.length.to_le_bytes());
        buf[8..12].copy_from_slice(&self.checksum.to_le_bytes());
        buf[12] = self.entry_type;
        buf
    }

    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Self {
        Self {
            magic: [bytes[0], bytes[1], bytes[2], bytes[3]],
            length: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            checksum: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            entry_type: bytes[12],
        }
    }
}

/// A decoded log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Position of the record in its file
    pub offset: u64,
    pub operation: Operation,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Serialize one record, header included.
pub fn serialize_record(key: &[u8], value: &[u8], op: Operation) -> ShelfResult<Vec<u8>> {
    // Validate input sizes BEFORE any allocation
    if key.len() > MAX_KEY_SIZE {
        return Err(ShelfError::OversizedEntry {
            entry_size: key.len() as u64,
            max_size: MAX_KEY_SIZE as u64,
            component: "key",
        });
    }
    if value.len() > MAX_VALUE_SIZE {
        return Err(ShelfError::OversizedEntry {
            entry_size: value.len() as u64,
            max_size: MAX_VALUE_SIZE as u64,
            component: "value",
        });
    }

    let payload_size = PAYLOAD_PREFIX_SIZE + key.len() + value.len();
    let mut buffer = Vec::with_capacity(HEADER_SIZE + payload_size);
    buffer.resize(HEADER_SIZE, 0);
    buffer.extend_from_slice(&(key.len() as u16).to_le_bytes());
    buffer.extend_from_slice(&(value.len() as u32).to_le_bytes());
    buffer.push(op as u8);
    buffer.push(0);
    buffer.extend_from_slice(key);
    buffer.extend_from_slice(value);

    let checksum = crc32c::crc32c(&buffer[HEADER_SIZE..]);
    let header = ChunkHeader::new(payload_size as u32, checksum, op);
    buffer[..HEADER_SIZE].copy_from_slice(&header.to_bytes());
    Ok(buffer)
}

/// Deserialize one record from the start of `data`.
///
/// `offset` is the record's position in its file and only feeds error context.
pub fn deserialize_record(data: &[u8], offset: u64) -> ShelfResult<LogRecord> {
    if data.len() < HEADER_SIZE {
        return Err(ShelfError::Corrupted {
            path: "<buffer>".into(),
            offset,
            reason: format!("record too short: {} bytes, need at least {}", data.len(), HEADER_SIZE),
        });
    }

    let mut header_bytes = [0u8; HEADER_SIZE];
    header_bytes.copy_from_slice(&data[..HEADER_SIZE]);
    let header = ChunkHeader::from_bytes(&header_bytes);

    if header.magic != MAGIC_ARRAY {
        return Err(ShelfError::Corrupted {
            path: "<buffer>".into(),
            offset,
            reason: format!("bad record magic {:02x?}", header.magic),
        });
    }

    let payload_end = HEADER_SIZE + header.length as usize;
    if data.len() < payload_end {
        return Err(ShelfError::Corrupted {
            path: "<buffer>".into(),
            offset,
            reason: format!(
                "torn record: need {} payload bytes, have {}",
                header.length,
                data.len() - HEADER_SIZE
            ),
        });
    }

    let payload = &data[HEADER_SIZE..payload_end];
    let computed = crc32c::crc32c(payload);
    if computed != header.checksum {
        return Err(ShelfError::ChecksumMismatch {
            expected: header.checksum,
            actual: computed,
            offset,
        });
    }

    if payload.len() < PAYLOAD_PREFIX_SIZE {
        return Err(ShelfError::Corrupted {
            path: "<buffer>".into(),
            offset,
            reason: "payload too short for length fields".to_string(),
        });
    }

    let key_len = u16::from_le_bytes([payload[0], payload[1]]) as usize;
    let value_len = u32::from_le_bytes([payload[2], payload[3], payload[4], payload[5]]) as usize;
    let operation = Operation::from_u8(payload[6]).ok_or_else(|| ShelfError::Corrupted {
        path: "<buffer>".into(),
        offset,
        reason: format!("invalid operation type {}", payload[6]),
    })?;

    let key_end = PAYLOAD_PREFIX_SIZE + key_len;
    let value_end = key_end + value_len;
    if payload.len() != value_end {
        return Err(ShelfError::Corrupted {
            path: "<buffer>".into(),
            offset,
            reason: format!(
                "payload is {} bytes but key({}) + value({}) need {}",
                payload.len(),
                key_len,
                value_len,
                value_end
            ),
        });
    }

    Ok(LogRecord {
        offset,
        operation,
        key: payload[PAYLOAD_PREFIX_SIZE..key_end].to_vec(),
        value: payload[key_end..value_end].to_vec(),
    })
}

/// Total on-disk length of the record starting at `data`, if its header is readable.
pub fn record_len(data: &[u8]) -> Option<usize> {
    if data.len() < HEADER_SIZE || data[0..4] != MAGIC_ARRAY {
        return None;
    }
    let length = u32::from_le_bytes([data[4], data[5], data[6], data[7]]) as usize;
    Some(HEADER_SIZE + length)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_deserialize_roundtrip() {
        let serialized = serialize_record(b"test_key", b"test\0value", Operation::Put).unwrap();
        let record = deserialize_record(&serialized, 0).unwrap();

        assert_eq!(record.key, b"test_key");
        assert_eq!(record.value, b"test\0value");
        assert_eq!(record.operation, Operation::Put);
        assert_eq!(record_len(&serialized), Some(serialized.len()));
    }

    #[test]
    fn test_clear_record_has_empty_key() {
        let serialized = serialize_record(b"", b"", Operation::Clear).unwrap();
        let record = deserialize_record(&serialized, 0).unwrap();
        assert_eq!(record.operation, Operation::Clear);
        assert!(record.key.is_empty());
    }

    #[test]
    fn test_oversized_key_rejected() {
        let key = vec![0x41u8; MAX_KEY_SIZE + 1];
        let result = serialize_record(&key, b"val", Operation::Put);
        assert!(matches!(result, Err(ShelfError::OversizedEntry { component: "key", .. })));
    }

    #[test]
    fn test_corrupted_magic_detected() {
        let mut data = serialize_record(b"key", b"value", Operation::Put).unwrap();
        data[0] = 0xFF;
        assert!(matches!(deserialize_record(&data, 0), Err(ShelfError::Corrupted { .. })));
        assert_eq!(record_len(&data), None);
    }

    #[test]
    fn test_corrupted_payload_detected() {
        let mut data = serialize_record(b"key", b"value", Operation::Put).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        assert!(matches!(
            deserialize_record(&data, 64),
            Err(ShelfError::ChecksumMismatch { offset: 64, .. })
        ));
    }

    #[test]
    fn test_file_header_shape() {
        let header = FileHeader::new(ValueShape::Fields);
        let bytes = header.to_bytes();
        let parsed = FileHeader::from_bytes(&bytes, std::path::Path::new("x")).unwrap();
        assert_eq!(parsed, header);

        let mut bad = bytes;
        bad[5] = 9;
        assert!(FileHeader::from_bytes(&bad, std::path::Path::new("x")).is_err());
    }
}
