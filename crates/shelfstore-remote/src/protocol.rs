//! Wire protocol between `RemoteClient` and the server.
//!
//! Every message is one frame:
//!
//! ```text
//!   [0..4]   magic:    "SHRP"
//!   [4..8]   length:   u32 LE - payload length
//!   [8..12]  checksum: u32 LE - CRC32C of the payload
//!   [12]     code:     u8     - opcode (request) or status (response)
//!   [13..16] reserved, zero
//! ```
//!
//! Payload fields are little-endian integers and `u32`-length-prefixed blobs.

use std::io::{self, Read, Write};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use shelfstore_core::{ErrorKind, ShelfError, ShelfResult};

pub const FRAME_MAGIC: [u8; 4] = *b"SHRP";
pub const FRAME_HEADER_SIZE: usize = 16;
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest payload accepted unless configured otherwise.
pub const DEFAULT_MAX_FRAME: usize = 64 * 1024 * 1024;

/// Search limit meaning "no limit".
pub const UNBOUNDED: u64 = u64::MAX;

pub const OPCODE_COUNT: usize = 17;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Put = 0x10,
    PutKeep = 0x11,
    PutCat = 0x12,
    Remove = 0x20,
    Get = 0x30,
    Contains = 0x31,
    KeyAt = 0x50,
    EntryAt = 0x51,
    Version = 0x52,
    Search = 0x58,
    Sync = 0x70,
    Optimize = 0x71,
    Clear = 0x72,
    Copy = 0x73,
    Len = 0x80,
    Size = 0x81,
    Status = 0x88,
}

impl Opcode {
    pub const ALL: [Opcode; OPCODE_COUNT] = [
        Opcode::Put,
        Opcode::PutKeep,
        Opcode::PutCat,
        Opcode::Remove,
        Opcode::Get,
        Opcode::Contains,
        Opcode::KeyAt,
        Opcode::EntryAt,
        Opcode::Version,
        Opcode::Search,
        Opcode::Sync,
        Opcode::Optimize,
        Opcode::Clear,
        Opcode::Copy,
        Opcode::Len,
        Opcode::Size,
        Opcode::Status,
    ];

    pub fn from_u8(byte: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|op| *op as u8 == byte)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Opcode::Put => "put",
            Opcode::PutKeep => "putkeep",
            Opcode::PutCat => "putcat",
            Opcode::Remove => "remove",
            Opcode::Get => "get",
            Opcode::Contains => "contains",
            Opcode::KeyAt => "key_at",
            Opcode::EntryAt => "entry_at",
            Opcode::Version => "version",
            Opcode::Search => "search",
            Opcode::Sync => "sync",
            Opcode::Optimize => "optimize",
            Opcode::Clear => "clear",
            Opcode::Copy => "copy",
            Opcode::Len => "len",
            Opcode::Size => "size",
            Opcode::Status => "status",
        }
    }
}

/// Response status carried in the frame code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Ok = 0,
    NotFound = 1,
    AlreadyExists = 2,
    InvalidArgument = 3,
    Stale = 4,
    Failure = 5,
    ReadOnly = 6,
}

impl Status {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Status::Ok),
            1 => Some(Status::NotFound),
            2 => Some(Status::AlreadyExists),
            3 => Some(Status::InvalidArgument),
            4 => Some(Status::Stale),
            5 => Some(Status::Failure),
            6 => Some(Status::ReadOnly),
            _ => None,
        }
    }

    /// Status the server answers with for a failed operation.
    pub fn for_error(err: &ShelfError) -> Self {
        match err.kind() {
            ErrorKind::NotFound => Status::NotFound,
            ErrorKind::AlreadyExists => Status::AlreadyExists,
            ErrorKind::InvalidArgument => Status::InvalidArgument,
            ErrorKind::Staleness => Status::Stale,
            ErrorKind::ReadOnly => Status::ReadOnly,
            _ => Status::Failure,
        }
    }
}

/// Error payload for a failed operation.
pub fn encode_error(err: &ShelfError) -> BytesMut {
    let mut out = BytesMut::new();
    if let ShelfError::Stale { expected, current } = err {
        out.put_u64_le(*expected);
        out.put_u64_le(*current);
    } else {
        put_blob(&mut out, err.to_string().as_bytes());
    }
    out
}

/// Rebuild the error a server reported. `key` is the request's key, if any.
pub fn decode_error(status: Status, payload: &[u8], key: Option<&[u8]>) -> ShelfError {
    let key = key.map(<[u8]>::to_vec).unwrap_or_default();
    if status == Status::Stale {
        let mut reader = PayloadReader::new(payload);
        return match (reader.u64(), reader.u64()) {
            (Ok(expected), Ok(current)) => ShelfError::Stale { expected, current },
            _ => ShelfError::protocol("malformed stale response"),
        };
    }
    let message = PayloadReader::new(payload)
        .blob()
        .map(|m| String::from_utf8_lossy(m).into_owned())
        .unwrap_or_default();
    match status {
        Status::NotFound => ShelfError::NotFound { key },
        Status::AlreadyExists => ShelfError::AlreadyExists { key },
        Status::InvalidArgument => ShelfError::invalid(message),
        Status::ReadOnly => ShelfError::ReadOnly,
        _ => ShelfError::Io {
            path: None,
            kind: io::ErrorKind::Other,
            message: format!("server failure: {}", message),
        },
    }
}

/// One decoded frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub code: u8,
    pub payload: Bytes,
}

/// Serialize a frame, header included.
pub fn encode_frame(code: u8, payload: &[u8]) -> BytesMut {
    let mut out = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
    out.put_slice(&FRAME_MAGIC);
    out.put_u32_le(payload.len() as u32);
    out.put_u32_le(crc32c::crc32c(payload));
    out.put_u8(code);
    out.put_bytes(0, 3);
    out.put_slice(payload);
    out
}

pub fn write_frame<W: Write>(writer: &mut W, code: u8, payload: &[u8]) -> ShelfResult<()> {
    writer
        .write_all(&encode_frame(code, payload))
        .and_then(|_| writer.flush())
        .map_err(|e| ShelfError::connectivity(format!("send failed: {}", e)))
}

/// Read one frame. `Ok(None)` means the peer closed the stream between frames.
pub fn read_frame<R: Read>(reader: &mut R, max_frame: usize) -> ShelfResult<Option<Frame>> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    let mut filled = 0;
    while filled < FRAME_HEADER_SIZE {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(ShelfError::connectivity("connection closed mid-frame")),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ShelfError::connectivity(format!("receive failed: {}", e))),
        }
    }

    let head = parse_header(&header, max_frame)?;
    let mut payload = vec![0u8; head.length];
    reader
        .read_exact(&mut payload)
        .map_err(|e| ShelfError::connectivity(format!("receive failed: {}", e)))?;
    head.finish(payload).map(Some)
}

/// Async counterpart of [`write_frame`], used by the server.
pub async fn write_frame_async<W: AsyncWrite + Unpin>(writer: &mut W, code: u8, payload: &[u8]) -> ShelfResult<()> {
    let wire = encode_frame(code, payload);
    let sent = match writer.write_all(&wire).await {
        Ok(()) => writer.flush().await,
        Err(e) => Err(e),
    };
    sent.map_err(|e| ShelfError::connectivity(format!("send failed: {}", e)))
}

/// Async counterpart of [`read_frame`], used by the server.
pub async fn read_frame_async<R: AsyncRead + Unpin>(reader: &mut R, max_frame: usize) -> ShelfResult<Option<Frame>> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    let mut filled = 0;
    while filled < FRAME_HEADER_SIZE {
        match reader.read(&mut header[filled..]).await {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(ShelfError::connectivity("connection closed mid-frame")),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ShelfError::connectivity(format!("receive failed: {}", e))),
        }
    }

    let head = parse_header(&header, max_frame)?;
    let mut payload = vec![0u8; head.length];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| ShelfError::connectivity(format!("receive failed: {}", e)))?;
    head.finish(payload).map(Some)
}

struct FrameHead {
    code: u8,
    length: usize,
    checksum: u32,
}

impl FrameHead {
    fn finish(self, payload: Vec<u8>) -> ShelfResult<Frame> {
        let computed = crc32c::crc32c(&payload);
        if computed != self.checksum {
            return Err(ShelfError::protocol(format!(
                "frame checksum mismatch: expected 0x{:08x}, got 0x{:08x}",
                self.checksum, computed
            )));
        }
        Ok(Frame { code: self.code, payload: Bytes::from(payload) })
    }
}

fn parse_header(header: &[u8; FRAME_HEADER_SIZE], max_frame: usize) -> ShelfResult<FrameHead> {
    let mut head = &header[..];
    let mut magic = [0u8; 4];
    head.copy_to_slice(&mut magic);
    if magic != FRAME_MAGIC {
        return Err(ShelfError::protocol(format!("bad frame magic {:02x?}", magic)));
    }
    let length = head.get_u32_le() as usize;
    let checksum = head.get_u32_le();
    let code = head.get_u8();
    if length > max_frame {
        return Err(ShelfError::protocol(format!(
            "frame of {} bytes exceeds limit of {}",
            length, max_frame
        )));
    }
    Ok(FrameHead { code, length, checksum })
}

pub fn put_blob(out: &mut BytesMut, bytes: &[u8]) {
    out.put_u32_le(bytes.len() as u32);
    out.put_slice(bytes);
}

/// Bounds-checked cursor over a payload.
pub struct PayloadReader<'a> {
    buf: &'a [u8],
}

impl<'a> PayloadReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn need(&self, n: usize, what: &str) -> ShelfResult<()> {
        if self.buf.remaining() < n {
            return Err(ShelfError::protocol(format!(
                "payload truncated reading {}: need {} bytes, have {}",
                what,
                n,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub fn u8(&mut self) -> ShelfResult<u8> {
        self.need(1, "u8")?;
        Ok(self.buf.get_u8())
    }

    pub fn u32(&mut self) -> ShelfResult<u32> {
        self.need(4, "u32")?;
        Ok(self.buf.get_u32_le())
    }

    pub fn u64(&mut self) -> ShelfResult<u64> {
        self.need(8, "u64")?;
        Ok(self.buf.get_u64_le())
    }

    pub fn bool(&mut self) -> ShelfResult<bool> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ShelfError::protocol(format!("invalid bool byte {}", other))),
        }
    }

    pub fn blob(&mut self) -> ShelfResult<&'a [u8]> {
        let len = self.u32()? as usize;
        self.need(len, "blob")?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    pub fn string(&mut self) -> ShelfResult<String> {
        String::from_utf8(self.blob()?.to_vec())
            .map_err(|_| ShelfError::protocol("string field is not valid UTF-8"))
    }

    /// Fail if anything is left over.
    pub fn finish(&self) -> ShelfResult<()> {
        if !self.buf.is_empty() {
            return Err(ShelfError::protocol(format!(
                "{} trailing payload bytes",
                self.buf.len()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let mut payload = BytesMut::new();
        put_blob(&mut payload, b"key\0with nul");
        payload.put_u64_le(42);
        let wire = encode_frame(Opcode::Get as u8, &payload);

        let frame = read_frame(&mut &wire[..], DEFAULT_MAX_FRAME).unwrap().unwrap();
        assert_eq!(Opcode::from_u8(frame.code), Some(Opcode::Get));
        let mut reader = PayloadReader::new(&frame.payload);
        assert_eq!(reader.blob().unwrap(), b"key\0with nul");
        assert_eq!(reader.u64().unwrap(), 42);
        reader.finish().unwrap();
    }

    #[test]
    fn test_clean_eof_is_none() {
        let empty: &[u8] = &[];
        assert!(read_frame(&mut &empty[..], DEFAULT_MAX_FRAME).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_payload_is_protocol_error() {
        let mut wire = encode_frame(Status::Ok as u8, b"hello").to_vec();
        let last = wire.len() - 1;
        wire[last] ^= 0xFF;
        let err = read_frame(&mut &wire[..], DEFAULT_MAX_FRAME).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let wire = encode_frame(Opcode::Put as u8, &[0u8; 32]);
        let err = read_frame(&mut &wire[..], 16).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[tokio::test]
    async fn test_async_frame_matches_blocking_codec() {
        let mut wire = Vec::new();
        write_frame_async(&mut wire, Status::NotFound as u8, b"missing").await.unwrap();
        assert_eq!(wire, encode_frame(Status::NotFound as u8, b"missing").to_vec());

        let frame = read_frame_async(&mut &wire[..], DEFAULT_MAX_FRAME).await.unwrap().unwrap();
        assert_eq!(frame.code, Status::NotFound as u8);
        assert_eq!(&frame.payload[..], b"missing");

        let empty: &[u8] = &[];
        assert!(read_frame_async(&mut &empty[..], DEFAULT_MAX_FRAME).await.unwrap().is_none());

        let err = read_frame_async(&mut &wire[..5], DEFAULT_MAX_FRAME).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connectivity);
    }

    #[test]
    fn test_truncated_payload_reader() {
        let mut reader = PayloadReader::new(&[5, 0, 0, 0, b'a']);
        assert_eq!(reader.blob().unwrap_err().kind(), ErrorKind::Protocol);
    }

    #[test]
    fn test_error_status_roundtrip() {
        let stale = ShelfError::Stale { expected: 3, current: 5 };
        let payload = encode_error(&stale);
        assert!(matches!(
            decode_error(Status::for_error(&stale), &payload, None),
            ShelfError::Stale { expected: 3, current: 5 }
        ));

        let missing = ShelfError::NotFound { key: b"k".to_vec() };
        let payload = encode_error(&missing);
        assert!(matches!(
            decode_error(Status::for_error(&missing), &payload, Some(&b"k"[..])),
            ShelfError::NotFound { key } if key == b"k"
        ));
    }

    #[test]
    fn test_opcode_codes_unique() {
        for op in Opcode::ALL {
            assert_eq!(Opcode::from_u8(op as u8), Some(op));
        }
        assert_eq!(Opcode::from_u8(0xFF), None);
    }
}
