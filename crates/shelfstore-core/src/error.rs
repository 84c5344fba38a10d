//! Error types for shelfstore operations
//!
//! Every failure is a `ShelfError` variant. Callers branch on
//! [`ShelfError::kind`], never on the rendered message.

use std::path::PathBuf;

use thiserror::Error;

/// Coarse classification used by callers (and the wire protocol) to branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed key, prefix, value shape or argument
    InvalidArgument,
    /// Key absent on get/remove
    NotFound,
    /// putkeep on a key that is already present
    AlreadyExists,
    /// Iterator advanced after a structural mutation
    Staleness,
    /// Remote operation without a usable connection
    Connectivity,
    /// Peer sent a frame that cannot be decoded
    Protocol,
    /// Local store used after close
    Closed,
    /// Mutation attempted on a store opened without WRITER
    ReadOnly,
    /// Underlying file system failure
    Io,
    /// Backing file failed validation
    Corruption,
}

/// shelfstore error types with detailed context
#[derive(Debug, Clone, Error)]
pub enum ShelfError {
    /// Key, prefix, field map or flag set rejected before touching the store
    #[error("invalid argument: {reason}")]
    InvalidArgument {
        /// What was wrong with the argument
        reason: String,
    },

    /// Key is not present
    #[error("record not found: {}", String::from_utf8_lossy(.key))]
    NotFound {
        /// The missing key
        key: Vec<u8>,
    },

    /// putkeep refused to overwrite
    #[error("record already exists: {}", String::from_utf8_lossy(.key))]
    AlreadyExists {
        /// The existing key
        key: Vec<u8>,
    },

    /// The key set changed since the iterator was created
    #[error("iterator invalidated: store version moved from {expected} to {current}")]
    Stale {
        /// Version captured when the iterator was created
        expected: u64,
        /// Version observed at the failing advance
        current: u64,
    },

    /// No open connection, or the connection failed mid-request
    #[error("connectivity error: {message}")]
    Connectivity {
        /// Human-readable description
        message: String,
    },

    /// A frame failed magic, checksum or payload validation
    #[error("protocol error: {reason}")]
    Protocol {
        /// Description of the malformed frame
        reason: String,
    },

    /// Store was closed
    #[error("store is closed")]
    Closed,

    /// Store was opened without WRITER
    #[error("store is read-only")]
    ReadOnly,

    /// I/O operation failed
    #[error("I/O error{}: {message} ({kind:?})", describe_path(.path))]
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// Record log is corrupted beyond what replay can skip
    #[error("log corrupted in {} at offset {offset}: {reason}", .path.display())]
    Corrupted {
        /// Path to the corrupted file
        path: PathBuf,
        /// Byte offset where corruption was detected
        offset: u64,
        /// Description of the corruption
        reason: String,
    },

    /// Checksum verification failed
    #[error("checksum mismatch at offset {offset}: expected 0x{expected:08x}, got 0x{actual:08x}")]
    ChecksumMismatch {
        /// Expected checksum value
        expected: u32,
        /// Actual checksum computed
        actual: u32,
        /// Byte offset of the corrupted data
        offset: u64,
    },

    /// Entry size exceeds the configured maximum
    #[error("{component} too large: {entry_size} bytes exceeds limit of {max_size} bytes")]
    OversizedEntry {
        /// Size of the oversized component
        entry_size: u64,
        /// Maximum allowed size
        max_size: u64,
        /// Whether it's the key or value that's oversized
        component: &'static str,
    },

    /// File holds records of the other value shape
    #[error("value shape mismatch in {}: file holds {found}, store expects {expected}", .path.display())]
    ShapeMismatch {
        /// Path of the backing file
        path: PathBuf,
        /// Shape the caller asked for
        expected: &'static str,
        /// Shape recorded in the file header
        found: &'static str,
    },
}

impl ShelfError {
    /// Shorthand for an `InvalidArgument` error.
    pub fn invalid(reason: impl Into<String>) -> Self {
        ShelfError::InvalidArgument { reason: reason.into() }
    }

    /// Shorthand for a `Connectivity` error.
    pub fn connectivity(message: impl Into<String>) -> Self {
        ShelfError::Connectivity { message: message.into() }
    }

    /// Shorthand for a `Protocol` error.
    pub fn protocol(reason: impl Into<String>) -> Self {
        ShelfError::Protocol { reason: reason.into() }
    }

    /// Wrap an `io::Error` with the path it happened on.
    pub fn io_at(path: impl Into<PathBuf>, err: &std::io::Error, context: &str) -> Self {
        ShelfError::Io {
            path: Some(path.into()),
            kind: err.kind(),
            message: format!("{}: {}", context, err),
        }
    }

    /// The branch key for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ShelfError::InvalidArgument { .. } | ShelfError::OversizedEntry { .. } => {
                ErrorKind::InvalidArgument
            }
            ShelfError::NotFound { .. } => ErrorKind::NotFound,
            ShelfError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            ShelfError::Stale { .. } => ErrorKind::Staleness,
            ShelfError::Connectivity { .. } => ErrorKind::Connectivity,
            ShelfError::Protocol { .. } => ErrorKind::Protocol,
            ShelfError::Closed => ErrorKind::Closed,
            ShelfError::ReadOnly => ErrorKind::ReadOnly,
            ShelfError::Io { .. } => ErrorKind::Io,
            ShelfError::Corrupted { .. }
            | ShelfError::ChecksumMismatch { .. }
            | ShelfError::ShapeMismatch { .. } => ErrorKind::Corruption,
        }
    }
}

/// Convert std::io::Error to ShelfError::Io
impl From<std::io::Error> for ShelfError {
    fn from(err: std::io::Error) -> Self {
        ShelfError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

fn describe_path(path: &Option<PathBuf>) -> String {
    match path {
        Some(path) => format!(" in {}", path.display()),
        None => String::new(),
    }
}

/// Result type alias for shelfstore operations
pub type ShelfResult<T> = Result<T, ShelfError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ShelfError::ChecksumMismatch {
            expected: 0x12345678,
            actual: 0x87654321,
            offset: 1024,
        };

        let display = format!("{}", err);
        assert!(display.contains("checksum mismatch"));
        assert!(display.contains("0x12345678"));
        assert!(display.contains("0x87654321"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: ShelfError = io_err.into();

        match err {
            ShelfError::Io { kind, .. } => assert_eq!(kind, std::io::ErrorKind::NotFound),
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_kinds_are_distinct() {
        assert_eq!(ShelfError::invalid("x").kind(), ErrorKind::InvalidArgument);
        assert_eq!(ShelfError::NotFound { key: b"a".to_vec() }.kind(), ErrorKind::NotFound);
        assert_eq!(ShelfError::AlreadyExists { key: b"a".to_vec() }.kind(), ErrorKind::AlreadyExists);
        assert_eq!(ShelfError::Stale { expected: 1, current: 2 }.kind(), ErrorKind::Staleness);
        assert_eq!(ShelfError::connectivity("down").kind(), ErrorKind::Connectivity);
    }

    #[test]
    fn test_not_found_renders_key() {
        let err = ShelfError::NotFound { key: b"missing".to_vec() };
        assert_eq!(err.to_string(), "record not found: missing");
    }
}
