//! Configuration management for shelfstore
//!
//! Provides sync-policy presets, a validator, and the open-mode flag set
//! accepted by [`Store::open`](crate::Store::open).

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use crate::format::{MAX_KEY_SIZE, MAX_VALUE_SIZE};

/// When a mutation's log record is forced to persistent storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPolicy {
    /// durable_sync after every record; a returned `Ok` survives power loss
    Durable,
    /// Leave records in the OS page cache until `sync()` or close
    Buffered,
}

impl SyncPolicy {
    /// Name reported in store statistics.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPolicy::Durable => "durable",
            SyncPolicy::Buffered => "buffered",
        }
    }
}

/// shelfstore configuration with sync presets
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum key size in bytes
    pub max_key_size: usize,
    /// Maximum encoded value size in bytes
    pub max_value_size: usize,
    /// Log sync behavior for file-backed stores
    pub sync_policy: SyncPolicy,
    /// Slots reserved in the hash table at open
    pub initial_capacity: usize,
}

impl Config {
    /// Every mutation is fsynced before it becomes visible.
    pub fn durable() -> Self {
        Self {
            max_key_size: 16 * 1024,
            max_value_size: 32 * 1024 * 1024,
            sync_policy: SyncPolicy::Durable,
            initial_capacity: 1024,
        }
    }

    /// Mutations reach the OS cache only; callers batch with `sync()`.
    pub fn buffered() -> Self {
        Self {
            sync_policy: SyncPolicy::Buffered,
            ..Self::durable()
        }
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.max_key_size == 0 || self.max_key_size > MAX_KEY_SIZE {
            return Err(format!("max_key_size must be in [1, {}]", MAX_KEY_SIZE));
        }
        if self.max_value_size == 0 || self.max_value_size > MAX_VALUE_SIZE {
            return Err(format!("max_value_size must be in [1, {}]", MAX_VALUE_SIZE));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self { Self::durable() }
}

/// Open mode bit set: `READER`, `WRITER`, `CREATE`, `TRUNCATE`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct OpenFlags(u8);

impl OpenFlags {
    /// Open for reading
    pub const READER: OpenFlags = OpenFlags(0x01);
    /// Open for writing (implies reading)
    pub const WRITER: OpenFlags = OpenFlags(0x02);
    /// Create the file if it does not exist
    pub const CREATE: OpenFlags = OpenFlags(0x04);
    /// Discard existing records
    pub const TRUNCATE: OpenFlags = OpenFlags(0x08);

    /// No bits set.
    pub const fn empty() -> Self {
        OpenFlags(0)
    }

    /// Raw bit value.
    pub const fn bits(&self) -> u8 {
        self.0
    }

    /// True when every bit of `other` is set in `self`.
    pub const fn contains(&self, other: OpenFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether mutations are allowed.
    pub fn is_writer(&self) -> bool {
        self.contains(OpenFlags::WRITER)
    }

    /// Reject flag combinations that cannot be honored.
    pub fn validate(&self) -> Result<(), String> {
        if self.0 & !0x0f != 0 {
            return Err(format!("unknown open flag bits 0x{:02x}", self.0 & !0x0f));
        }
        if !self.contains(OpenFlags::READER) && !self.contains(OpenFlags::WRITER) {
            return Err("open flags need READER or WRITER".into());
        }
        if !self.is_writer()
            && (self.contains(OpenFlags::CREATE) || self.contains(OpenFlags::TRUNCATE))
        {
            return Err("CREATE and TRUNCATE require WRITER".into());
        }
        Ok(())
    }
}

impl BitOr for OpenFlags {
    type Output = OpenFlags;

    fn bitor(self, rhs: OpenFlags) -> OpenFlags {
        OpenFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for OpenFlags {
    fn bitor_assign(&mut self, rhs: OpenFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for OpenFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = [
            (OpenFlags::READER, "READER"),
            (OpenFlags::WRITER, "WRITER"),
            (OpenFlags::CREATE, "CREATE"),
            (OpenFlags::TRUNCATE, "TRUNCATE"),
        ]
        .iter()
        .filter(|(flag, _)| self.contains(*flag))
        .map(|(_, name)| *name)
        .collect();
        write!(f, "OpenFlags({})", names.join(" | "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_presets_valid() {
        assert!(Config::durable().validate().is_ok());
        assert!(Config::buffered().validate().is_ok());
    }

    #[test]
    fn test_key_limit_bounded_by_format() {
        let mut config = Config::default();
        config.max_key_size = MAX_KEY_SIZE + 1;
        assert!(config.validate().is_err());
        config.max_key_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_flag_combinations() {
        assert!(OpenFlags::READER.validate().is_ok());
        assert!((OpenFlags::WRITER | OpenFlags::CREATE).validate().is_ok());
        assert!(OpenFlags::empty().validate().is_err());
        assert!((OpenFlags::READER | OpenFlags::CREATE).validate().is_err());
        assert!(OpenFlags(0x80).validate().is_err());
    }

    #[test]
    fn test_flags_debug() {
        let flags = OpenFlags::WRITER | OpenFlags::CREATE;
        assert_eq!(format!("{:?}", flags), "OpenFlags(WRITER | CREATE)");
    }
}
