//! Shelfstore Core: hash-table record store
//!
//! A key-value store where keys are byte strings and values are either flat
//! byte strings or multi-field records. Every store is a RAM hash table;
//! file-backed stores add an append-only, CRC-checked record log that is
//! replayed on open.
//!
//! # Architecture
//!
//! - **Read path**: shared lock on the hash table
//! - **Write path**: log append first, then the table
//! - **Iteration**: cursors remember the store's mutation version and fail
//!   with `Stale` once a key is added or removed underneath them
//!
//! The remote client in `shelfstore-remote` implements the same [`KvStore`]
//! trait, so code written against it runs against either.

pub mod compaction;
pub mod config;
pub mod durability;
pub mod error;
pub mod format;
pub mod id_store;
pub mod iter;
pub mod kv;
pub mod log;
pub mod store;
mod table;
pub mod value;

// Re-export key types for convenience
pub use compaction::CompactionResult;
pub use config::{Config, OpenFlags, SyncPolicy};
pub use error::{ErrorKind, ShelfError, ShelfResult};
pub use format::Operation;
pub use id_store::{IdItems, IdIter, IdStore, IdValues};
pub use iter::{CursorSource, Items, Keys, StoreIter, ValueKeys, ValueVals, Values};
pub use kv::KvStore;
pub use store::{FieldStore, FlatStore, Store, StoreStats};
pub use value::{validate_key, FieldMap, RecordValue, ValueShape};
