//! Shelfstore Remote: the store over the network
//!
//! [`RemoteClient`] implements the same [`KvStore`](shelfstore_core::KvStore)
//! contract as a local store, for multi-field records kept by a server.
//! [`Server`] hosts a local field-map store for such clients; the `shelfd`
//! binary wraps it.
//!
//! Iterators over a remote store check the server's mutation version on
//! every advance, so they go stale exactly like local ones.

pub mod client;
pub mod config;
pub mod protocol;
pub mod server;
pub mod status;

pub use client::RemoteClient;
pub use config::{ClientConfig, ServerConfig};
pub use protocol::{Opcode, Status, DEFAULT_MAX_FRAME};
pub use server::{Server, ServerHandle};
pub use status::{ServerStats, STATUS_FIELDS};
