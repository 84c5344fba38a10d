//! Client and server settings.

use std::time::Duration;

use crate::protocol::DEFAULT_MAX_FRAME;

/// Settings for a [`RemoteClient`](crate::RemoteClient).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Per-address connect timeout
    pub connect_timeout: Duration,
    /// Read/write timeout on the socket; `None` blocks indefinitely
    pub io_timeout: Option<Duration>,
    /// Largest response payload accepted
    pub max_frame: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            io_timeout: Some(Duration::from_secs(30)),
            max_frame: DEFAULT_MAX_FRAME,
        }
    }
}

/// Settings for a [`Server`](crate::Server).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Largest request payload accepted
    pub max_frame: usize,
    /// Runtime worker threads for a server started with `Server::bind`
    pub worker_threads: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_frame: DEFAULT_MAX_FRAME,
            worker_threads: 2,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_frame == 0 {
            return Err("max_frame must be positive".into());
        }
        if self.worker_threads == 0 {
            return Err("worker_threads must be positive".into());
        }
        Ok(())
    }
}
