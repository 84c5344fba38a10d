//! TCP server hosting one field-map store.
//!
//! The accept loop runs on tokio and spawns one task per connection.
//! Requests on a connection are served strictly in order; each one runs on
//! the blocking pool because the store takes a lock and may fsync. Shutdown
//! stops the accept loop, signals every connection task and waits for them.

use std::future::Future;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tokio::sync::{oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use shelfstore_core::{CursorSource, FieldMap, FieldStore, KvStore, RecordValue, ShelfError, ShelfResult};

use crate::config::ServerConfig;
use crate::protocol::{
    encode_error, put_blob, read_frame_async, write_frame_async, Frame, Opcode, PayloadReader, Status,
    FRAME_HEADER_SIZE, UNBOUNDED,
};
use crate::status::ServerStats;

/// Pause after a failed accept (for example when out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

struct Shared {
    store: Arc<FieldStore>,
    stats: ServerStats,
    config: ServerConfig,
    local_addr: SocketAddr,
}

impl Shared {
    fn new(store: Arc<FieldStore>, config: ServerConfig, local_addr: SocketAddr) -> Self {
        Self {
            store,
            stats: ServerStats::new(),
            config,
            local_addr,
        }
    }
}

pub struct Server;

impl Server {
    /// Bind `addr` and start serving `store` on a runtime owned by the
    /// returned handle. For callers without a tokio runtime of their own.
    ///
    /// The handle must not be dropped from inside an async context.
    pub fn bind<A: ToSocketAddrs>(addr: A, store: Arc<FieldStore>, config: ServerConfig) -> ShelfResult<ServerHandle> {
        config.validate().map_err(ShelfError::invalid)?;
        let listener = std::net::TcpListener::bind(addr)
            .map_err(|e| ShelfError::connectivity(format!("bind failed: {}", e)))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.worker_threads)
            .thread_name("shelfd-worker")
            .enable_all()
            .build()?;
        let listener = {
            let _guard = runtime.enter();
            TcpListener::from_std(listener)?
        };

        let shared = Arc::new(Shared::new(store, config, local_addr));
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let shutdown = async move {
            let _ = stop_rx.await;
        };
        info!(addr = %local_addr, "server listening");
        let task = runtime.spawn(accept_loop(listener, Arc::clone(&shared), shutdown));

        Ok(ServerHandle {
            local_addr,
            runtime: Some(runtime),
            task: Some(task),
            stop: Some(stop_tx),
            shared,
        })
    }

    /// Serve `store` on an already bound listener until `shutdown` resolves,
    /// then close every connection and return.
    pub async fn serve<F>(listener: TcpListener, store: Arc<FieldStore>, config: ServerConfig, shutdown: F) -> ShelfResult<()>
    where
        F: Future<Output = ()>,
    {
        config.validate().map_err(ShelfError::invalid)?;
        let local_addr = listener.local_addr()?;
        let shared = Arc::new(Shared::new(store, config, local_addr));
        info!(addr = %local_addr, "server listening");
        accept_loop(listener, shared, shutdown).await;
        Ok(())
    }
}

/// Handle to a server started by [`Server::bind`].
/// Dropping this handle stops the server.
pub struct ServerHandle {
    local_addr: SocketAddr,
    runtime: Option<Runtime>,
    task: Option<JoinHandle<()>>,
    stop: Option<oneshot::Sender<()>>,
    shared: Arc<Shared>,
}

impl ServerHandle {
    /// Address actually bound (useful after binding port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn store(&self) -> &Arc<FieldStore> {
        &self.shared.store
    }

    /// Current status report, as a client would see it.
    pub fn status(&self) -> Vec<(String, String)> {
        self.shared.stats.report(&self.shared.store, self.local_addr)
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().map_or(false, |task| !task.is_finished())
    }

    /// Stop accepting, close every connection and wait for all tasks.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let (Some(runtime), Some(task)) = (self.runtime.take(), self.task.take()) {
            if let Err(e) = runtime.block_on(task) {
                warn!(error = %e, "accept loop ended abnormally");
            }
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn accept_loop<F>(listener: TcpListener, shared: Arc<Shared>, shutdown: F)
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let (stop_tx, stop_rx) = watch::channel(false);
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    connections.spawn(serve_connection(stream, peer, Arc::clone(&shared), stop_rx.clone()));
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = &mut shutdown => break,
        }
    }

    let _ = stop_tx.send(true);
    let open = connections.len();
    if open > 0 {
        debug!(connections = open, "closing connections");
    }
    while connections.join_next().await.is_some() {}
    info!(addr = %shared.local_addr, "server stopped");
}

async fn serve_connection(mut stream: TcpStream, peer: SocketAddr, shared: Arc<Shared>, mut stop: watch::Receiver<bool>) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(peer = %peer, error = %e, "set_nodelay failed");
    }
    shared.stats.connection_opened();
    debug!(peer = %peer, "connection opened");

    loop {
        let read = tokio::select! {
            read = read_frame_async(&mut stream, shared.config.max_frame) => read,
            _ = stop.changed() => break,
        };
        let frame = match read {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                debug!(peer = %peer, error = %e, "dropping connection");
                break;
            }
        };

        let request_len = FRAME_HEADER_SIZE + frame.payload.len();
        let worker = Arc::clone(&shared);
        let (status, payload) = match tokio::task::spawn_blocking(move || dispatch(&worker, &frame)).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(peer = %peer, error = %e, "request task failed");
                break;
            }
        };
        if let Err(e) = write_frame_async(&mut stream, status as u8, &payload).await {
            debug!(peer = %peer, error = %e, "dropping connection");
            break;
        }
        shared.stats.traffic(request_len, FRAME_HEADER_SIZE + payload.len());
    }

    shared.stats.connection_closed();
    debug!(peer = %peer, "connection closed");
}

fn dispatch(shared: &Shared, frame: &Frame) -> (Status, BytesMut) {
    let Some(op) = Opcode::from_u8(frame.code) else {
        let err = ShelfError::invalid(format!("unknown opcode 0x{:02x}", frame.code));
        return (Status::InvalidArgument, encode_error(&err));
    };
    let result = execute(shared, op, &frame.payload);
    shared.stats.record(op, &result);
    match result {
        Ok(body) => (Status::Ok, body),
        Err(e) => {
            if Status::for_error(&e) == Status::Failure {
                warn!(op = op.name(), error = %e, "request failed");
            }
            (Status::for_error(&e), encode_error(&e))
        }
    }
}

fn execute(shared: &Shared, op: Opcode, payload: &[u8]) -> ShelfResult<BytesMut> {
    let store = &*shared.store;
    let mut req = PayloadReader::new(payload);
    let mut out = BytesMut::new();

    match op {
        Opcode::Put | Opcode::PutKeep | Opcode::PutCat => {
            let key = req.blob()?;
            let value = FieldMap::decode(req.blob()?)?;
            req.finish()?;
            match op {
                Opcode::Put => store.put(key, value)?,
                Opcode::PutKeep => store.putkeep(key, value)?,
                _ => store.putcat(key, value)?,
            }
        }
        Opcode::Remove => {
            let key = req.blob()?;
            req.finish()?;
            store.remove(key)?;
        }
        Opcode::Get => {
            let key = req.blob()?;
            req.finish()?;
            put_blob(&mut out, &store.get(key)?.encode());
        }
        Opcode::Contains => {
            let key = req.blob()?;
            req.finish()?;
            out.put_u8(store.contains(key)? as u8);
        }
        Opcode::Version => {
            req.finish()?;
            out.put_u64_le(store.cursor_version()?);
        }
        Opcode::KeyAt => {
            let version = req.u64()?;
            let position = position_arg(req.u64()?)?;
            req.finish()?;
            match store.key_at(version, position)? {
                Some(key) => {
                    out.put_u8(1);
                    put_blob(&mut out, &key);
                }
                None => out.put_u8(0),
            }
        }
        Opcode::EntryAt => {
            let version = req.u64()?;
            let position = position_arg(req.u64()?)?;
            req.finish()?;
            match store.entry_at(version, position)? {
                Some((key, value)) => {
                    out.put_u8(1);
                    put_blob(&mut out, &key);
                    put_blob(&mut out, &value.encode());
                }
                None => out.put_u8(0),
            }
        }
        Opcode::Search => {
            let prefix = req.blob()?;
            let limit = req.u64()?;
            req.finish()?;
            let limit = if limit == UNBOUNDED { None } else { Some(usize::try_from(limit).unwrap_or(usize::MAX)) };
            let keys = store.search_keys(prefix, limit)?;
            out.put_u32_le(keys.len() as u32);
            for key in &keys {
                put_blob(&mut out, key);
            }
        }
        Opcode::Sync => {
            req.finish()?;
            store.sync()?;
        }
        Opcode::Optimize => {
            req.finish()?;
            let result = store.optimize()?;
            out.put_u64_le(result.original_entries);
            out.put_u64_le(result.live_entries);
            out.put_u64_le(result.original_bytes);
            out.put_u64_le(result.compacted_bytes);
        }
        Opcode::Clear => {
            req.finish()?;
            store.clear()?;
        }
        Opcode::Copy => {
            let dest = req.string()?;
            req.finish()?;
            if dest.is_empty() {
                return Err(ShelfError::invalid("copy destination is empty"));
            }
            out.put_u64_le(store.copy_to(&dest)?);
        }
        Opcode::Len => {
            req.finish()?;
            out.put_u64_le(store.len()? as u64);
        }
        Opcode::Size => {
            req.finish()?;
            out.put_u64_le(store.byte_size()?);
        }
        Opcode::Status => {
            req.finish()?;
            let report = shared.stats.report(store, shared.local_addr);
            out.put_u32_le(report.len() as u32);
            for (name, value) in &report {
                put_blob(&mut out, name.as_bytes());
                put_blob(&mut out, value.as_bytes());
            }
        }
    }
    Ok(out)
}

fn position_arg(raw: u64) -> ShelfResult<usize> {
    usize::try_from(raw).map_err(|_| ShelfError::invalid(format!("position {} out of range", raw)))
}
