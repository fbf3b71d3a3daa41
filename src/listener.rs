// Relay listener - exposes a relay stream as a plain local TCP endpoint so
// unmodified TCP clients can use the tunnel.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use bytes::BufMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::buffer_pool::BufferPool;
use crate::error::RelayError;
use crate::models::{AdmissionPolicy, AllowAll, ConnectionStats, RelayTimeouts, TunnelStats};
use crate::protocol::{MAX_WRITE_SIZE, MIN_READ_SIZE};
use crate::runtime::get_runtime;
use crate::stream::RelayStream;
use crate::transport::RelayTarget;

type TunnelStream = RelayStream<Arc<dyn RelayTarget>>;

// How long a finished connection waits for its opposite pump to flush.
const PUMP_DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Accepts local TCP connections and tunnels each one over its own relay
/// stream. Connections are admitted by policy, pumped bidirectionally, and
/// failures stay isolated per connection.
pub struct RelayListener {
    target: Arc<dyn RelayTarget>,
    policy: Arc<dyn AdmissionPolicy>,
    timeouts: RelayTimeouts,
    max_accepts: Option<usize>,
    stats: Arc<TunnelStats>,
    buffer_pool: BufferPool,
}

impl RelayListener {
    pub fn new(target: impl RelayTarget + 'static) -> Self {
        RelayListener {
            target: Arc::new(target),
            policy: Arc::new(AllowAll),
            timeouts: RelayTimeouts::default(),
            max_accepts: None,
            stats: Arc::new(TunnelStats::default()),
            buffer_pool: BufferPool::default(),
        }
    }

    pub fn with_policy(mut self, policy: impl AdmissionPolicy + 'static) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    pub fn with_timeouts(mut self, timeouts: RelayTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Stops accepting after `max` connections. Used to bound a listener's
    /// lifetime in tests; rejected connections count too.
    pub fn with_max_accepts(mut self, max: usize) -> Self {
        self.max_accepts = Some(max);
        self
    }

    pub fn stats(&self) -> Arc<TunnelStats> {
        self.stats.clone()
    }

    /// Binds `host:port` and serves the accept loop on a background task.
    /// Port 0 picks a free port; the bound address is on the handle.
    pub async fn spawn(self, host: &str, port: u16) -> Result<ListenerHandle> {
        let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                log::error!("Listener: failed to bind {}: {}", addr, e);
                return Err(anyhow!("Failed to bind {}: {}", addr, e));
            }
        };
        let local_addr = listener.local_addr()?;
        let shutdown = Arc::new(Notify::new());
        let stats = self.stats.clone();
        let task = tokio::spawn(accept_loop(self, listener, local_addr, shutdown.clone()));
        Ok(ListenerHandle {
            local_addr,
            shutdown,
            task,
            stats,
        })
    }

    /// `spawn` for embedders without their own runtime; the accept loop runs
    /// on the shared global runtime.
    pub fn spawn_on_global(self, host: &str, port: u16) -> Result<ListenerHandle> {
        let runtime = get_runtime();
        runtime.block_on(self.spawn(host, port))
    }
}

/// Running listener: bound address, statistics, and shutdown control.
pub struct ListenerHandle {
    local_addr: SocketAddr,
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
    stats: Arc<TunnelStats>,
}

impl ListenerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> Arc<TunnelStats> {
        self.stats.clone()
    }

    /// Stops accepting and tears down the connections still being served.
    pub async fn stop(self) {
        self.shutdown.notify_one();
        let _ = self.task.await;
    }

    /// Waits until the accept loop ends on its own (`with_max_accepts`) and
    /// every served connection has drained.
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

async fn accept_loop(
    cfg: RelayListener,
    listener: TcpListener,
    addr: SocketAddr,
    shutdown: Arc<Notify>,
) {
    info!("Listener {}: serving relay tunnel", addr);
    let mut accepted = 0usize;
    let mut backoff = Duration::from_millis(10);
    let mut conn_tasks: Vec<JoinHandle<()>> = Vec::new();
    let mut stopping = false;

    loop {
        if let Some(max) = cfg.max_accepts {
            if accepted >= max {
                debug!("Listener {}: reached {} accept(s), stopping", addr, max);
                break;
            }
        }
        conn_tasks.retain(|task| !task.is_finished());

        let conn = tokio::select! {
            _ = shutdown.notified() => {
                debug!("Listener {}: shutdown requested", addr);
                stopping = true;
                break;
            }
            conn = listener.accept() => conn,
        };

        match conn {
            Ok((socket, peer)) => {
                backoff = Duration::from_millis(10);
                accepted += 1;
                if !cfg.policy.permit(peer) {
                    warn!("Listener {}: rejected connection from {}", addr, peer);
                    drop(socket);
                    continue;
                }
                let conn_no = cfg.stats.record_connection();
                debug!(
                    "Listener {}: accepted connection {} from {}",
                    addr, conn_no, peer
                );
                conn_tasks.push(tokio::spawn(serve_client(
                    socket,
                    peer,
                    conn_no,
                    cfg.target.clone(),
                    cfg.timeouts,
                    cfg.stats.clone(),
                    cfg.buffer_pool.clone(),
                )));
            }
            Err(e) => {
                // Transient accept failures (fd exhaustion and the like) must
                // not kill the loop.
                log::error!("Listener {}: accept failed: {}", addr, e);
                sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(1));
            }
        }
    }

    if stopping {
        for task in &conn_tasks {
            task.abort();
        }
    }
    for task in conn_tasks {
        let _ = task.await;
    }
    info!("Listener {}: stopped", addr);
}

/// Pumps one accepted socket against a dedicated relay stream until either
/// side closes or errors.
///
/// Both pumps run inside this task, so cancelling it on listener shutdown
/// drops the socket halves and tears the whole tunnel down.
async fn serve_client(
    socket: TcpStream,
    peer: SocketAddr,
    conn_no: u64,
    target: Arc<dyn RelayTarget>,
    timeouts: RelayTimeouts,
    stats: Arc<TunnelStats>,
    pool: BufferPool,
) {
    let stream = Arc::new(RelayStream::with_timeouts(target, timeouts));
    let (reader, writer) = socket.into_split();

    let up = uplink(reader, stream.clone(), pool.clone(), stats.clone(), conn_no);
    let down = downlink(writer, stream.clone(), pool.clone(), stats.clone(), conn_no);
    tokio::pin!(up, down);

    // Whichever pump finishes first decides teardown: closing the stream
    // unparks a downlink blocked on the relay, and the drain grace gives the
    // other pump a moment to flush before it is dropped.
    let (transmitted, received) = tokio::select! {
        transmitted = &mut up => {
            stream.close().await;
            (transmitted, drain_pump(down, conn_no, "downlink").await)
        }
        received = &mut down => {
            stream.close().await;
            (drain_pump(up, conn_no, "uplink").await, received)
        }
    };

    let summary = ConnectionStats {
        connection_no: conn_no,
        bytes_received: received,
        bytes_transmitted: transmitted,
    };
    info!(
        "Connection {} from {}: closed ({} bytes received, {} bytes transmitted)",
        summary.connection_no, peer, summary.bytes_received, summary.bytes_transmitted
    );
}

async fn drain_pump<F>(pump: F, conn_no: u64, side: &str) -> u64
where
    F: Future<Output = u64>,
{
    match timeout(PUMP_DRAIN_GRACE, pump).await {
        Ok(total) => total,
        Err(_) => {
            warn!(
                "Connection {}: {} pump did not stop within {:?}, dropping it",
                conn_no, side, PUMP_DRAIN_GRACE
            );
            0
        }
    }
}

/// Client socket to relay stream.
async fn uplink(
    mut reader: OwnedReadHalf,
    stream: Arc<TunnelStream>,
    pool: BufferPool,
    stats: Arc<TunnelStats>,
    conn_no: u64,
) -> u64 {
    let mut buf = pool.acquire();
    let mut total = 0u64;
    loop {
        buf.clear();
        // Cap each read so a chunk always fits one relay Data message.
        match reader.read_buf(&mut (&mut buf).limit(MAX_WRITE_SIZE)).await {
            Ok(0) => {
                debug!("Connection {}: client closed the uplink", conn_no);
                break;
            }
            Ok(n) => {
                if let Err(e) = stream.write(&buf[..n]).await {
                    warn!("Connection {}: relay write failed: {}", conn_no, e);
                    break;
                }
                total += n as u64;
                stats.add_transmitted(n as u64);
            }
            Err(e) => {
                warn!("Connection {}: client read failed: {}", conn_no, e);
                break;
            }
        }
    }
    pool.release(buf);
    total
}

/// Relay stream to client socket.
async fn downlink(
    mut writer: OwnedWriteHalf,
    stream: Arc<TunnelStream>,
    pool: BufferPool,
    stats: Arc<TunnelStats>,
    conn_no: u64,
) -> u64 {
    let mut buf = pool.acquire();
    buf.resize(MIN_READ_SIZE, 0);
    let mut total = 0u64;
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => {
                debug!("Connection {}: relay stream ended", conn_no);
                break;
            }
            Ok(n) => {
                if let Err(e) = writer.write_all(&buf[..n]).await {
                    warn!("Connection {}: client write failed: {}", conn_no, e);
                    break;
                }
                total += n as u64;
                stats.add_received(n as u64);
            }
            Err(RelayError::StreamClosedByCaller) => {
                debug!("Connection {}: relay stream closed locally", conn_no);
                break;
            }
            Err(e) => {
                warn!("Connection {}: relay read failed: {}", conn_no, e);
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
    pool.release(buf);
    total
}
