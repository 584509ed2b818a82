//! Daemon Server Implementation
//!
//! Serves the orchestrator over a Unix socket:
//! - Accepts connections and spawns one handler task per connection
//! - Each connection sends one JSON `QueryRequest` line and receives the
//!   merged answer as newline-delimited JSON `Fragment`s
//! - A client that disconnects cancels its bots; one that only closes its
//!   write side still receives the answer
//! - Supports graceful shutdown
//!
//! ```text
//!                     DaemonServer
//!                          │
//!          ┌───────────────┼───────────────┐
//!          │               │               │
//!       client          client          client
//!      (conn-1)        (conn-2)        (conn-3)
//!          │               │               │
//!          └───────────────┴───────────────┘
//!                          │
//!                    Orchestrator
//! ```

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::Serialize;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, warn, Instrument};

use polyglot_core::{Orchestrator, QueryRequest};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier of one client connection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Connection state tracking
struct ConnectionState {
    /// When the connection was established
    connected_at: std::time::Instant,
    /// Remote peer UID (from SO_PEERCRED)
    peer_uid: Option<u32>,
    /// Handle to abort the connection task
    abort_handle: tokio::task::AbortHandle,
}

/// Configuration for the daemon server
pub struct ServerConfig {
    /// Maximum number of concurrent connections
    pub max_connections: usize,
    /// Longest accepted request line in bytes
    pub max_request_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            max_request_bytes: 1024 * 1024,
        }
    }
}

/// Error line sent when a request cannot be served
#[derive(Debug, Serialize)]
struct ErrorLine<'a> {
    error: &'a str,
}

/// The main daemon server
pub struct DaemonServer {
    /// Path to the Unix socket
    socket_path: PathBuf,
    /// Shared orchestrator
    orchestrator: Arc<Orchestrator>,
    /// Server configuration
    server_config: ServerConfig,
    /// Active connection state (task handles, peer info)
    connection_states: Arc<DashMap<ConnectionId, ConnectionState>>,
}

impl DaemonServer {
    /// Create a new daemon server
    pub fn new(socket_path: PathBuf, orchestrator: Orchestrator) -> Self {
        Self {
            socket_path,
            orchestrator: Arc::new(orchestrator),
            server_config: ServerConfig::default(),
            connection_states: Arc::new(DashMap::new()),
        }
    }

    /// Get peer credentials from Unix socket
    #[cfg(target_os = "linux")]
    fn get_peer_uid(stream: &UnixStream) -> Option<u32> {
        use std::os::unix::io::AsRawFd;

        let fd = stream.as_raw_fd();
        // SAFETY: ucred is plain data and getsockopt writes at most `len` bytes into it
        let mut cred: libc::ucred = unsafe { std::mem::zeroed() };
        #[allow(clippy::cast_possible_truncation)]
        let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;

        let result = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_PEERCRED,
                std::ptr::addr_of_mut!(cred).cast::<libc::c_void>(),
                &mut len,
            )
        };

        (result == 0).then_some(cred.uid)
    }

    #[cfg(not(target_os = "linux"))]
    fn get_peer_uid(_stream: &UnixStream) -> Option<u32> {
        None
    }

    /// Prepare the socket path (create directory, remove stale socket)
    fn prepare_socket(&self) -> Result<()> {
        if let Some(parent) = self.socket_path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create socket directory: {parent:?}"))?;
                info!(path = ?parent, "Created socket directory");
            }
        }

        if self.socket_path.exists() {
            warn!(path = ?self.socket_path, "Removing stale socket file");
            fs::remove_file(&self.socket_path).with_context(|| {
                format!("Failed to remove stale socket: {:?}", self.socket_path)
            })?;
        }

        Ok(())
    }

    /// Run the daemon server until `shutdown` is set
    pub async fn run(&mut self, shutdown: Arc<AtomicBool>) -> Result<()> {
        self.prepare_socket()?;

        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("Failed to bind to {:?}", self.socket_path))?;

        info!(path = ?self.socket_path, "Listening for connections");

        // Owner-only access
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&self.socket_path, perms)?;
        }

        // SAFETY: getuid has no preconditions and cannot fail
        let our_uid = unsafe { libc::getuid() };

        loop {
            if shutdown.load(Ordering::SeqCst) {
                info!("Shutdown requested, stopping accept loop");
                break;
            }

            // Accept with timeout to allow checking shutdown flag
            let accept_result =
                tokio::time::timeout(tokio::time::Duration::from_millis(100), listener.accept())
                    .await;

            let stream = match accept_result {
                Ok(Ok((stream, _addr))) => stream,
                Ok(Err(e)) => {
                    error!(error = %e, "Accept failed");
                    continue;
                }
                Err(_) => continue,
            };

            if self.connection_states.len() >= self.server_config.max_connections {
                warn!("Connection limit reached, rejecting new connection");
                drop(stream);
                continue;
            }

            let peer_uid = Self::get_peer_uid(&stream);
            if let Some(uid) = peer_uid {
                if uid != our_uid && uid != 0 {
                    warn!(
                        peer_uid = uid,
                        our_uid = our_uid,
                        "Rejecting connection from different user"
                    );
                    drop(stream);
                    continue;
                }
            }

            let conn_id = ConnectionId::next();
            info!(
                conn_id = %conn_id,
                peer_uid = ?peer_uid,
                active_connections = self.connection_states.len() + 1,
                "New connection accepted"
            );

            let task_handle = tokio::spawn(
                handle_connection(
                    conn_id,
                    stream,
                    Arc::clone(&self.orchestrator),
                    self.server_config.max_request_bytes,
                    Arc::clone(&self.connection_states),
                )
                .instrument(tracing::info_span!("connection", %conn_id)),
            );

            self.connection_states.insert(
                conn_id,
                ConnectionState {
                    connected_at: std::time::Instant::now(),
                    peer_uid,
                    abort_handle: task_handle.abort_handle(),
                },
            );
            // A very short request can finish before it was tracked
            if task_handle.is_finished() {
                self.connection_states.remove(&conn_id);
            }
        }

        self.shutdown().await
    }

    /// Graceful shutdown
    async fn shutdown(&mut self) -> Result<()> {
        info!("Initiating graceful shutdown");

        let conn_ids: Vec<ConnectionId> = self.connection_states.iter().map(|r| *r.key()).collect();
        for conn_id in conn_ids {
            if let Some((_, conn_state)) = self.connection_states.remove(&conn_id) {
                info!(
                    conn_id = %conn_id,
                    peer_uid = ?conn_state.peer_uid,
                    uptime_secs = conn_state.connected_at.elapsed().as_secs(),
                    "Aborting connection"
                );
                conn_state.abort_handle.abort();
            }
        }

        // Give aborted handlers a moment to drop their streams
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;

        if self.socket_path.exists() {
            fs::remove_file(&self.socket_path)
                .with_context(|| format!("Failed to remove socket: {:?}", self.socket_path))?;
            info!(path = ?self.socket_path, "Socket file removed");
        }

        info!("Shutdown complete");
        Ok(())
    }
}

/// Serve one request on `stream`
///
/// Reads the request line, streams every merged fragment back as one JSON
/// line, and stops early if the client goes away. Dropping the merged
/// receiver on the way out cancels any bots still running.
async fn handle_connection(
    conn_id: ConnectionId,
    stream: UnixStream,
    orchestrator: Arc<Orchestrator>,
    max_request_bytes: usize,
    connection_states: Arc<DashMap<ConnectionId, ConnectionState>>,
) {
    debug!("Connection handler started");

    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    match read_request(&mut reader, max_request_bytes).await {
        Ok(Some(request)) => {
            let fragments = serve_request(&orchestrator, &request, &mut reader, &mut write_half).await;
            info!(fragments, "Request served");
        }
        Ok(None) => info!("Client disconnected before sending a request"),
        Err(reason) => {
            warn!(error = %reason, "Rejecting request");
            let _ = write_json_line(&mut write_half, &ErrorLine { error: &reason }).await;
        }
    }

    let _ = write_half.shutdown().await;
    connection_states.remove(&conn_id);

    info!(
        active_connections = connection_states.len(),
        "Connection handler finished"
    );
}

/// Read and parse the request line
///
/// Returns `Ok(None)` on EOF before any data.
async fn read_request<R>(reader: &mut R, max_bytes: usize) -> Result<Option<QueryRequest>, String>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let mut limited = AsyncReadExt::take(&mut *reader, max_bytes as u64);
    let read = limited
        .read_line(&mut line)
        .await
        .map_err(|e| format!("read failed: {e}"))?;

    if read == 0 {
        return Ok(None);
    }
    if !line.ends_with('\n') && read >= max_bytes {
        return Err(format!("request exceeds {max_bytes} bytes"));
    }

    serde_json::from_str(line.trim_end())
        .map(Some)
        .map_err(|e| format!("invalid request: {e}"))
}

/// Stream the merged answer to the client, returning the fragment count
///
/// EOF on the read side only means the client is done sending; clients that
/// half-close after the request line still get the full answer. A client
/// that is really gone shows up as a failed write.
async fn serve_request<R, W>(
    orchestrator: &Orchestrator,
    request: &QueryRequest,
    reader: &mut R,
    writer: &mut W,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut merged = orchestrator.get_response(request).await;
    let mut sent = 0u64;
    let mut probe = [0u8; 256];
    let mut read_open = true;

    loop {
        tokio::select! {
            fragment = merged.recv() => {
                let Some(fragment) = fragment else { break };
                if let Err(e) = write_json_line(writer, &fragment).await {
                    warn!(error = %e, "Write failed, cancelling request");
                    break;
                }
                sent += 1;
            }
            read = reader.read(&mut probe), if read_open => {
                // Anything after the request line is ignored
                match read {
                    Ok(0) => {
                        debug!("Client closed its write side");
                        read_open = false;
                    }
                    Err(e) => {
                        info!(error = %e, "Client disconnected, cancelling request");
                        break;
                    }
                    Ok(_) => {}
                }
            }
        }
    }

    sent
}

async fn write_json_line<W, T>(writer: &mut W, value: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await
}
