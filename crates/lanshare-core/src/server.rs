// SPDX-License-Identifier: AGPL-3.0
// LanShare Core - Connection server
//
// Accepts peer connections on the service port. Each connection carries one
// request and is served on its own task; a failure on one connection is
// logged and never reaches the accept loop.

use crate::netinfo::detect_lan_address;
use crate::protocol::{self, Request, CONNECTION_OK};
use crate::store::SharedStore;
use crate::types::{AppError, AppSettings, SharedItem, TransferDirection, TransferSession};
use serde::Serialize;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Progress events are throttled to one per this many bytes
const PROGRESS_STEP: u64 = 32 * 1024;

/// Server state shared across connection tasks
pub struct ServerState {
    pub store: Arc<SharedStore>,
    /// Channel to notify frontends of events
    pub event_tx: broadcast::Sender<ServerEvent>,
    /// Transfers currently in flight
    sessions: RwLock<HashMap<Uuid, TransferSession>>,
    io_timeout: Duration,
}

/// Events emitted by the server
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerEvent {
    /// A peer fetched the manifest
    ListingServed { peer: String, bytes: usize },
    /// Transfer progress update
    Progress { session: TransferSession },
    /// A transfer finished successfully
    TransferComplete { session: TransferSession },
    /// A transfer was abandoned
    TransferFailed {
        session: TransferSession,
        error: String,
    },
    /// A peer pushed a file into the shared root
    UploadReceived { peer: String, item: SharedItem },
}

impl ServerState {
    pub fn new(store: Arc<SharedStore>, io_timeout: Duration) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            store,
            event_tx,
            sessions: RwLock::new(HashMap::new()),
            io_timeout,
        }
    }

    pub fn from_settings(store: Arc<SharedStore>, settings: &AppSettings) -> Self {
        Self::new(store, Duration::from_secs(settings.io_timeout_secs))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.event_tx.subscribe()
    }

    /// Snapshot of transfers in flight
    pub async fn active_sessions(&self) -> Vec<TransferSession> {
        self.sessions.read().await.values().cloned().collect()
    }

    fn emit(&self, event: ServerEvent) {
        let _ = self.event_tx.send(event);
    }

    async fn begin(&self, session: &TransferSession) {
        self.sessions.write().await.insert(session.id, session.clone());
    }

    async fn finish(&self, mut session: TransferSession, result: &Result<u64, AppError>) {
        self.sessions.write().await.remove(&session.id);
        match result {
            Ok(bytes) => {
                session.bytes_transferred = *bytes;
                tracing::info!(
                    "{:?} of '{}' with {} complete ({} bytes)",
                    session.direction,
                    session.requested_item,
                    session.peer_address,
                    bytes
                );
                self.emit(ServerEvent::TransferComplete { session });
            }
            Err(e) => {
                self.emit(ServerEvent::TransferFailed {
                    session,
                    error: e.to_string(),
                });
            }
        }
    }

    fn progress_reporter(&self, session: &TransferSession) -> impl FnMut(u64) + '_ {
        let mut session = session.clone();
        let mut last_update = 0u64;
        move |bytes| {
            if bytes - last_update >= PROGRESS_STEP || bytes == session.bytes_total {
                last_update = bytes;
                session.bytes_transferred = bytes;
                self.emit(ServerEvent::Progress {
                    session: session.clone(),
                });
            }
        }
    }
}

/// Run a store operation off the async workers
async fn with_store<T, F>(store: &Arc<SharedStore>, op: F) -> Result<T, AppError>
where
    T: Send + 'static,
    F: FnOnce(&SharedStore) -> Result<T, AppError> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || op(&store))
        .await
        .map_err(|e| AppError::Io(format!("Store task failed: {}", e)))?
}

/// Listening socket plus the state its connections are served from
pub struct ConnectionServer {
    listener: TcpListener,
    state: Arc<ServerState>,
}

impl ConnectionServer {
    /// Bind to an explicit address
    pub async fn bind(state: Arc<ServerState>, addr: SocketAddr) -> Result<Self, AppError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| AppError::Io(format!("Failed to bind to {}: {}", addr, e)))?;

        tracing::info!("File server listening on {}", listener.local_addr()?);
        Ok(Self { listener, state })
    }

    /// Bind to the detected LAN address, or to every interface if that fails
    pub async fn bind_lan(state: Arc<ServerState>, port: u16) -> Result<Self, AppError> {
        let lan = SocketAddr::new(detect_lan_address(), port);
        match Self::bind(Arc::clone(&state), lan).await {
            Ok(server) => Ok(server),
            Err(e) => {
                tracing::warn!("{}; falling back to all interfaces", e);
                Self::bind(state, SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)).await
            }
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, AppError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    /// Accept connections until `shutdown` fires
    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("File server stopped");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!("Accepted connection from {}", peer);
                        let state = Arc::clone(&self.state);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(state, stream, peer).await {
                                tracing::warn!("Error handling connection from {}: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!("Accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }

    /// Run the accept loop on a background task
    pub fn spawn(self) -> Result<ServerHandle, AppError> {
        let addr = self.local_addr()?;
        let state = Arc::clone(&self.state);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(self.run(shutdown.clone()));

        Ok(ServerHandle {
            addr,
            state,
            shutdown,
            task,
        })
    }
}

/// A running server
pub struct ServerHandle {
    addr: SocketAddr,
    state: Arc<ServerState>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    /// Stop accepting; connections already being served run to completion
    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = self.task.await;
    }
}

async fn handle_connection(
    state: Arc<ServerState>,
    mut stream: TcpStream,
    peer: SocketAddr,
) -> Result<(), AppError> {
    let (request, rest) = protocol::read_request(&mut stream, state.io_timeout).await?;
    tracing::debug!("{} from {}", request.verb(), peer);
    let peer_ip = peer.ip().to_string();

    match request {
        Request::FileList => {
            let manifest = with_store(&state.store, |store| store.serialize_public_manifest()).await?;
            protocol::with_timeout(state.io_timeout, "Sending manifest", stream.write_all(&manifest)).await?;
            state.emit(ServerEvent::ListingServed {
                peer: peer_ip,
                bytes: manifest.len(),
            });
        }
        Request::TestConnection => {
            protocol::with_timeout(state.io_timeout, "Answering probe", stream.write_all(CONNECTION_OK)).await?;
        }
        Request::Download(name) => serve_download(&state, &mut stream, &peer_ip, name).await?,
        Request::Upload(name) => {
            let mut reader = (&rest[..]).chain(&mut stream);
            receive_upload(&state, &mut reader, &peer_ip, name).await?;
        }
    }

    let _ = stream.shutdown().await;
    Ok(())
}

async fn serve_download(
    state: &Arc<ServerState>,
    stream: &mut TcpStream,
    peer_ip: &str,
    name: String,
) -> Result<(), AppError> {
    let lookup = {
        let name = name.clone();
        let peer_ip = peer_ip.to_string();
        with_store(&state.store, move |store| store.open_download(&name, &peer_ip)).await
    };

    let download = match lookup {
        Ok(Some(download)) => download,
        Ok(None) => {
            tracing::info!("{} requested missing item '{}'", peer_ip, name);
            return protocol::write_length(stream, 0).await;
        }
        Err(AppError::AccessDenied(reason)) => {
            tracing::warn!("Refused '{}' to {}: {}", name, peer_ip, reason);
            return protocol::write_length(stream, 0).await;
        }
        Err(e) => {
            // Still answer so the peer does not hang on the prefix
            let _ = protocol::write_length(stream, 0).await;
            return Err(e);
        }
    };

    let session = TransferSession::new(peer_ip, &name, TransferDirection::Upload, download.len);
    state.begin(&session).await;

    let mut file = tokio::fs::File::from_std(download.file);
    let result = async {
        protocol::with_timeout(
            state.io_timeout,
            "Sending length prefix",
            stream.write_all(&download.len.to_be_bytes()),
        )
        .await?;
        protocol::copy_exact(
            &mut file,
            &mut *stream,
            download.len,
            state.io_timeout,
            state.progress_reporter(&session),
        )
        .await
    }
    .await;

    state.finish(session, &result).await;
    result.map(|_| ())
}

async fn receive_upload<R>(
    state: &Arc<ServerState>,
    reader: &mut R,
    peer_ip: &str,
    name: String,
) -> Result<(), AppError>
where
    R: AsyncRead + Unpin,
{
    let len = protocol::read_length(reader, state.io_timeout).await?;
    if len == 0 {
        tracing::info!("{} had nothing to send for '{}'", peer_ip, name);
        return Ok(());
    }

    let staged = with_store(&state.store, |store| store.stage_upload()).await?;
    let mut file = tokio::fs::File::from_std(staged.reopen()?);

    let session = TransferSession::new(peer_ip, &name, TransferDirection::Download, len);
    state.begin(&session).await;
    let result = protocol::copy_exact(
        reader,
        &mut file,
        len,
        state.io_timeout,
        state.progress_reporter(&session),
    )
    .await;
    drop(file);
    state.finish(session, &result).await;
    result?;

    let item = {
        let name = name.clone();
        let peer_ip = peer_ip.to_string();
        with_store(&state.store, move |store| store.commit_upload(staged, &name, &peer_ip)).await?
    };
    tracing::info!("File '{}' received from {}", item.name, peer_ip);
    state.emit(ServerEvent::UploadReceived {
        peer: peer_ip.to_string(),
        item,
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn running_server() -> (TempDir, ServerHandle) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SharedStore::open(dir.path().join("share"), "127.0.0.1", true).unwrap());
        let state = Arc::new(ServerState::new(store, Duration::from_secs(5)));
        let server = ConnectionServer::bind(state, "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        (dir, server.spawn().unwrap())
    }

    #[tokio::test]
    async fn test_probe_is_acknowledged() {
        let (_dir, handle) = running_server().await;
        let mut stream = TcpStream::connect(handle.local_addr()).await.unwrap();
        stream.write_all(b"TEST_CONNECTION").await.unwrap();

        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, CONNECTION_OK);
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_malformed_request_does_not_stop_server() {
        let (_dir, handle) = running_server().await;

        let mut bad = TcpStream::connect(handle.local_addr()).await.unwrap();
        bad.write_all(b"GARBAGE\n").await.unwrap();
        let mut reply = Vec::new();
        bad.read_to_end(&mut reply).await.unwrap();
        assert!(reply.is_empty());

        let mut good = TcpStream::connect(handle.local_addr()).await.unwrap();
        good.write_all(b"REQUEST_FILE_LIST\n").await.unwrap();
        let mut reply = Vec::new();
        good.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"[]");
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_missing_download_gets_zero_length() {
        let (_dir, handle) = running_server().await;
        let mut stream = TcpStream::connect(handle.local_addr()).await.unwrap();
        stream.write_all(b"DOWNLOAD:ghost.txt\n").await.unwrap();

        let mut reply = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, 0u64.to_be_bytes());
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_upload_lands_in_shared_root() {
        let (dir, handle) = running_server().await;
        let mut events = handle.state().subscribe();

        let mut stream = TcpStream::connect(handle.local_addr()).await.unwrap();
        let mut payload = b"UPLOAD:hello.txt\n".to_vec();
        payload.extend_from_slice(&5u64.to_be_bytes());
        payload.extend_from_slice(b"hello");
        stream.write_all(&payload).await.unwrap();
        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();

        loop {
            match events.recv().await.unwrap() {
                ServerEvent::UploadReceived { item, .. } => {
                    assert_eq!(item.name, "hello.txt");
                    break;
                }
                _ => continue,
            }
        }
        let stored = std::fs::read(dir.path().join("share/hello.txt")).unwrap();
        assert_eq!(stored, b"hello");
        assert!(handle.state().active_sessions().await.is_empty());
        handle.stop().await;
    }
}
