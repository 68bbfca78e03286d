// SPDX-License-Identifier: AGPL-3.0
// LanShare Core - Transfer client
//
// Opens one connection per request to a peer. Refused and timed-out connects
// both surface as PeerUnreachable; a zero length prefix on a download means
// the peer has no such item.

use crate::archive;
use crate::protocol::{self, Request, CONNECTION_OK};
use crate::store::{sanitize_file_name, PARTIAL_PREFIX};
use crate::types::{
    AppError, AppSettings, ItemKind, ManifestEntry, TransferDirection, TransferSession,
};
use std::fs;
use std::io::BufReader;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::{NamedTempFile, TempDir};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Progress updates are throttled to one per this many bytes
const PROGRESS_STEP: u64 = 32 * 1024;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub port: u16,
    /// Bounds connect plus the whole manifest exchange
    pub list_timeout: Duration,
    /// Bounds each read and write during a transfer
    pub io_timeout: Duration,
    pub max_manifest_bytes: usize,
}

impl ClientConfig {
    pub fn from_settings(settings: &AppSettings) -> Self {
        Self {
            port: settings.port,
            list_timeout: Duration::from_millis(settings.list_timeout_ms),
            io_timeout: Duration::from_secs(settings.io_timeout_secs),
            max_manifest_bytes: settings.max_manifest_bytes,
        }
    }
}

/// How a download ended when the transport itself worked
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// The item now exists at `path`
    Saved { path: PathBuf, bytes: u64 },
    /// The peer answered with a zero length
    NotFound { name: String },
    /// The local user abandoned the transfer
    Cancelled { name: String },
}

impl DownloadOutcome {
    /// Treat anything but a saved item as an error
    pub fn into_result(self) -> Result<PathBuf, AppError> {
        match self {
            Self::Saved { path, .. } => Ok(path),
            Self::NotFound { name } => Err(AppError::ItemNotFound(format!(
                "'{}' not found on the remote device",
                name
            ))),
            Self::Cancelled { name } => Err(AppError::Io(format!("Download of '{}' cancelled", name))),
        }
    }
}

/// A received item still under its hidden name in the destination directory
#[derive(Debug)]
enum Staged {
    File(NamedTempFile),
    Folder(TempDir),
}

impl Staged {
    /// Rename into `target`. A folder landing on an existing directory is
    /// merged into it, replacing files of the same name.
    fn install(self, target: &Path) -> Result<(), AppError> {
        match self {
            Self::File(file) => file.persist(target).map(|_| ()).map_err(|e| {
                AppError::Io(format!("Failed to save {}: {}", target.display(), e.error))
            }),
            Self::Folder(dir) => move_into(dir.path(), target),
        }
    }
}

fn move_into(from: &Path, target: &Path) -> Result<(), AppError> {
    let failed = |e: std::io::Error| AppError::Io(format!("Failed to save {}: {}", target.display(), e));

    if !target.is_dir() {
        return fs::rename(from, target).map_err(failed);
    }
    for entry in fs::read_dir(from).map_err(failed)? {
        let entry = entry.map_err(failed)?;
        let dest = target.join(entry.file_name());
        if entry.file_type().map_err(failed)?.is_dir() && dest.is_dir() {
            move_into(&entry.path(), &dest)?;
        } else {
            if dest.is_dir() {
                fs::remove_dir_all(&dest).map_err(failed)?;
            }
            fs::rename(entry.path(), &dest).map_err(failed)?;
        }
    }
    Ok(())
}

/// Client for fetching listings and items from peers
pub struct TransferClient {
    config: ClientConfig,
    /// Channel for progress updates
    progress_tx: broadcast::Sender<TransferSession>,
}

impl TransferClient {
    pub fn new(config: ClientConfig) -> Self {
        let (progress_tx, _) = broadcast::channel(100);
        Self {
            config,
            progress_tx,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Subscribe to progress updates
    pub fn subscribe_progress(&self) -> broadcast::Receiver<TransferSession> {
        self.progress_tx.subscribe()
    }

    async fn connect(&self, ip: IpAddr) -> Result<TcpStream, AppError> {
        let addr = SocketAddr::new(ip, self.config.port);
        match tokio::time::timeout(self.config.list_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(AppError::PeerUnreachable(format!(
                "Cannot connect to {} - {}",
                addr, e
            ))),
            Err(_) => Err(AppError::PeerUnreachable(format!(
                "Connection timed out to {}",
                addr
            ))),
        }
    }

    /// Check if a peer answers the liveness probe
    pub async fn check_peer(&self, ip: IpAddr) -> Result<bool, AppError> {
        let exchange = async {
            let mut stream = self.connect(ip).await?;
            protocol::write_request(&mut stream, &Request::TestConnection).await?;
            let mut reply = Vec::new();
            (&mut stream)
                .take(CONNECTION_OK.len() as u64)
                .read_to_end(&mut reply)
                .await?;
            Ok::<_, AppError>(reply == CONNECTION_OK)
        };

        match tokio::time::timeout(self.config.list_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(AppError::PeerUnreachable(format!("{} did not answer the probe", ip))),
        }
    }

    /// Fetch the peer's public manifest
    pub async fn request_file_list(&self, ip: IpAddr) -> Result<Vec<ManifestEntry>, AppError> {
        let exchange = async {
            let mut stream = self.connect(ip).await?;
            protocol::write_request(&mut stream, &Request::FileList).await?;
            protocol::read_manifest(&mut stream, self.config.max_manifest_bytes).await
        };

        let manifest = match tokio::time::timeout(self.config.list_timeout, exchange).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(AppError::PeerUnreachable(format!(
                    "No file list from {} within {:?}",
                    ip, self.config.list_timeout
                )));
            }
        };

        tracing::info!("Received {} manifest entries from {}", manifest.len(), ip);
        Ok(manifest)
    }

    /// Download `name` into `dest_dir`.
    ///
    /// Files are saved as `dest_dir/<last path segment>`; folders are
    /// unpacked into `dest_dir/<name>`. Everything is received and unpacked
    /// under a hidden staging name first; cancelling at any point before the
    /// final rename closes the connection and leaves `dest_dir` untouched.
    pub async fn download(
        &self,
        ip: IpAddr,
        name: &str,
        kind: ItemKind,
        dest_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<DownloadOutcome, AppError> {
        let cancelled = || -> Result<DownloadOutcome, AppError> {
            tracing::info!("Download of '{}' from {} cancelled", name, ip);
            Ok(DownloadOutcome::Cancelled { name: name.to_string() })
        };

        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => return cancelled(),
            result = self.fetch(ip, name, kind, dest_dir) => result?,
        };
        let Some((staged, bytes)) = fetched else {
            tracing::info!("'{}' not found on {}", name, ip);
            return Ok(DownloadOutcome::NotFound {
                name: name.to_string(),
            });
        };
        if cancel.is_cancelled() {
            return cancelled();
        }

        let target = dest_dir.join(sanitize_file_name(name, "download"));
        let install_target = target.clone();
        tokio::task::spawn_blocking(move || staged.install(&install_target))
            .await
            .map_err(|e| AppError::Io(format!("Finishing download failed: {}", e)))??;

        tracing::info!("Downloaded '{}' from {} to {} ({} bytes)", name, ip, target.display(), bytes);
        Ok(DownloadOutcome::Saved {
            path: target,
            bytes,
        })
    }

    /// Receive an item into staging inside `dest_dir`; `None` when the peer has no such item
    async fn fetch(
        &self,
        ip: IpAddr,
        name: &str,
        kind: ItemKind,
        dest_dir: &Path,
    ) -> Result<Option<(Staged, u64)>, AppError> {
        let mut stream = self.connect(ip).await?;
        protocol::write_request(&mut stream, &Request::Download(name.to_string())).await?;

        let len = protocol::read_length(&mut stream, self.config.io_timeout).await?;
        if len == 0 {
            return Ok(None);
        }

        tokio::fs::create_dir_all(dest_dir)
            .await
            .map_err(|e| AppError::Io(format!("Failed to create {}: {}", dest_dir.display(), e)))?;
        let received = tempfile::Builder::new()
            .prefix(PARTIAL_PREFIX)
            .tempfile_in(dest_dir)
            .map_err(|e| AppError::Io(format!("Failed to create temp file: {}", e)))?;
        let mut file = File::from_std(received.reopen()?);

        let session = TransferSession::new(ip.to_string(), name, TransferDirection::Download, len);
        let bytes = protocol::copy_exact(
            &mut stream,
            &mut file,
            len,
            self.config.io_timeout,
            self.progress_reporter(&session),
        )
        .await?;
        drop(file);
        drop(stream);

        let staged = match kind {
            ItemKind::File => Staged::File(received),
            ItemKind::Folder => {
                let unpack_dir = tempfile::Builder::new()
                    .prefix(PARTIAL_PREFIX)
                    .tempdir_in(dest_dir)
                    .map_err(|e| AppError::Io(format!("Failed to create temp dir: {}", e)))?;
                // Owns both temp paths; if this future is dropped they are
                // removed when the blocking task finishes
                let unpacked = tokio::task::spawn_blocking(move || {
                    let archive_file = received.reopen()?;
                    archive::unpack_folder(BufReader::new(archive_file), unpack_dir.path())?;
                    Ok::<_, AppError>(unpack_dir)
                })
                .await
                .map_err(|e| AppError::Io(format!("Unpacking download failed: {}", e)))??;
                Staged::Folder(unpacked)
            }
        };

        Ok(Some((staged, bytes)))
    }

    /// Push a local file into the peer's shared root
    pub async fn upload(&self, ip: IpAddr, path: &Path) -> Result<u64, AppError> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| AppError::Io(format!("Invalid file path: {}", path.display())))?
            .to_string();

        let mut file = File::open(path)
            .await
            .map_err(|e| AppError::Io(format!("Failed to open file: {}", e)))?;
        let len = file
            .metadata()
            .await
            .map_err(|e| AppError::Io(format!("Failed to get file metadata: {}", e)))?
            .len();

        let mut stream = self.connect(ip).await?;
        protocol::write_request(&mut stream, &Request::Upload(name.clone())).await?;
        protocol::write_length(&mut stream, len).await?;

        let session = TransferSession::new(ip.to_string(), &name, TransferDirection::Upload, len);
        let bytes = protocol::copy_exact(
            &mut file,
            &mut stream,
            len,
            self.config.io_timeout,
            self.progress_reporter(&session),
        )
        .await?;
        let _ = stream.shutdown().await;

        tracing::info!("Sent file: {} ({} bytes)", name, bytes);
        Ok(bytes)
    }

    fn progress_reporter(&self, session: &TransferSession) -> impl FnMut(u64) {
        let progress_tx = self.progress_tx.clone();
        let mut session = session.clone();
        let mut last_update = 0u64;
        move |bytes| {
            if bytes - last_update >= PROGRESS_STEP || bytes == session.bytes_total {
                last_update = bytes;
                session.bytes_transferred = bytes;
                let _ = progress_tx.send(session.clone());
            }
        }
    }
}
