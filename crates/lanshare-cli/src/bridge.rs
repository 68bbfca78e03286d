// SPDX-License-Identifier: AGPL-3.0
// LanShare CLI - Engine Bridge
//
// Owns the network side (server handle, client, scanner, peer list) on a
// background task. The shell talks to it over a command channel and gets
// results back on an event channel, so no network call ever runs on the
// input path.

use async_channel::{Receiver, Sender};
use lanshare_core::scanner::UNKNOWN_HOSTNAME;
use lanshare_core::{
    AppError, AppSettings, ClientConfig, DownloadOutcome, ItemKind, ManifestEntry, PeerRecord,
    PeerScanner, ScanConfig, ScanReport, ServerEvent, ServerHandle, TransferClient,
    TransferSession,
};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Commands that can be sent to the engine
#[derive(Debug)]
pub enum EngineCommand {
    Scan,
    CancelScan,
    AddPeer {
        address: IpAddr,
    },
    GetPeers {
        reply: Sender<Vec<PeerRecord>>,
    },
    Probe {
        address: IpAddr,
    },
    FetchListing {
        address: IpAddr,
    },
    Download {
        address: IpAddr,
        name: String,
        dest_dir: PathBuf,
    },
    CancelDownloads,
    Upload {
        address: IpAddr,
        path: PathBuf,
    },
    GetSessions {
        reply: Sender<Vec<TransferSession>>,
    },
    Shutdown,
}

/// What a failed background operation was doing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Scan,
    Probe(IpAddr),
    Listing(IpAddr),
    Download(String),
    Upload(String),
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scan => write!(f, "Scan"),
            Self::Probe(address) => write!(f, "Probe of {}", address),
            Self::Listing(address) => write!(f, "Listing from {}", address),
            Self::Download(name) => write!(f, "Download of '{}'", name),
            Self::Upload(name) => write!(f, "Upload of '{}'", name),
        }
    }
}

/// Events delivered to the shell
#[derive(Debug)]
pub enum EngineEvent {
    Server(ServerEvent),
    Progress(TransferSession),
    ScanStarted,
    ScanFinished(ScanReport),
    PeerAdded(PeerRecord),
    ProbeResult {
        address: IpAddr,
        reachable: bool,
    },
    Listing {
        address: IpAddr,
        entries: Vec<ManifestEntry>,
    },
    DownloadFinished {
        address: IpAddr,
        outcome: DownloadOutcome,
    },
    UploadFinished {
        address: IpAddr,
        name: String,
        bytes: u64,
    },
    Failed {
        operation: Operation,
        error: AppError,
    },
}

struct Engine {
    client: Arc<TransferClient>,
    scanner: Arc<PeerScanner>,
    local_address: IpAddr,
    server: ServerHandle,
    peers: BTreeMap<IpAddr, PeerRecord>,
    /// Last manifest fetched from each peer
    listings: HashMap<IpAddr, Vec<ManifestEntry>>,
    scan: Option<CancellationToken>,
    /// Parent of every running download's token
    downloads: CancellationToken,
    /// Results of spawned operations, folded back into engine state
    done_tx: Sender<EngineEvent>,
}

impl Engine {
    async fn handle(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Scan => self.start_scan().await,
            EngineCommand::CancelScan => {
                if let Some(token) = &self.scan {
                    token.cancel();
                }
            }
            EngineCommand::AddPeer { address } => {
                let peer = PeerRecord {
                    address,
                    hostname: UNKNOWN_HOSTNAME.to_string(),
                    reachable_at: chrono::Utc::now(),
                };
                let _ = self.done_tx.send(EngineEvent::PeerAdded(peer)).await;
            }
            EngineCommand::GetPeers { reply } => {
                let _ = reply.send(self.peers.values().cloned().collect()).await;
            }
            EngineCommand::Probe { address } => {
                let client = Arc::clone(&self.client);
                let done_tx = self.done_tx.clone();
                tokio::spawn(async move {
                    let event = match client.check_peer(address).await {
                        Ok(reachable) => EngineEvent::ProbeResult { address, reachable },
                        Err(AppError::PeerUnreachable(_)) => EngineEvent::ProbeResult {
                            address,
                            reachable: false,
                        },
                        Err(error) => EngineEvent::Failed {
                            operation: Operation::Probe(address),
                            error,
                        },
                    };
                    let _ = done_tx.send(event).await;
                });
            }
            EngineCommand::FetchListing { address } => {
                let client = Arc::clone(&self.client);
                let done_tx = self.done_tx.clone();
                tokio::spawn(async move {
                    let event = match client.request_file_list(address).await {
                        Ok(entries) => EngineEvent::Listing { address, entries },
                        Err(error) => EngineEvent::Failed {
                            operation: Operation::Listing(address),
                            error,
                        },
                    };
                    let _ = done_tx.send(event).await;
                });
            }
            EngineCommand::Download {
                address,
                name,
                dest_dir,
            } => self.start_download(address, name, dest_dir),
            EngineCommand::CancelDownloads => {
                self.downloads.cancel();
                self.downloads = CancellationToken::new();
            }
            EngineCommand::Upload { address, path } => {
                let client = Arc::clone(&self.client);
                let done_tx = self.done_tx.clone();
                tokio::spawn(async move {
                    let name = path
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_else(|| path.display().to_string());
                    let event = match client.upload(address, &path).await {
                        Ok(bytes) => EngineEvent::UploadFinished {
                            address,
                            name,
                            bytes,
                        },
                        Err(error) => EngineEvent::Failed {
                            operation: Operation::Upload(name),
                            error,
                        },
                    };
                    let _ = done_tx.send(event).await;
                });
            }
            EngineCommand::GetSessions { reply } => {
                let sessions = self.server.state().active_sessions().await;
                let _ = reply.send(sessions).await;
            }
            // Handled by the run loop
            EngineCommand::Shutdown => {}
        }
    }

    async fn start_scan(&mut self) {
        if self.scan.is_some() {
            tracing::warn!("Scan already running");
            return;
        }

        let token = CancellationToken::new();
        self.scan = Some(token.clone());
        let _ = self.done_tx.send(EngineEvent::ScanStarted).await;

        let scanner = Arc::clone(&self.scanner);
        let local = self.local_address;
        let done_tx = self.done_tx.clone();
        tokio::spawn(async move {
            let event = match scanner.scan_subnet(local, &token).await {
                Ok(report) => EngineEvent::ScanFinished(report),
                Err(error) => EngineEvent::Failed {
                    operation: Operation::Scan,
                    error,
                },
            };
            let _ = done_tx.send(event).await;
        });
    }

    fn start_download(&self, address: IpAddr, name: String, dest_dir: PathBuf) {
        let known_kind = self
            .listings
            .get(&address)
            .and_then(|entries| entries.iter().find(|e| e.name == name))
            .map(|e| e.kind);

        let client = Arc::clone(&self.client);
        let cancel = self.downloads.child_token();
        let done_tx = self.done_tx.clone();
        tokio::spawn(async move {
            let result = async {
                let kind = match known_kind {
                    Some(kind) => kind,
                    None => client
                        .request_file_list(address)
                        .await?
                        .into_iter()
                        .find(|e| e.name == name)
                        .map(|e| e.kind)
                        .unwrap_or(ItemKind::File),
                };
                client.download(address, &name, kind, &dest_dir, &cancel).await
            }
            .await;

            let event = match result {
                Ok(outcome) => EngineEvent::DownloadFinished { address, outcome },
                Err(error) => EngineEvent::Failed {
                    operation: Operation::Download(name),
                    error,
                },
            };
            let _ = done_tx.send(event).await;
        });
    }

    /// Fold a finished operation into engine state
    fn record(&mut self, event: &EngineEvent) {
        match event {
            EngineEvent::ScanFinished(report) => {
                self.scan = None;
                for peer in &report.peers {
                    self.peers.insert(peer.address, peer.clone());
                }
            }
            EngineEvent::Failed {
                operation: Operation::Scan,
                ..
            } => self.scan = None,
            EngineEvent::PeerAdded(peer) => {
                self.peers.insert(peer.address, peer.clone());
            }
            EngineEvent::Listing { address, entries } => {
                self.listings.insert(*address, entries.clone());
            }
            _ => {}
        }
    }

    async fn shutdown(self) {
        if let Some(token) = &self.scan {
            token.cancel();
        }
        self.downloads.cancel();
        self.server.stop().await;
    }
}

/// Bridge between the shell and the async engine
pub struct EngineBridge {
    command_tx: Sender<EngineCommand>,
    event_rx: Receiver<EngineEvent>,
    task: JoinHandle<()>,
}

impl EngineBridge {
    /// Start the engine task; it takes ownership of the running server
    pub fn start(settings: &AppSettings, local_address: IpAddr, server: ServerHandle) -> Self {
        let (command_tx, command_rx) = async_channel::bounded::<EngineCommand>(32);
        let (event_tx, event_rx) = async_channel::unbounded::<EngineEvent>();
        let (done_tx, done_rx) = async_channel::unbounded::<EngineEvent>();

        let client = Arc::new(TransferClient::new(ClientConfig::from_settings(settings)));
        let scanner = Arc::new(PeerScanner::new(ScanConfig::from_settings(settings)));
        let server_events = server.state().subscribe();
        let client_progress = client.subscribe_progress();

        let engine = Engine {
            client,
            scanner,
            local_address,
            server,
            peers: BTreeMap::new(),
            listings: HashMap::new(),
            scan: None,
            downloads: CancellationToken::new(),
            done_tx,
        };

        let task = tokio::spawn(Self::run_engine(
            engine,
            command_rx,
            event_tx,
            done_rx,
            server_events,
            client_progress,
        ));

        Self {
            command_tx,
            event_rx,
            task,
        }
    }

    async fn run_engine(
        mut engine: Engine,
        command_rx: Receiver<EngineCommand>,
        event_tx: Sender<EngineEvent>,
        done_rx: Receiver<EngineEvent>,
        mut server_events: broadcast::Receiver<ServerEvent>,
        mut client_progress: broadcast::Receiver<TransferSession>,
    ) {
        loop {
            let event = tokio::select! {
                // Handle commands from the shell
                cmd = command_rx.recv() => match cmd {
                    Ok(EngineCommand::Shutdown) | Err(_) => break,
                    Ok(cmd) => {
                        engine.handle(cmd).await;
                        continue;
                    }
                },
                done = done_rx.recv() => match done {
                    Ok(event) => {
                        engine.record(&event);
                        event
                    }
                    Err(_) => break,
                },
                server_event = server_events.recv() => match server_event {
                    Ok(event) => EngineEvent::Server(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!("Skipped {} server events", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                progress = client_progress.recv() => match progress {
                    Ok(session) => EngineEvent::Progress(session),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };

            // Forward to the shell
            if event_tx.send(event).await.is_err() {
                break;
            }
        }

        engine.shutdown().await;
        tracing::info!("Engine stopped");
    }

    async fn send(&self, command: EngineCommand) {
        if self.command_tx.send(command).await.is_err() {
            tracing::warn!("Engine is no longer running");
        }
    }

    /// Start a subnet scan; results arrive as `ScanFinished`
    pub async fn scan(&self) {
        self.send(EngineCommand::Scan).await;
    }

    pub async fn cancel_scan(&self) {
        self.send(EngineCommand::CancelScan).await;
    }

    pub async fn add_peer(&self, address: IpAddr) {
        self.send(EngineCommand::AddPeer { address }).await;
    }

    /// Known peers, sorted by address
    pub async fn peers(&self) -> Vec<PeerRecord> {
        let (reply_tx, reply_rx) = async_channel::bounded(1);
        self.send(EngineCommand::GetPeers { reply: reply_tx }).await;
        reply_rx.recv().await.unwrap_or_default()
    }

    pub async fn probe(&self, address: IpAddr) {
        self.send(EngineCommand::Probe { address }).await;
    }

    pub async fn fetch_listing(&self, address: IpAddr) {
        self.send(EngineCommand::FetchListing { address }).await;
    }

    pub async fn download(&self, address: IpAddr, name: String, dest_dir: PathBuf) {
        self.send(EngineCommand::Download {
            address,
            name,
            dest_dir,
        })
        .await;
    }

    pub async fn cancel_downloads(&self) {
        self.send(EngineCommand::CancelDownloads).await;
    }

    pub async fn upload(&self, address: IpAddr, path: PathBuf) {
        self.send(EngineCommand::Upload { address, path }).await;
    }

    /// Transfers the local server is serving right now
    pub async fn sessions(&self) -> Vec<TransferSession> {
        let (reply_tx, reply_rx) = async_channel::bounded(1);
        self.send(EngineCommand::GetSessions { reply: reply_tx }).await;
        reply_rx.recv().await.unwrap_or_default()
    }

    /// Get event receiver for subscribing to engine events
    pub fn event_receiver(&self) -> Receiver<EngineEvent> {
        self.event_rx.clone()
    }

    /// Stop the engine and the server it owns
    pub async fn shutdown(self) {
        self.send(EngineCommand::Shutdown).await;
        let _ = self.task.await;
    }
}
