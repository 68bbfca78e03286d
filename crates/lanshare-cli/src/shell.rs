// SPDX-License-Identifier: AGPL-3.0
// LanShare CLI - Interactive shell
//
// Reads commands from stdin and prints engine events as they arrive. Local
// store operations run on the blocking pool; network operations go through
// the engine bridge.

use crate::bridge::{EngineBridge, EngineEvent};
use crate::commands::{is_yes, Command, HELP};
use lanshare_core::{
    network_interfaces, AppError, Consent, DeleteOutcome, DownloadOutcome, ItemKind, ServerEvent,
    SettingsStore, SharedItem, SharedStore, TransferDirection, TransferSession,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use uuid::Uuid;

/// Default download destination, relative to the working directory
const DOWNLOAD_DIR: &str = "Downloads";

pub struct Shell {
    store: Arc<SharedStore>,
    settings: Arc<SettingsStore>,
    bridge: EngineBridge,
    /// Item waiting for a yes/no answer before deletion
    pending_delete: Option<String>,
    /// Last progress tenth printed per transfer
    progress: HashMap<Uuid, u64>,
}

impl Shell {
    pub fn new(store: Arc<SharedStore>, settings: Arc<SettingsStore>, bridge: EngineBridge) -> Self {
        Self {
            store,
            settings,
            bridge,
            pending_delete: None,
            progress: HashMap::new(),
        }
    }

    /// Run until `quit` or end of input, then stop the engine
    pub async fn run(mut self) -> Result<(), AppError> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let events = self.bridge.event_receiver();
        println!("{}", HELP);

        loop {
            tokio::select! {
                line = lines.next_line() => match line? {
                    Some(line) => {
                        if !self.handle_line(&line).await {
                            break;
                        }
                    }
                    None => break,
                },
                event = events.recv() => match event {
                    Ok(event) => self.show_event(event).await,
                    Err(_) => break,
                },
            }
        }

        self.bridge.shutdown().await;
        Ok(())
    }

    /// Returns false when the shell should exit
    async fn handle_line(&mut self, line: &str) -> bool {
        if let Some(name) = self.pending_delete.take() {
            if is_yes(line) {
                self.delete(name, Consent::Granted).await;
            } else {
                println!("Kept '{}'", name);
            }
            return true;
        }

        match Command::parse(line) {
            Ok(Some(Command::Quit)) => false,
            Ok(Some(command)) => {
                self.execute(command).await;
                true
            }
            Ok(None) => true,
            Err(message) => {
                println!("{}", message);
                true
            }
        }
    }

    async fn execute(&mut self, command: Command) {
        match command {
            Command::Put(path) => {
                let result = self.with_store(move |store| store.put_file(&path)).await;
                self.report(result.map(|item| format!("Shared file '{}'", item.name)));
            }
            Command::Mkdir(name) => {
                let result = self.with_store(move |store| store.create_folder(&name)).await;
                self.report(result.map(|item| {
                    format!("Created {} folder '{}'", item.visibility.label(), item.name)
                }));
            }
            Command::Add { folder, files } => {
                let result = self
                    .with_store(move |store| store.add_files_to_folder(&folder, &files))
                    .await;
                self.report(result.map(|items| format!("Added {} file(s)", items.len())));
            }
            Command::Toggle(name) => {
                let result = self.with_store(move |store| {
                    let visibility = store.toggle_visibility(&name)?;
                    Ok((name, visibility))
                })
                .await;
                self.report(result.map(|(name, visibility)| match visibility {
                    Some(visibility) => format!("'{}' is now {}", name, visibility.label()),
                    None => format!("'{}' is a file; only folders have visibility", name),
                }));
            }
            Command::Delete(name) => self.delete(name, Consent::Withheld).await,
            Command::Tree => self.print_tree().await,
            Command::Mode(None) => {
                let label = if self.store.public_mode() { "Public" } else { "Private" };
                println!("Device is in {} mode", label);
            }
            Command::Mode(Some(public_mode)) => self.set_mode(public_mode).await,
            Command::Grant(address) => {
                if self.store.add_to_access_list(&address) {
                    println!("{} can now open Private folders", address.trim());
                } else {
                    println!("{} already has access", address.trim());
                }
            }
            Command::Revoke(address) => {
                if self.store.remove_from_access_list(&address) {
                    println!("Revoked access for {}", address.trim());
                } else {
                    println!("{} was not on the access list", address.trim());
                }
            }
            Command::Access => {
                let granted = self.store.access_list();
                if granted.is_empty() {
                    println!("No addresses have Private access");
                }
                for address in granted {
                    println!("  {}", address);
                }
            }
            Command::History => {
                let history = self.store.history();
                if history.is_empty() {
                    println!("Nothing shared yet");
                }
                for entry in history {
                    let time = entry.timestamp.with_timezone(&chrono::Local);
                    println!("  {}  {}", time.format("%H:%M:%S"), entry.description);
                }
            }
            Command::Ip => {
                println!("This device: {}", self.store.local_address());
                for interface in network_interfaces().iter().filter(|i| !i.is_loopback) {
                    println!("  {:<12} {}", interface.name, interface.ip);
                }
            }
            Command::Scan => self.bridge.scan().await,
            Command::StopScan => self.bridge.cancel_scan().await,
            Command::Peers => {
                let peers = self.bridge.peers().await;
                if peers.is_empty() {
                    println!("No known devices; try 'scan' or 'add-peer'");
                }
                for peer in peers {
                    println!("  {:<16} {}", peer.address, peer.hostname);
                }
            }
            Command::AddPeer(address) => self.bridge.add_peer(address).await,
            Command::Probe(address) => self.bridge.probe(address).await,
            Command::Ls(address) => self.bridge.fetch_listing(address).await,
            Command::Get { address, name, dest } => {
                let dest = dest.unwrap_or_else(|| PathBuf::from(DOWNLOAD_DIR));
                println!("Downloading '{}' from {}", name, address);
                self.bridge.download(address, name, dest).await;
            }
            Command::Cancel => self.bridge.cancel_downloads().await,
            Command::Send { address, path } => {
                println!("Sending {} to {}", path.display(), address);
                self.bridge.upload(address, path).await;
            }
            Command::Transfers => {
                let sessions = self.bridge.sessions().await;
                if sessions.is_empty() {
                    println!("No transfers in progress");
                }
                for session in sessions {
                    println!(
                        "  {} '{}' {}/{} bytes",
                        session.peer_address,
                        session.requested_item,
                        session.bytes_transferred,
                        session.bytes_total
                    );
                }
            }
            Command::Help => println!("{}", HELP),
            Command::Quit => {}
        }
    }

    /// Files go at once; a folder asks first and is deleted on a yes
    async fn delete(&mut self, name: String, consent: Consent) {
        let label = name.clone();
        match self.with_store(move |store| store.delete(&name, consent)).await {
            Ok(DeleteOutcome::Deleted(ItemKind::Folder)) => println!("Deleted folder '{}'", label),
            Ok(DeleteOutcome::Deleted(ItemKind::File)) => println!("Deleted file '{}'", label),
            Ok(DeleteOutcome::Declined) => {
                println!("Delete folder '{}' and everything in it? [y/N]", label);
                self.pending_delete = Some(label);
            }
            Err(e) => println!("{}", e),
        }
    }

    async fn set_mode(&self, public_mode: bool) {
        self.store.set_public_mode(public_mode);

        let settings_store = Arc::clone(&self.settings);
        let saved = tokio::task::spawn_blocking(move || {
            settings_store.modify(|settings| settings.public_mode = public_mode)
        })
        .await
        .map_err(|e| AppError::Io(format!("Saving settings failed: {}", e)))
        .and_then(|result| result);
        if let Err(e) = saved {
            tracing::warn!("Mode changed but not saved: {}", e);
        }

        let label = if public_mode { "Public" } else { "Private" };
        println!("Device is now in {} mode", label);
    }

    async fn print_tree(&self) {
        match self.with_store(|store| store.list_local_tree()).await {
            Ok(items) if items.is_empty() => {
                println!("Shared folder {} is empty", self.store.root().display());
            }
            Ok(items) => print_items(&items, 1),
            Err(e) => println!("{}", e),
        }
    }

    async fn show_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Server(ServerEvent::ListingServed { peer, .. }) => {
                tracing::debug!("{} fetched the file list", peer);
            }
            EngineEvent::Server(ServerEvent::Progress { session }) | EngineEvent::Progress(session) => {
                self.show_progress(&session);
            }
            EngineEvent::Server(ServerEvent::TransferComplete { session }) => {
                self.progress.remove(&session.id);
                let verb = match session.direction {
                    TransferDirection::Upload => "Sent",
                    TransferDirection::Download => "Received",
                };
                println!("{} '{}' ({})", verb, session.requested_item, session.peer_address);
            }
            EngineEvent::Server(ServerEvent::TransferFailed { session, error }) => {
                self.progress.remove(&session.id);
                println!(
                    "Transfer of '{}' with {} failed: {}",
                    session.requested_item, session.peer_address, error
                );
            }
            EngineEvent::Server(ServerEvent::UploadReceived { peer, item }) => {
                println!("{} sent you '{}'", peer, item.name);
                self.print_tree().await;
            }
            EngineEvent::ScanStarted => println!("Scanning local network..."),
            EngineEvent::ScanFinished(report) => {
                println!("{}", report.summary());
                for peer in &report.peers {
                    println!("  {:<16} {}", peer.address, peer.hostname);
                }
            }
            EngineEvent::PeerAdded(peer) => println!("Added {}", peer.address),
            EngineEvent::ProbeResult { address, reachable } => {
                if reachable {
                    println!("{} is running LanShare", address);
                } else {
                    println!("{} did not answer", address);
                }
            }
            EngineEvent::Listing { address, entries } => {
                if entries.is_empty() {
                    println!("{} shares nothing", address);
                }
                for entry in entries {
                    match entry.kind {
                        ItemKind::Folder => println!("  {}/", entry.name),
                        ItemKind::File => println!("  {}", entry.name),
                    }
                }
            }
            EngineEvent::DownloadFinished { address, outcome } => match outcome {
                DownloadOutcome::Saved { path, bytes } => {
                    println!("Saved {} ({} bytes)", path.display(), bytes);
                }
                DownloadOutcome::NotFound { name } => println!("'{}' not found on {}", name, address),
                DownloadOutcome::Cancelled { name } => println!("Download of '{}' cancelled", name),
            },
            EngineEvent::UploadFinished { address, name, bytes } => {
                println!("Sent '{}' to {} ({} bytes)", name, address, bytes);
            }
            EngineEvent::Failed { operation, error } => println!("{} failed: {}", operation, error),
        }
    }

    fn show_progress(&mut self, session: &TransferSession) {
        if session.bytes_total == 0 {
            return;
        }
        let tenth = session.bytes_transferred * 10 / session.bytes_total;
        let last = self.progress.insert(session.id, tenth);
        if last != Some(tenth) {
            println!("  '{}' {}%", session.requested_item, tenth * 10);
        }
        if session.is_complete() {
            self.progress.remove(&session.id);
        }
    }

    async fn with_store<T, F>(&self, op: F) -> Result<T, AppError>
    where
        T: Send + 'static,
        F: FnOnce(&SharedStore) -> Result<T, AppError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(|e| AppError::Io(format!("Store task failed: {}", e)))?
    }

    fn report(&self, result: Result<String, AppError>) {
        match result {
            Ok(message) => println!("{}", message),
            Err(e) => println!("{}", e),
        }
    }
}

fn print_items(items: &[SharedItem], depth: usize) {
    let indent = "  ".repeat(depth);
    for item in items {
        if item.is_folder() {
            println!("{}{}/ [{}]", indent, item.name, item.visibility.label());
            print_items(&item.children, depth + 1);
        } else {
            println!("{}{}", indent, item.name);
        }
    }
}
