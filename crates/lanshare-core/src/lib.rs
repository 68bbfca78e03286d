// SPDX-License-Identifier: AGPL-3.0
// LanShare Core - Peer-to-peer file sharing on the local network
//
// This crate provides:
// - SharedStore for the shared directory, folder visibility and the access list
// - ConnectionServer answering listing, download, upload and probe requests
// - TransferClient for fetching listings and items from peers
// - PeerScanner for finding peers on the local /24
// - SettingsStore for persistent settings
//
// Frontends live in separate crates.

pub mod archive;
pub mod client;
pub mod history;
pub mod netinfo;
pub mod protocol;
pub mod scanner;
pub mod server;
pub mod settings;
pub mod store;
pub mod types;

// Re-export commonly used items
pub use client::{ClientConfig, DownloadOutcome, TransferClient};
pub use history::ShareHistory;
pub use netinfo::{detect_lan_address, network_interfaces};
pub use scanner::{PeerScanner, ScanConfig, ScanReport};
pub use server::{ConnectionServer, ServerEvent, ServerHandle, ServerState};
pub use settings::SettingsStore;
pub use store::{Consent, DeleteOutcome, SharedStore};
pub use types::{
    AppError, AppSettings, ErrorKind, HistoryEntry, ItemKind, ManifestEntry, NetworkInterface,
    PeerRecord, SharedItem, TransferDirection, TransferSession, Visibility, DEFAULT_PORT,
};
