// SPDX-License-Identifier: AGPL-3.0
// LanShare Core - Type definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use uuid::Uuid;

/// Default TCP port of the sharing service
pub const DEFAULT_PORT: u16 = 5000;

/// Whether a shared item is a plain file or a folder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    File,
    Folder,
}

/// Per-folder visibility flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Private,
}

impl Visibility {
    pub fn from_public(public: bool) -> Self {
        if public {
            Self::Public
        } else {
            Self::Private
        }
    }

    pub fn is_public(self) -> bool {
        self == Self::Public
    }

    pub fn toggled(self) -> Self {
        match self {
            Self::Public => Self::Private,
            Self::Private => Self::Public,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Public => "Public",
            Self::Private => "Private",
        }
    }
}

/// A file or folder under the shared root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedItem {
    /// Path segment relative to the parent
    pub name: String,
    pub kind: ItemKind,
    /// Always `Public` for files
    pub visibility: Visibility,
    /// Sorted by name; empty for files and for folders the viewer may not open
    pub children: Vec<SharedItem>,
}

impl SharedItem {
    pub fn file(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ItemKind::File,
            visibility: Visibility::Public,
            children: Vec::new(),
        }
    }

    pub fn folder(name: impl Into<String>, visibility: Visibility, children: Vec<SharedItem>) -> Self {
        Self {
            name: name.into(),
            kind: ItemKind::Folder,
            visibility,
            children,
        }
    }

    pub fn is_folder(&self) -> bool {
        self.kind == ItemKind::Folder
    }
}

/// One line of the JSON manifest sent to peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Top-level name, or `folder/file` for a file inside a public folder
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ItemKind,
    pub public: bool,
}

impl ManifestEntry {
    /// Name of the item as it will be stored locally once downloaded
    pub fn local_name(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }
}

/// A peer found reachable during a scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRecord {
    pub address: IpAddr,
    /// Reverse-DNS name, or "Unknown"
    pub hostname: String,
    pub reachable_at: DateTime<Utc>,
}

/// Direction of a transfer from this instance's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Upload,
    Download,
}

/// Live state of one transfer connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferSession {
    pub id: Uuid,
    pub peer_address: String,
    pub requested_item: String,
    pub direction: TransferDirection,
    pub bytes_total: u64,
    pub bytes_transferred: u64,
}

impl TransferSession {
    pub fn new(
        peer_address: impl Into<String>,
        requested_item: impl Into<String>,
        direction: TransferDirection,
        bytes_total: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer_address: peer_address.into(),
            requested_item: requested_item.into(),
            direction,
            bytes_total,
            bytes_transferred: 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_transferred >= self.bytes_total
    }
}

/// A local share action, kept for the lifetime of the process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub description: String,
    pub timestamp: DateTime<Utc>,
}

/// A network interface of this host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterface {
    pub name: String,
    pub ip: String,
    pub is_loopback: bool,
}

/// Application settings (frontend-agnostic)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSettings {
    /// Port of the sharing service (default: 5000)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Device name shown in logs and the CLI banner
    #[serde(default = "default_device_name")]
    pub device_name: String,
    /// Root directory exposed to peers
    #[serde(default = "default_shared_dir")]
    pub shared_dir: PathBuf,
    /// Whether the device starts in public mode
    #[serde(default = "default_public_mode")]
    pub public_mode: bool,
    /// Per-address connect timeout while scanning
    #[serde(default = "default_scan_timeout_ms")]
    pub scan_timeout_ms: u64,
    /// Maximum number of probes in flight
    #[serde(default = "default_scan_concurrency")]
    pub scan_concurrency: usize,
    /// Follow a successful connect with a TEST_CONNECTION exchange
    #[serde(default = "default_verify_probe")]
    pub verify_probe: bool,
    /// How long to wait for a peer's manifest
    #[serde(default = "default_list_timeout_ms")]
    pub list_timeout_ms: u64,
    /// Per-read/per-write timeout during transfers
    #[serde(default = "default_io_timeout_secs")]
    pub io_timeout_secs: u64,
    /// Upper bound for a manifest accepted from a peer
    #[serde(default = "default_max_manifest_bytes")]
    pub max_manifest_bytes: usize,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_device_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "LanShare Device".to_string())
}

fn default_public_mode() -> bool {
    true
}

fn default_scan_timeout_ms() -> u64 {
    100
}

fn default_scan_concurrency() -> usize {
    64
}

fn default_verify_probe() -> bool {
    true
}

fn default_list_timeout_ms() -> u64 {
    5000
}

fn default_io_timeout_secs() -> u64 {
    30
}

fn default_max_manifest_bytes() -> usize {
    1024 * 1024
}

/// `<home>/SharedFiles`, or `./SharedFiles` when no home directory is known
pub fn default_shared_dir() -> PathBuf {
    directories::UserDirs::new()
        .map(|d| d.home_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
        .join("SharedFiles")
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            port: default_port(),
            device_name: default_device_name(),
            shared_dir: default_shared_dir(),
            public_mode: default_public_mode(),
            scan_timeout_ms: default_scan_timeout_ms(),
            scan_concurrency: default_scan_concurrency(),
            verify_probe: default_verify_probe(),
            list_timeout_ms: default_list_timeout_ms(),
            io_timeout_secs: default_io_timeout_secs(),
            max_manifest_bytes: default_max_manifest_bytes(),
        }
    }
}

impl AppSettings {
    /// Check values that would make the engine misbehave
    pub fn validate(&self) -> Result<(), AppError> {
        if self.scan_concurrency == 0 {
            return Err(AppError::InvalidConfig(
                "scanConcurrency must be at least 1".to_string(),
            ));
        }
        if self.scan_timeout_ms == 0 || self.list_timeout_ms == 0 || self.io_timeout_secs == 0 {
            return Err(AppError::InvalidConfig("timeouts must be non-zero".to_string()));
        }
        if self.max_manifest_bytes == 0 {
            return Err(AppError::InvalidConfig(
                "maxManifestBytes must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Failure categories visible to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Io,
    AlreadyExists,
    NotAFolder,
    AccessDenied,
    PeerUnreachable,
    Protocol,
    ItemNotFound,
    Serialization,
    InvalidConfig,
}

/// Error types for the application
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("File I/O error: {0}")]
    Io(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Not a folder: {0}")]
    NotAFolder(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Item not found: {0}")]
    ItemNotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_) => ErrorKind::Io,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::NotAFolder(_) => ErrorKind::NotAFolder,
            Self::AccessDenied(_) => ErrorKind::AccessDenied,
            Self::PeerUnreachable(_) => ErrorKind::PeerUnreachable,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::ItemNotFound(_) => ErrorKind::ItemNotFound,
            Self::Serialization(_) => ErrorKind::Serialization,
            Self::InvalidConfig(_) => ErrorKind::InvalidConfig,
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}
