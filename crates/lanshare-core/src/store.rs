// SPDX-License-Identifier: AGPL-3.0
// LanShare Core - Shared store
//
// Single owner of the shared root directory and of the folder visibility and
// access-list metadata. Every mutation and every listing runs inside one
// whole-store critical section, so a listing sees a folder either fully
// present or fully absent. File copies are staged under a hidden name and
// renamed into place inside the critical section. Folder archives for peers
// are packed outside it.

use crate::archive;
use crate::history::ShareHistory;
use crate::types::{
    AppError, HistoryEntry, ItemKind, ManifestEntry, SharedItem, Visibility,
};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs::{self, File};
use std::io::{self, ErrorKind, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tempfile::NamedTempFile;

/// Prefix of staged files; entries carrying it are never listed or served
pub const PARTIAL_PREFIX: &str = ".lanshare-partial-";

/// Caller consent for destructive operations on folders
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consent {
    Granted,
    Withheld,
}

/// Result of a delete request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted(ItemKind),
    /// A folder delete was requested without consent; nothing changed
    Declined,
}

/// An item opened for sending to a peer
#[derive(Debug)]
pub struct Download {
    pub kind: ItemKind,
    /// Raw file contents, or the folder archive
    pub file: File,
    pub len: u64,
}

/// Reference to an item by its display name: `name` or `folder/name`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemRef<'a> {
    Top(&'a str),
    Nested { folder: &'a str, name: &'a str },
}

impl<'a> ItemRef<'a> {
    fn parse(name: &'a str) -> Result<Self, AppError> {
        match name.split_once('/') {
            None => Ok(Self::Top(validate_segment(name)?)),
            Some((folder, rest)) => Ok(Self::Nested {
                folder: validate_segment(folder)?,
                name: validate_segment(rest)?,
            }),
        }
    }

    fn folder(&self) -> Option<&'a str> {
        match self {
            Self::Top(_) => None,
            Self::Nested { folder, .. } => Some(folder),
        }
    }

    fn path_in(&self, root: &Path) -> PathBuf {
        match self {
            Self::Top(name) => root.join(name),
            Self::Nested { folder, name } => root.join(folder).join(name),
        }
    }
}

fn validate_segment(segment: &str) -> Result<&str, AppError> {
    let valid = !segment.is_empty()
        && segment != "."
        && segment != ".."
        && !segment.contains(['/', '\\'])
        && !segment.starts_with(PARTIAL_PREFIX);

    if valid {
        Ok(segment)
    } else {
        Err(AppError::AccessDenied(format!(
            "Invalid item name '{}'",
            segment
        )))
    }
}

struct StoreState {
    public_mode: bool,
    /// Visibility of top-level folders; untracked folders are Public
    folders: HashMap<String, Visibility>,
    access_list: BTreeSet<String>,
}

impl StoreState {
    fn track(&mut self, folder: &str) -> Visibility {
        *self.folders.entry(folder.to_string()).or_insert_with(|| {
            tracing::info!("Added missing folder to tracking: {}", folder);
            Visibility::Public
        })
    }

    fn can_open(&self, visibility: Visibility, local_public_mode: bool, is_self: bool, viewer: &str) -> bool {
        visibility.is_public() || (!local_public_mode && is_self) || self.access_list.contains(viewer)
    }

    fn check_access(&mut self, folder: &str, requester: &str) -> Result<(), AppError> {
        let visibility = self.track(folder);
        if !self.public_mode && !visibility.is_public() && !self.access_list.contains(requester) {
            return Err(AppError::AccessDenied(format!(
                "Folder '{}' is private and {} is not on the access list",
                folder, requester
            )));
        }
        Ok(())
    }
}

/// One directory entry of the shared tree
struct DirEntry {
    name: String,
    is_dir: bool,
}

fn read_dir_sorted(path: &Path) -> Result<Vec<DirEntry>, AppError> {
    let mut entries = Vec::new();
    let reader = fs::read_dir(path)
        .map_err(|e| AppError::Io(format!("Failed to read {}: {}", path.display(), e)))?;

    for entry in reader {
        let entry = entry.map_err(|e| AppError::Io(format!("Failed to read entry: {}", e)))?;
        let name = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(raw) => {
                tracing::warn!("Skipping non UTF-8 entry {:?}", raw);
                continue;
            }
        };
        if name.starts_with(PARTIAL_PREFIX) {
            continue;
        }
        let is_dir = entry.path().is_dir();
        entries.push(DirEntry { name, is_dir });
    }

    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

fn list_children(path: &Path, visibility: Visibility) -> Result<Vec<SharedItem>, AppError> {
    read_dir_sorted(path)?
        .into_iter()
        .map(|entry| {
            if entry.is_dir {
                let children = list_children(&path.join(&entry.name), visibility)?;
                Ok(SharedItem::folder(entry.name, visibility, children))
            } else {
                Ok(SharedItem::file(entry.name))
            }
        })
        .collect()
}

/// Copy `source` next to its destination under a hidden staging name
fn stage_copy(source: &Path, dir: &Path) -> Result<NamedTempFile, AppError> {
    let mut input = File::open(source)
        .map_err(|e| AppError::Io(format!("Failed to open {}: {}", source.display(), e)))?;
    let permissions = input.metadata()?.permissions();

    let mut staged = tempfile::Builder::new()
        .prefix(PARTIAL_PREFIX)
        .tempfile_in(dir)
        .map_err(|e| AppError::Io(format!("Failed to stage in {}: {}", dir.display(), e)))?;

    io::copy(&mut input, staged.as_file_mut())
        .map_err(|e| AppError::Io(format!("Failed to copy {}: {}", source.display(), e)))?;
    staged.as_file().sync_all()?;
    fs::set_permissions(staged.path(), permissions)?;

    Ok(staged)
}

fn file_name_of(source: &Path) -> Result<String, AppError> {
    source
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| AppError::Io(format!("Invalid file path: {}", source.display())))
}

/// Reduce a peer-supplied file name to a safe final path component
pub fn sanitize_file_name(name: &str, fallback: &str) -> String {
    let trimmed = name.trim();
    let file_name = Path::new(trimmed)
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.trim())
        .filter(|n| !n.is_empty() && *n != "." && *n != ".." && !n.starts_with(PARTIAL_PREFIX));

    file_name
        .map(|n| n.to_string())
        .unwrap_or_else(|| fallback.to_string())
}

fn split_file_name(name: &str) -> (&str, &str) {
    if let Some((stem, ext)) = name.rsplit_once('.') {
        if !stem.is_empty() {
            return (stem, ext);
        }
    }
    (name, "")
}

fn unique_candidates(base_name: &str) -> impl Iterator<Item = String> + '_ {
    let (stem, ext) = split_file_name(base_name);
    (0..1000).map(move |index| {
        if index == 0 {
            base_name.to_string()
        } else if ext.is_empty() {
            format!("{} ({})", stem, index)
        } else {
            format!("{} ({}).{}", stem, index, ext)
        }
    })
}

/// The shared directory and its metadata
pub struct SharedStore {
    root: PathBuf,
    local_address: String,
    state: Mutex<StoreState>,
    history: ShareHistory,
}

impl SharedStore {
    /// Open (creating if needed) the shared root
    pub fn open(
        root: impl Into<PathBuf>,
        local_address: impl Into<String>,
        public_mode: bool,
    ) -> Result<Self, AppError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|e| AppError::Io(format!("Failed to create {}: {}", root.display(), e)))?;
        tracing::info!("Sharing {}", root.display());

        Ok(Self {
            root,
            local_address: local_address.into(),
            state: Mutex::new(StoreState {
                public_mode,
                folders: HashMap::new(),
                access_list: BTreeSet::new(),
            }),
            history: ShareHistory::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Address this host identifies itself with in access checks
    pub fn local_address(&self) -> &str {
        &self.local_address
    }

    pub fn public_mode(&self) -> bool {
        self.lock().public_mode
    }

    pub fn set_public_mode(&self, public_mode: bool) {
        self.lock().public_mode = public_mode;
        let label = if public_mode { "Public" } else { "Private" };
        tracing::info!("Device is now {}", label);
        self.history.record(format!("Device switched to {} mode", label));
    }

    /// Copy an external file into the top level of the shared root
    pub fn put_file(&self, source: &Path) -> Result<SharedItem, AppError> {
        let name = file_name_of(source)?;
        validate_segment(&name)?;
        let staged = stage_copy(source, &self.root)?;

        let _state = self.lock();
        let dest = self.root.join(&name);
        if dest.is_dir() {
            return Err(AppError::AlreadyExists(format!(
                "A folder named '{}' already exists",
                name
            )));
        }
        staged
            .persist(&dest)
            .map_err(|e| AppError::Io(format!("Failed to share '{}': {}", name, e.error)))?;

        self.history.record(format!("Shared file '{}'", name));
        Ok(SharedItem::file(name))
    }

    /// Create an empty top-level folder with the current mode's visibility
    pub fn create_folder(&self, name: &str) -> Result<SharedItem, AppError> {
        let name = validate_segment(name.trim())?;
        let mut state = self.lock();
        let path = self.root.join(name);

        match fs::create_dir(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(AppError::AlreadyExists(format!(
                    "Folder '{}' already exists",
                    name
                )));
            }
            Err(e) => {
                return Err(AppError::Io(format!(
                    "Failed to create folder '{}': {}",
                    name, e
                )));
            }
        }

        let visibility = Visibility::from_public(state.public_mode);
        state.folders.insert(name.to_string(), visibility);
        drop(state);

        self.history.record(format!(
            "Created {} folder '{}'",
            visibility.label().to_lowercase(),
            name
        ));
        Ok(SharedItem::folder(name, visibility, Vec::new()))
    }

    /// Copy external files into an existing top-level folder
    pub fn add_files_to_folder(
        &self,
        folder_name: &str,
        sources: &[PathBuf],
    ) -> Result<Vec<SharedItem>, AppError> {
        let folder = validate_segment(folder_name)?;
        let folder_path = self.root.join(folder);
        let names = sources
            .iter()
            .map(|source| {
                let name = file_name_of(source)?;
                validate_segment(&name)?;
                Ok(name)
            })
            .collect::<Result<Vec<_>, AppError>>()?;

        {
            let mut state = self.lock();
            self.require_folder(folder, &folder_path)?;
            state.check_access(folder, &self.local_address)?;
        }

        let staged = sources
            .iter()
            .map(|source| stage_copy(source, &folder_path))
            .collect::<Result<Vec<_>, _>>()?;

        let mut state = self.lock();
        self.require_folder(folder, &folder_path)?;
        state.check_access(folder, &self.local_address)?;

        let mut created: Vec<PathBuf> = Vec::new();
        for (file, name) in staged.into_iter().zip(&names) {
            let dest = folder_path.join(name);
            let existed = dest.exists();
            if let Err(e) = file.persist(&dest) {
                for path in &created {
                    let _ = fs::remove_file(path);
                }
                return Err(AppError::Io(format!(
                    "Failed to add '{}' to '{}': {}",
                    name, folder, e.error
                )));
            }
            if !existed {
                created.push(dest);
            }
        }
        drop(state);

        self.history.record(format!(
            "Added {} file(s) to '{}'",
            names.len(),
            folder
        ));
        Ok(names.into_iter().map(SharedItem::file).collect())
    }

    fn require_folder(&self, name: &str, path: &Path) -> Result<(), AppError> {
        if path.is_dir() {
            Ok(())
        } else if path.exists() {
            Err(AppError::NotAFolder(name.to_string()))
        } else {
            Err(AppError::ItemNotFound(name.to_string()))
        }
    }

    /// Flip a folder between Public and Private.
    ///
    /// Returns the new visibility, or `None` when the item is a file.
    pub fn toggle_visibility(&self, item_name: &str) -> Result<Option<Visibility>, AppError> {
        let item = ItemRef::parse(item_name)?;
        let mut state = self.lock();
        let path = item.path_in(&self.root);

        if !path.exists() {
            return Err(AppError::ItemNotFound(item_name.to_string()));
        }
        let folder = match item {
            ItemRef::Top(name) if path.is_dir() => name,
            _ => return Ok(None),
        };

        let visibility = state.track(folder).toggled();
        state.folders.insert(folder.to_string(), visibility);
        drop(state);

        tracing::info!("Folder '{}' is now {}", folder, visibility.label());
        self.history
            .record(format!("Folder '{}' is now {}", folder, visibility.label()));
        Ok(Some(visibility))
    }

    /// Remove a file, or a folder with its whole subtree
    pub fn delete(&self, item_name: &str, consent: Consent) -> Result<DeleteOutcome, AppError> {
        let item = ItemRef::parse(item_name)?;
        let mut state = self.lock();
        let path = item.path_in(&self.root);

        let metadata = match fs::symlink_metadata(&path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(AppError::ItemNotFound(item_name.to_string()));
            }
            Err(e) => return Err(AppError::Io(e.to_string())),
        };
        let kind = if metadata.is_dir() {
            ItemKind::Folder
        } else {
            ItemKind::File
        };

        match (item, kind) {
            (ItemRef::Top(name), ItemKind::Folder) => state.check_access(name, &self.local_address)?,
            _ => {
                if let Some(folder) = item.folder() {
                    state.check_access(folder, &self.local_address)?;
                }
            }
        }

        if kind == ItemKind::Folder && consent == Consent::Withheld {
            return Ok(DeleteOutcome::Declined);
        }

        match kind {
            ItemKind::File => fs::remove_file(&path).map_err(|e| {
                AppError::Io(format!("Failed to delete '{}': {}", item_name, e))
            })?,
            ItemKind::Folder => self.remove_folder(&path, item_name)?,
        }

        if let ItemRef::Top(name) = item {
            state.folders.remove(name);
        }
        drop(state);

        self.history.record(format!("Deleted '{}'", item_name));
        Ok(DeleteOutcome::Deleted(kind))
    }

    /// Move the folder out of sight first so it disappears in one step
    fn remove_folder(&self, path: &Path, item_name: &str) -> Result<(), AppError> {
        let parent = path.parent().unwrap_or(&self.root);
        let trash = parent.join(format!("{}trash-{}", PARTIAL_PREFIX, uuid::Uuid::new_v4()));

        fs::rename(path, &trash)
            .map_err(|e| AppError::Io(format!("Failed to delete '{}': {}", item_name, e)))?;
        if let Err(e) = fs::remove_dir_all(&trash) {
            tracing::warn!("Leftover data at {}: {}", trash.display(), e);
        }
        Ok(())
    }

    /// Full item tree as seen by `viewer_address`.
    ///
    /// A Private folder's children are included when the viewer is on the
    /// access list, or when the local mode is Private and the viewer is this
    /// host. Otherwise the folder appears with no children.
    pub fn list_tree(
        &self,
        viewer_is_local_public_mode: bool,
        viewer_address: &str,
    ) -> Result<Vec<SharedItem>, AppError> {
        let mut state = self.lock();
        let is_self = viewer_address == self.local_address;
        let entries = read_dir_sorted(&self.root)?;
        self.forget_missing(&mut state, &entries);

        let mut items = Vec::with_capacity(entries.len());
        for entry in entries {
            if !entry.is_dir {
                items.push(SharedItem::file(entry.name));
                continue;
            }

            let visibility = state.track(&entry.name);
            let children = if state.can_open(visibility, viewer_is_local_public_mode, is_self, viewer_address) {
                list_children(&self.root.join(&entry.name), visibility)?
            } else {
                Vec::new()
            };
            items.push(SharedItem::folder(entry.name, visibility, children));
        }

        Ok(items)
    }

    /// Tree as displayed to the local user in the current mode
    pub fn list_local_tree(&self) -> Result<Vec<SharedItem>, AppError> {
        let public_mode = self.public_mode();
        self.list_tree(public_mode, &self.local_address)
    }

    fn forget_missing(&self, state: &mut StoreState, entries: &[DirEntry]) {
        let present: HashSet<&str> = entries
            .iter()
            .filter(|e| e.is_dir)
            .map(|e| e.name.as_str())
            .collect();
        state.folders.retain(|name, _| present.contains(name.as_str()));
    }

    /// Items visible to an anonymous peer: root files, Public folders and
    /// their immediate files as `folder/file`
    pub fn public_manifest(&self) -> Result<Vec<ManifestEntry>, AppError> {
        let mut state = self.lock();
        let entries = read_dir_sorted(&self.root)?;
        self.forget_missing(&mut state, &entries);

        let mut manifest = Vec::new();
        for entry in entries {
            if !entry.is_dir {
                manifest.push(ManifestEntry {
                    name: entry.name,
                    kind: ItemKind::File,
                    public: true,
                });
                continue;
            }

            if !state.track(&entry.name).is_public() {
                continue;
            }

            let children = read_dir_sorted(&self.root.join(&entry.name))?;
            manifest.push(ManifestEntry {
                name: entry.name.clone(),
                kind: ItemKind::Folder,
                public: true,
            });
            manifest.extend(children.into_iter().filter(|c| !c.is_dir).map(|child| {
                ManifestEntry {
                    name: format!("{}/{}", entry.name, child.name),
                    kind: ItemKind::File,
                    public: true,
                }
            }));
        }

        Ok(manifest)
    }

    /// Wire-format (JSON) form of [`public_manifest`](Self::public_manifest)
    pub fn serialize_public_manifest(&self) -> Result<Vec<u8>, AppError> {
        let manifest = self.public_manifest()?;
        Ok(serde_json::to_vec(&manifest)?)
    }

    /// Open an item for a peer. Folders are archived into an anonymous temp file.
    ///
    /// `Ok(None)` when nothing by that name exists; `AccessDenied` when the
    /// item lives in a Private folder the peer is not allowed into. The
    /// store lock covers only the lookup and the access check; packing a
    /// folder runs unlocked, and a folder deleted meanwhile fails this
    /// download with `Io`.
    pub fn open_download(&self, item_name: &str, peer_address: &str) -> Result<Option<Download>, AppError> {
        let item = match ItemRef::parse(item_name) {
            Ok(item) => item,
            Err(_) => return Ok(None),
        };
        let path = item.path_in(&self.root);

        {
            let mut state = self.lock();
            if !path.exists() {
                return Ok(None);
            }

            let guarding_folder = match item {
                ItemRef::Top(name) if path.is_dir() => Some(name),
                ItemRef::Top(_) => None,
                ItemRef::Nested { folder, .. } => Some(folder),
            };
            if let Some(folder) = guarding_folder {
                let visibility = state.track(folder);
                if !visibility.is_public() && !state.access_list.contains(peer_address) {
                    return Err(AppError::AccessDenied(format!(
                        "Folder '{}' is private; {} is not on the access list",
                        folder, peer_address
                    )));
                }
            }

            if !path.is_dir() {
                let file = File::open(&path)
                    .map_err(|e| AppError::Io(format!("Failed to open '{}': {}", item_name, e)))?;
                let len = file.metadata()?.len();
                return Ok(Some(Download {
                    kind: ItemKind::File,
                    file,
                    len,
                }));
            }
        }

        let mut file = tempfile::tempfile()?;
        archive::pack_folder(&path, &mut file)?;
        let len = file.seek(SeekFrom::End(0))?;
        file.seek(SeekFrom::Start(0))?;
        Ok(Some(Download {
            kind: ItemKind::Folder,
            file,
            len,
        }))
    }

    /// Hidden file in the shared root that an incoming upload is written to
    pub fn stage_upload(&self) -> Result<NamedTempFile, AppError> {
        tempfile::Builder::new()
            .prefix(PARTIAL_PREFIX)
            .tempfile_in(&self.root)
            .map_err(|e| AppError::Io(format!("Failed to stage upload: {}", e)))
    }

    /// Move a completed upload into place under a non-colliding name
    pub fn commit_upload(
        &self,
        staged: NamedTempFile,
        requested_name: &str,
        peer_address: &str,
    ) -> Result<SharedItem, AppError> {
        let base_name = sanitize_file_name(requested_name, "upload");
        let state = self.lock();

        let mut staged = staged;
        for candidate in unique_candidates(&base_name) {
            match staged.persist_noclobber(self.root.join(&candidate)) {
                Ok(_) => {
                    drop(state);
                    self.history
                        .record(format!("Received file '{}' from {}", candidate, peer_address));
                    return Ok(SharedItem::file(candidate));
                }
                Err(e) if e.error.kind() == ErrorKind::AlreadyExists => staged = e.file,
                Err(e) => {
                    return Err(AppError::Io(format!(
                        "Failed to store upload '{}': {}",
                        base_name, e.error
                    )));
                }
            }
        }

        Err(AppError::AlreadyExists(format!(
            "Too many filename conflicts for '{}'",
            base_name
        )))
    }

    /// Visibility of a top-level folder, tracking it if unseen
    pub fn visibility_of(&self, folder: &str) -> Result<Visibility, AppError> {
        let folder = validate_segment(folder)?;
        let path = self.root.join(folder);
        let mut state = self.lock();
        self.require_folder(folder, &path)?;
        Ok(state.track(folder))
    }

    /// Grant an address access to Private folders
    pub fn add_to_access_list(&self, address: &str) -> bool {
        let address = address.trim();
        if address.is_empty() {
            return false;
        }
        let added = self.lock().access_list.insert(address.to_string());
        if added {
            self.history
                .record(format!("Granted private access to {}", address));
        }
        added
    }

    /// Revoke a previously granted address
    pub fn remove_from_access_list(&self, address: &str) -> bool {
        let removed = self.lock().access_list.remove(address.trim());
        if removed {
            self.history
                .record(format!("Revoked private access from {}", address.trim()));
        }
        removed
    }

    pub fn access_list(&self) -> Vec<String> {
        self.lock().access_list.iter().cloned().collect()
    }

    pub fn has_access(&self, address: &str) -> bool {
        self.lock().access_list.contains(address)
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.history.list()
    }
}
