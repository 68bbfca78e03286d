// SPDX-License-Identifier: AGPL-3.0
// LanShare Core - Folder archives
//
// Folders travel as a deflate-compressed tar stream (gzip container) holding
// the folder's contents with paths relative to the folder itself.

use crate::types::AppError;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

/// Write a compressed archive of everything below `folder` into `out`
pub fn pack_folder<W: Write>(folder: &Path, out: W) -> Result<W, AppError> {
    let encoder = GzEncoder::new(out, Compression::default());
    let mut builder = tar::Builder::new(encoder);

    builder
        .append_dir_all("", folder)
        .map_err(|e| AppError::Io(format!("Failed to archive {}: {}", folder.display(), e)))?;

    let encoder = builder
        .into_inner()
        .map_err(|e| AppError::Io(format!("Failed to finish archive: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| AppError::Io(format!("Failed to compress archive: {}", e)))
}

/// Unpack an archive produced by [`pack_folder`] into `dest`, creating it if needed.
///
/// Returns the relative paths of the files written. Entries that would land
/// outside `dest` abort the unpack.
pub fn unpack_folder<R: Read>(input: R, dest: &Path) -> Result<Vec<PathBuf>, AppError> {
    fs::create_dir_all(dest)
        .map_err(|e| AppError::Io(format!("Failed to create {}: {}", dest.display(), e)))?;

    let mut archive = tar::Archive::new(GzDecoder::new(input));
    let entries = archive
        .entries()
        .map_err(|e| AppError::Protocol(format!("Invalid folder archive: {}", e)))?;

    let mut written = Vec::new();
    for entry in entries {
        let mut entry =
            entry.map_err(|e| AppError::Protocol(format!("Invalid archive entry: {}", e)))?;
        let path = entry
            .path()
            .map_err(|e| AppError::Protocol(format!("Invalid archive path: {}", e)))?
            .into_owned();

        let relative = normalize_entry_path(&path)?;
        if relative.as_os_str().is_empty() {
            continue;
        }

        let is_file = entry.header().entry_type().is_file();
        let unpacked = entry
            .unpack_in(dest)
            .map_err(|e| AppError::Io(format!("Failed to unpack {}: {}", relative.display(), e)))?;
        if unpacked && is_file {
            written.push(relative);
        }
    }

    Ok(written)
}

fn normalize_entry_path(path: &Path) -> Result<PathBuf, AppError> {
    let mut relative = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(AppError::Protocol(format!(
                    "Archive entry escapes destination: {}",
                    path.display()
                )));
            }
        }
    }
    Ok(relative)
}
