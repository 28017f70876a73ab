use std::{
    io,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};

use crate::{NimbusError, NimbusResult};

use super::{EntryInfo, EntryKind};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Builds the [`EntryInfo`] of a guest path without following a final symlink.
pub async fn entry_info(guest: &str, host: &Path) -> NimbusResult<EntryInfo> {
    let meta = tokio::fs::symlink_metadata(host)
        .await
        .map_err(|e| io_error(e, guest))?;

    let kind = if meta.file_type().is_symlink() {
        EntryKind::Symlink
    } else if meta.is_dir() {
        EntryKind::Dir
    } else {
        EntryKind::File
    };

    let symlink_target = match kind {
        EntryKind::Symlink => tokio::fs::read_link(host)
            .await
            .ok()
            .map(|target: PathBuf| target.display().to_string()),
        _ => None,
    };

    let name = guest
        .rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or("/")
        .to_string();

    Ok(EntryInfo {
        name,
        path: guest.to_string(),
        kind,
        size: meta.len(),
        mode: meta.permissions().mode() & 0o7777,
        modified_time: meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now()),
        symlink_target,
    })
}

/// Maps an I/O failure on a guest path to the error callers match on.
pub fn io_error(error: io::Error, guest: &str) -> NimbusError {
    match error.kind() {
        io::ErrorKind::NotFound => NimbusError::PathNotFound(guest.to_string()),
        io::ErrorKind::PermissionDenied => NimbusError::PermissionDenied(guest.to_string()),
        io::ErrorKind::AlreadyExists => NimbusError::AlreadyExists(guest.to_string()),
        _ => NimbusError::Io(error),
    }
}
