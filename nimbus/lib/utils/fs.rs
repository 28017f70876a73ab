use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::NimbusResult;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns the total size in bytes and the number of regular files beneath `root`.
///
/// A missing `root` counts as empty.
pub async fn dir_usage(root: impl AsRef<Path>) -> NimbusResult<(u64, u64)> {
    let root = root.as_ref().to_path_buf();
    let usage = tokio::task::spawn_blocking(move || {
        let mut bytes = 0;
        let mut files = 0;
        if !root.exists() {
            return (0, 0);
        }

        for entry in WalkDir::new(&root).follow_links(false).into_iter().flatten() {
            if entry.file_type().is_file() {
                files += 1;
                bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
            }
        }

        (bytes, files)
    })
    .await?;

    Ok(usage)
}

/// Recursively copies the directory `src` into `dst`, creating `dst` if needed.
///
/// Symlinks are recreated rather than followed.
pub async fn copy_dir(src: impl Into<PathBuf>, dst: impl Into<PathBuf>) -> NimbusResult<()> {
    let src = src.into();
    let dst = dst.into();
    tokio::task::spawn_blocking(move || copy_dir_blocking(&src, &dst)).await??;
    Ok(())
}

/// Checks that `path`, with symlinks resolved as far as it exists, stays inside `root`.
///
/// Returns the path unchanged when it is contained. Guards host-side access to directories whose
/// content was written by guests.
pub fn ensure_contained(root: &Path, path: &Path) -> std::io::Result<PathBuf> {
    let root = std::fs::canonicalize(root)?;
    let mut existing = path;
    let resolved = loop {
        match std::fs::canonicalize(existing) {
            Ok(resolved) => break resolved,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => match existing.parent() {
                Some(parent) => existing = parent,
                None => return Err(e),
            },
            Err(e) => return Err(e),
        }
    };

    if !resolved.starts_with(&root) {
        return Err(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            format!("{} escapes its root", path.display()),
        ));
    }

    Ok(path.to_path_buf())
}

fn copy_dir_blocking(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in WalkDir::new(src).min_depth(1).follow_links(false) {
        let entry = entry.map_err(std::io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(std::io::Error::other)?;
        let target = dst.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path())?;
            let _ = std::fs::remove_file(&target);
            std::os::unix::fs::symlink(link, &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
