//! `nimbusutils::path` is a module containing guest path utilities for the nimbus project.
//!
//! Guest paths are always Unix paths, regardless of the host platform, so they are handled with
//! `typed_path` rather than `std::path`.

use std::path::{Path, PathBuf};

use typed_path::{Utf8UnixComponent, Utf8UnixPathBuf};

use crate::{NimbusutilsError, NimbusutilsResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The suffix for log files
pub const LOG_SUFFIX: &str = "log";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The type of a supported path.
pub enum SupportedPathType {
    /// Any path type.
    Any,

    /// An absolute path.
    Absolute,

    /// A relative path.
    Relative,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Normalizes a guest path.
///
/// Rules:
/// - Resolves `.` and `..` components
/// - Rejects traversal that would escape the root
/// - Removes redundant separators and trailing slashes
/// - Enforces the requested path type (absolute, relative, or any)
///
/// ## Arguments
///
/// * `path` - The path to normalize
/// * `path_type` - The required path type
pub fn normalize_path(path: &str, path_type: SupportedPathType) -> NimbusutilsResult<String> {
    if path.is_empty() {
        return Err(NimbusutilsError::PathValidation(
            "path cannot be empty".to_string(),
        ));
    }

    if path.contains('\0') {
        return Err(NimbusutilsError::PathValidation(
            "path cannot contain NUL bytes".to_string(),
        ));
    }

    let path = Utf8UnixPathBuf::from(path);
    let mut segments: Vec<&str> = Vec::new();
    let mut is_absolute = false;

    for component in path.components() {
        match component {
            Utf8UnixComponent::RootDir => is_absolute = true,
            Utf8UnixComponent::CurDir => continue,
            Utf8UnixComponent::ParentDir => {
                if segments.pop().is_none() {
                    return Err(NimbusutilsError::PathValidation(
                        "cannot traverse above root directory".to_string(),
                    ));
                }
            }
            Utf8UnixComponent::Normal(segment) => {
                if !segment.is_empty() {
                    segments.push(segment);
                }
            }
        }
    }

    match path_type {
        SupportedPathType::Absolute if !is_absolute => {
            return Err(NimbusutilsError::PathValidation(
                "path must be absolute (start with '/')".to_string(),
            ));
        }
        SupportedPathType::Relative if is_absolute => {
            return Err(NimbusutilsError::PathValidation(
                "path must be relative (must not start with '/')".to_string(),
            ));
        }
        _ => {}
    }

    if is_absolute {
        Ok(format!("/{}", segments.join("/")))
    } else {
        Ok(segments.join("/"))
    }
}

/// Resolves a possibly relative guest path against a working directory and normalizes it.
pub fn resolve_guest_path(path: &str, cwd: &str) -> NimbusutilsResult<String> {
    if path.starts_with('/') {
        normalize_path(path, SupportedPathType::Absolute)
    } else {
        let cwd = normalize_path(cwd, SupportedPathType::Absolute)?;
        normalize_path(&format!("{}/{}", cwd, path), SupportedPathType::Absolute)
    }
}

/// Returns true if the normalized absolute `path` is `prefix` itself or lies beneath it.
///
/// `"/workspacefoo"` is not under `"/workspace"`.
pub fn is_under(path: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return path.starts_with('/');
    }

    match path.strip_prefix(prefix) {
        Some("") => true,
        Some(rest) => rest.starts_with('/'),
        None => false,
    }
}

/// Strips `prefix` from a normalized absolute `path`, returning the remainder without a leading
/// slash. Returns `None` if the path is not under the prefix.
pub fn strip_guest_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    if !is_under(path, prefix) {
        return None;
    }

    if prefix == "/" {
        return Some(path.trim_start_matches('/'));
    }

    path.strip_prefix(prefix).map(|rest| rest.trim_start_matches('/'))
}

/// Maps a relative guest path onto a host directory.
///
/// The relative path must already be normalized; it is joined segment by segment so that it can
/// never leave `host_root`.
pub fn host_path(host_root: &Path, relative: &str) -> PathBuf {
    relative
        .split('/')
        .filter(|segment| !segment.is_empty())
        .fold(host_root.to_path_buf(), |acc, segment| acc.join(segment))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(
            normalize_path("/workspace/app/", SupportedPathType::Absolute).unwrap(),
            "/workspace/app"
        );
        assert_eq!(
            normalize_path("/workspace//./app", SupportedPathType::Absolute).unwrap(),
            "/workspace/app"
        );
        assert_eq!(
            normalize_path("/workspace/tmp/../app", SupportedPathType::Any).unwrap(),
            "/workspace/app"
        );
        assert_eq!(
            normalize_path("./data//app", SupportedPathType::Relative).unwrap(),
            "data/app"
        );
        assert_eq!(normalize_path("/", SupportedPathType::Absolute).unwrap(), "/");
        assert_eq!(
            normalize_path("/data/..", SupportedPathType::Absolute).unwrap(),
            "/"
        );

        assert!(matches!(
            normalize_path("data/app", SupportedPathType::Absolute),
            Err(NimbusutilsError::PathValidation(e)) if e.contains("must be absolute")
        ));
        assert!(matches!(
            normalize_path("/data/app", SupportedPathType::Relative),
            Err(NimbusutilsError::PathValidation(e)) if e.contains("must be relative")
        ));
        assert!(matches!(
            normalize_path("/data/../..", SupportedPathType::Any),
            Err(NimbusutilsError::PathValidation(e)) if e.contains("cannot traverse above root")
        ));
        assert!(normalize_path("", SupportedPathType::Any).is_err());
    }

    #[test]
    fn test_resolve_guest_path() {
        assert_eq!(
            resolve_guest_path("x.txt", "/home/user").unwrap(),
            "/home/user/x.txt"
        );
        assert_eq!(
            resolve_guest_path("../x.txt", "/home/user").unwrap(),
            "/home/x.txt"
        );
        assert_eq!(
            resolve_guest_path("/etc/hosts", "/home/user").unwrap(),
            "/etc/hosts"
        );
    }

    #[test]
    fn test_is_under_and_strip() {
        assert!(is_under("/workspace", "/workspace"));
        assert!(is_under("/workspace/x", "/workspace"));
        assert!(!is_under("/workspacefoo", "/workspace"));
        assert!(!is_under("/etc/data", "/data"));
        assert!(is_under("/anything", "/"));

        assert_eq!(strip_guest_prefix("/workspace/a/b", "/workspace"), Some("a/b"));
        assert_eq!(strip_guest_prefix("/workspace", "/workspace"), Some(""));
        assert_eq!(strip_guest_prefix("/etc", "/workspace"), None);
        assert_eq!(strip_guest_prefix("/etc/hosts", "/"), Some("etc/hosts"));
    }

    #[test]
    fn test_host_path() {
        let root = Path::new("/var/lib/nimbus/sbx");
        assert_eq!(host_path(root, "a/b"), root.join("a").join("b"));
        assert_eq!(host_path(root, ""), root.to_path_buf());
    }
}
