//! File admission checks for read requests
//!
//! `resolve_path` confines a requested name to the served root and
//! `file_status` classifies the target so the protocol can pick an
//! RFC 1350 error code without touching the filesystem itself.
use std::ffi::OsString;
use std::io;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Ok,
    /// Larger than the configured maximum
    TooBig,
    AccessDenied,
    NotFound,
    /// Directory, device, fifo...
    NotRegular,
    Unknown,
}

impl FileStatus {
    pub fn describe(self) -> &'static str {
        match self {
            FileStatus::Ok => "ok",
            FileStatus::TooBig => "file too big",
            FileStatus::AccessDenied => "access denied",
            FileStatus::NotFound => "file not found",
            FileStatus::NotRegular => "not a regular file",
            FileStatus::Unknown => "unknown error",
        }
    }
}

/// Classify `path` for serving
pub fn file_status(path: &Path, max_size: u64) -> FileStatus {
    match std::fs::metadata(path) {
        Ok(meta) => {
            if meta.len() > max_size {
                FileStatus::TooBig
            } else if !meta.is_file() {
                FileStatus::NotRegular
            } else {
                FileStatus::Ok
            }
        }
        Err(e) => status_from_io(&e),
    }
}

/// Map an open/stat failure onto a file status
pub fn status_from_io(error: &io::Error) -> FileStatus {
    match error.kind() {
        io::ErrorKind::NotFound => FileStatus::NotFound,
        io::ErrorKind::PermissionDenied => FileStatus::AccessDenied,
        _ => FileStatus::Unknown,
    }
}

/// Resolve a client supplied filename under `root`.
///
/// The name is taken as raw bytes, so names that are not UTF-8 still map
/// onto the files that carry them. Returns `None` when the name escapes
/// the root: parent components, symbolic links, or a canonical path
/// outside the root.
pub fn resolve_path(root: &Path, filename: &[u8]) -> Option<PathBuf> {
    let mut name: Vec<u8> = filename
        .iter()
        .map(|&b| if b == b'\\' { b'/' } else { b })
        .collect();
    let leading = name.iter().take_while(|&&b| b == b'/').count();
    name.drain(..leading);

    let name = os_string(name)?;
    let relative = Path::new(&name);
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return None;
    }

    let path = root.join(relative);

    match std::fs::symlink_metadata(&path) {
        Ok(meta) if meta.file_type().is_symlink() => return None,
        Ok(_) => {}
        // missing files are reported later as "file not found"
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(_) => return None,
    }

    let canonical_root = root.canonicalize().ok()?;
    match path.canonicalize() {
        Ok(canonical) if !canonical.starts_with(&canonical_root) => None,
        Ok(_) => Some(path),
        Err(_) => match path.parent().and_then(|p| p.canonicalize().ok()) {
            Some(parent) if !parent.starts_with(&canonical_root) => None,
            _ => Some(path),
        },
    }
}

#[cfg(unix)]
fn os_string(bytes: Vec<u8>) -> Option<OsString> {
    use std::os::unix::ffi::OsStringExt;
    Some(OsString::from_vec(bytes))
}

#[cfg(not(unix))]
fn os_string(bytes: Vec<u8>) -> Option<OsString> {
    String::from_utf8(bytes).ok().map(OsString::from)
}
