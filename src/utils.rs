//! Utility functions for path manipulation and hashing

use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};

/// File extensions covered by the `"video"` filter alias
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "avi", "mov", "webm", "wmv", "m4v", "flv"];

/// Expand the `"video"` alias inside an extension list.
///
/// Everything else passes through lowercased with leading dots stripped, so
/// `".PDF"`, `"pdf"` and `"PDF"` all filter the same files.
pub fn expand_extension_aliases(extensions: &[String]) -> Vec<String> {
    let mut expanded = Vec::with_capacity(extensions.len());
    for ext in extensions {
        let normalized = ext.trim_start_matches('.').to_ascii_lowercase();
        if normalized == "video" {
            expanded.extend(VIDEO_EXTENSIONS.iter().map(|v| v.to_string()));
        } else {
            expanded.push(normalized);
        }
    }
    expanded
}

/// Rewrite `path` for its n-th collision by inserting `"(n)"` before the
/// extension, e.g. `notes.pdf` becomes `notes(2).pdf`.
///
/// When `extension_deferred` is true the marker is appended instead, because
/// the trailing component is not an extension yet.
pub fn numbered_path(path: &Path, n: u32, extension_deferred: bool) -> PathBuf {
    if extension_deferred {
        let mut name = path.as_os_str().to_os_string();
        name.push(format!("({})", n));
        return PathBuf::from(name);
    }

    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
    let new_name = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{}({}).{}", stem, n, ext),
        None => format!("{}({})", stem, n),
    };
    match path.parent() {
        Some(parent) if parent != Path::new("") => parent.join(new_name),
        _ => PathBuf::from(new_name),
    }
}

/// Path a replaced file is renamed aside to: `notes.pdf` becomes `notes-old.pdf`
pub fn old_variant(path: &Path) -> PathBuf {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
    let new_name = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{}-old.{}", stem, ext),
        None => format!("{}-old", stem),
    };
    match path.parent() {
        Some(parent) if parent != Path::new("") => parent.join(new_name),
        _ => PathBuf::from(new_name),
    }
}

/// Validate a descriptor-relative path: must not be absolute and must not
/// climb out of the sync root with `..` components.
///
/// Guards against adapter bugs escaping the mirror directory.
pub fn check_contained(relative: &Path) -> Result<()> {
    if relative.is_absolute() {
        return Err(Error::PathEscape {
            path: relative.to_path_buf(),
        });
    }
    let mut depth: i32 = 0;
    for component in relative.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return Err(Error::PathEscape {
                        path: relative.to_path_buf(),
                    });
                }
            }
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => {
                return Err(Error::PathEscape {
                    path: relative.to_path_buf(),
                });
            }
        }
    }
    Ok(())
}

/// Hex-encoded SHA-256 of a byte slice
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        use std::fmt::Write;
        // write! to a String cannot fail
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

/// Lowercased extension of a path, if it has one
pub fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}
