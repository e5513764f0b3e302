//! Atomic JSON document I/O.
//!
//! All persistent stores write through this module. The flow is:
//! serialize → write temp file → fsync → rename. If any step fails,
//! the original document is untouched. Rename within one directory is
//! atomic on every platform the node targets.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use ai2ai_types::{Ai2AiError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Serializes `value` and atomically replaces the document at `path`.
///
/// The parent directory is created when missing.
///
/// # Errors
///
/// Returns [`Ai2AiError::Storage`] on serialization or I/O failure.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let raw = serde_json::to_vec_pretty(value).map_err(|e| Ai2AiError::Storage {
        reason: format!("failed to serialize {}: {e}", path.display()),
    })?;

    let tmp = tmp_path(path)?;
    {
        let mut file = fs::File::create(&tmp).map_err(|e| Ai2AiError::Storage {
            reason: format!("failed to create {}: {e}", tmp.display()),
        })?;
        file.write_all(&raw).map_err(|e| Ai2AiError::Storage {
            reason: format!("failed to write {}: {e}", tmp.display()),
        })?;
        file.sync_all().map_err(|e| Ai2AiError::Storage {
            reason: format!("failed to fsync {}: {e}", tmp.display()),
        })?;
    }

    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        Ai2AiError::Storage {
            reason: format!("failed to rename into {}: {e}", path.display()),
        }
    })
}

/// Reads and deserializes the JSON document at `path`.
///
/// # Errors
///
/// Returns [`Ai2AiError::Storage`] when the file is missing,
/// unreadable, or malformed.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read(path).map_err(|e| Ai2AiError::Storage {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;
    serde_json::from_slice(&raw).map_err(|e| Ai2AiError::Storage {
        reason: format!("failed to parse {}: {e}", path.display()),
    })
}

/// Like [`read_json`], but a missing file yields `default()`.
pub fn read_json_or<T: DeserializeOwned>(path: &Path, default: impl FnOnce() -> T) -> Result<T> {
    if !path.exists() {
        return Ok(default());
    }
    read_json(path)
}

/// Removes a document, tolerating its absence.
pub fn remove(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Ai2AiError::Storage {
            reason: format!("failed to remove {}: {e}", path.display()),
        }),
    }
}

/// Lists the `.json` documents directly inside `dir`.
///
/// A missing directory yields an empty list. Temp files from
/// interrupted writes are skipped.
pub fn list_documents(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let entries = fs::read_dir(dir).map_err(|e| Ai2AiError::Storage {
        reason: format!("failed to list {}: {e}", dir.display()),
    })?;

    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| Ai2AiError::Storage {
            reason: format!("failed to read directory entry: {e}"),
        })?;
        let path = entry.path();
        let is_json = path.extension().is_some_and(|ext| ext == "json");
        let is_tmp = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with('.'));
        if is_json && !is_tmp {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

/// Generates the hidden temp path next to `path`, creating the parent
/// directory when missing.
fn tmp_path(path: &Path) -> Result<PathBuf> {
    let parent = path.parent().ok_or_else(|| Ai2AiError::Storage {
        reason: format!("{} has no parent directory", path.display()),
    })?;

    if !parent.exists() {
        fs::create_dir_all(parent).map_err(|e| Ai2AiError::Storage {
            reason: format!("failed to create {}: {e}", parent.display()),
        })?;
    }

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("document.json");
    Ok(parent.join(format!(".{file_name}.tmp")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
