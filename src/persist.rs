//! Crash-safe JSON files.
//!
//! Writes go to `.<name>.tmp` in the same directory, are fsynced, then renamed
//! over the target. A crash at any point leaves either the old file or the new
//! one, never a torn write. A leftover temp file is ignored on load.
//!
//! File I/O runs on the blocking pool so callers holding an async lock don't
//! stall a runtime worker on `fsync`.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::StoreError;

/// Outcome of reading a persisted file.
#[derive(Debug)]
pub enum Loaded<T> {
    /// No file (or an empty one) on disk.
    Missing,
    Parsed(T),
    /// The file didn't parse and was moved to `backup`.
    Recovered { backup: PathBuf },
}

fn io_err(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// `dir/.name.tmp` for `dir/name`.
pub fn temp_path(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state".to_string());
    path.with_file_name(format!(".{}.tmp", file_name))
}

/// `dir/name.backup` for `dir/name`.
pub fn backup_path(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state".to_string());
    path.with_file_name(format!("{}.backup", file_name))
}

/// Serialize `value` and atomically replace `path` with it.
pub async fn write_json_atomic<T: Serialize + ?Sized>(
    path: &Path,
    value: &T,
) -> Result<(), StoreError> {
    let json = serde_json::to_vec_pretty(value)?;
    let target = path.to_path_buf();
    tokio::task::spawn_blocking(move || write_bytes_atomic(&target, &json))
        .await
        .map_err(|e| io_err(path, std::io::Error::other(e)))?
}

fn write_bytes_atomic(path: &Path, json: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }

    let tmp = temp_path(path);
    let mut file = File::create(&tmp).map_err(|e| io_err(&tmp, e))?;
    file.write_all(json).map_err(|e| io_err(&tmp, e))?;
    file.sync_all().map_err(|e| io_err(&tmp, e))?;
    drop(file);

    fs::rename(&tmp, path).map_err(|e| io_err(path, e))?;
    Ok(())
}

/// Read `path`, moving it aside if it can't be parsed.
///
/// A corrupt file must never prevent startup, so a parse failure renames the
/// file to [`backup_path`] and reports [`Loaded::Recovered`].
pub fn load_json_or_backup<T: DeserializeOwned>(path: &Path) -> Result<Loaded<T>, StoreError> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Loaded::Missing),
        Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
            // Not UTF-8: treat like any other corrupt file.
            return recover(path, &e.to_string());
        }
        Err(e) => return Err(io_err(path, e)),
    };

    if content.trim().is_empty() {
        return Ok(Loaded::Missing);
    }

    match serde_json::from_str(&content) {
        Ok(value) => Ok(Loaded::Parsed(value)),
        Err(e) => recover(path, &e.to_string()),
    }
}

fn recover<T>(path: &Path, reason: &str) -> Result<Loaded<T>, StoreError> {
    let backup = backup_path(path);
    fs::rename(path, &backup).map_err(|e| io_err(path, e))?;
    tracing::error!(
        path = %path.display(),
        backup = %backup.display(),
        "Persisted state was unreadable ({}); moved aside and starting empty",
        reason
    );
    Ok(Loaded::Recovered { backup })
}
