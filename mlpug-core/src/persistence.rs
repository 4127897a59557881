//! File helpers shared by checkpoint storage.
//!
//! Writes go to a `<name>.tmp` sibling first and are renamed into place, so
//! a crash mid-write never leaves a truncated checkpoint behind.

use crate::error::{MlpugError, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

fn io_error(action: &str, path: &Path, err: impl std::fmt::Display) -> MlpugError {
    MlpugError::checkpoint_io(format!("failed to {action} {}: {err}", path.display()))
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write `data` to `path` atomically, creating parent directories.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| io_error("create directory for", path, e))?;
    }
    let tmp = tmp_sibling(path);
    std::fs::write(&tmp, data).map_err(|e| io_error("write", &tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| io_error("move into place", path, e))
}

/// Serialize `value` as pretty JSON and write it atomically. Returns the bytes written.
pub fn atomic_write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<Vec<u8>> {
    let json = serde_json::to_vec_pretty(value)?;
    atomic_write(path, &json)?;
    Ok(json)
}

/// Load JSON from `path`; `Ok(None)` when the file does not exist.
pub fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read(path).map_err(|e| io_error("read", path, e))?;
    let value = serde_json::from_slice(&data).map_err(|e| io_error("parse", path, e))?;
    Ok(Some(value))
}

/// Hex encoded SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}
