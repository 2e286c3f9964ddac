//! Atomic file writing utility.
//!
//! Every record in the run store is written to a temporary file in the
//! destination directory and then renamed into place with
//! `tempfile::NamedTempFile::persist()`, so readers observe either the old
//! or the new content, never a partial write.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tempfile::NamedTempFile;

use crate::{AppError, Result};

/// Serialize `value` as pretty JSON and atomically replace `path`.
///
/// The blocking write runs on the tokio blocking pool.
///
/// # Errors
///
/// Returns `AppError::Serde` if serialization fails, or `AppError::Io` if
/// the temporary file cannot be written or persisted.
pub async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    write_bytes(path.to_path_buf(), bytes).await
}

/// Atomically replace `path` with `bytes`.
///
/// # Errors
///
/// Returns `AppError::Io` if the temporary file cannot be written or persisted.
pub async fn write_bytes(path: PathBuf, bytes: Vec<u8>) -> Result<()> {
    tokio::task::spawn_blocking(move || write_sync(&path, &bytes))
        .await
        .map_err(|err| AppError::Io(format!("atomic write task panicked: {err}")))?
}

fn write_sync(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| AppError::Io(format!("{} has no parent directory", path.display())))?;
    std::fs::create_dir_all(parent).map_err(|err| {
        AppError::Io(format!(
            "failed to create directory {}: {err}",
            parent.display()
        ))
    })?;

    let mut tmp = NamedTempFile::new_in(parent)
        .map_err(|err| AppError::Io(format!("failed to create temporary file: {err}")))?;
    tmp.write_all(bytes)
        .map_err(|err| AppError::Io(format!("failed to write temporary file: {err}")))?;
    tmp.as_file()
        .sync_all()
        .map_err(|err| AppError::Io(format!("failed to sync temporary file: {err}")))?;
    tmp.persist(path)
        .map_err(|err| AppError::Io(format!("failed to persist {}: {err}", path.display())))?;
    Ok(())
}
