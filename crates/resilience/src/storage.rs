//! Atomic file writes.
//!
//! Every file this crate persists (cache entries, breaker records, the
//! dedup ledger) goes through [`write_atomic`]: write to a uniquely named
//! temp file in the destination directory, fsync, then rename into place.
//! Readers see either the old file or the new one, never a partial write.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::debug;

use crate::errors::ResilienceError;

/// Suffix shared by all in-progress temp files.
pub const TEMP_SUFFIX: &str = ".tmp";

/// Atomically replace `path` with `bytes`.
///
/// The temp file name is unique per call, so concurrent writers to the
/// same path never share a temp file; the last rename wins.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ResilienceError> {
    let dir = path
        .parent()
        .ok_or_else(|| ResilienceError::Storage(format!("no parent dir for {}", path.display())))?;
    fs::create_dir_all(dir).map_err(|e| {
        ResilienceError::Storage(format!("failed to create dir {}: {e}", dir.display()))
    })?;

    let tmp_path = temp_path_for(path);

    let written = (|| -> std::io::Result<()> {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        Ok(())
    })();

    if let Err(e) = written {
        let _ = fs::remove_file(&tmp_path);
        return Err(ResilienceError::Storage(format!(
            "failed to write {}: {e}",
            tmp_path.display()
        )));
    }

    fs::rename(&tmp_path, path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        ResilienceError::Storage(format!("atomic rename to {} failed: {e}", path.display()))
    })?;

    debug!("Wrote {} bytes to {}", bytes.len(), path.display());
    Ok(())
}

/// Whether a directory entry is an abandoned temp file from [`write_atomic`].
pub fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.') && n.ends_with(TEMP_SUFFIX))
        .unwrap_or(false)
}

fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("entry");
    path.with_file_name(format!(".{name}.{}{TEMP_SUFFIX}", uuid::Uuid::new_v4().simple()))
}
