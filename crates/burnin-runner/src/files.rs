use std::ffi::{OsStr, OsString};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::error::RunResult;

pub fn ensure_dir(path: &Path) -> RunResult<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

/// Replaces `path` in one step. The bytes land in a hidden sibling staging
/// file that is flushed to disk and renamed over the target, so readers see
/// either the previous document or the new one. A failed write removes its
/// staging file.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> RunResult<()> {
    let parent = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    ensure_dir(parent)?;
    let staging = staging_path(path);
    let written = write_synced(&staging, bytes).and_then(|_| fs::rename(&staging, path));
    if let Err(err) = written {
        let _ = fs::remove_file(&staging);
        return Err(err.into());
    }
    sync_dir(parent);
    Ok(())
}

static STAGING_SEQ: AtomicU64 = AtomicU64::new(0);

fn staging_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(".");
    name.push(path.file_name().unwrap_or_else(|| OsStr::new("state")));
    name.push(format!(
        ".{}-{}.partial",
        std::process::id(),
        STAGING_SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    path.with_file_name(name)
}

fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

/// Persists the rename itself.
#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(handle) = fs::File::open(dir) {
        let _ = handle.sync_all();
    }
}

/// Directories cannot be opened as files on Windows.
#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

pub fn atomic_write_json_pretty<T: Serialize>(path: &Path, value: &T) -> RunResult<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

pub fn append_json_line<T: Serialize>(path: &Path, value: &T) -> RunResult<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.write_all(&line)?;
    file.sync_all()?;
    Ok(())
}

pub fn remove_if_exists(path: &Path) -> RunResult<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
