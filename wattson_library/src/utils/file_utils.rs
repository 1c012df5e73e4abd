use crate::transaction::TransactionId;
use anyhow::Result;
use std::io::Write;
use std::path::Path;
use tracing::{debug, warn};

/// Make sure the directory exists
pub fn ensure_dir<P: AsRef<Path>>(dir: P) -> Result<()> {
    match std::fs::create_dir_all(&dir) {
        Ok(_) => Ok(()),
        Err(e) => anyhow::bail!("Failed to create dir '{:?}' because '{}'", dir.as_ref().to_str(), e),
    }
}

/// Tries to remove the specified file
/// Swallows any failure
pub fn try_remove_pth<P: AsRef<Path>>(path: P, tid: &TransactionId) {
    let pth: &Path = path.as_ref();
    if pth.is_file() {
        match std::fs::remove_file(pth) {
            Ok(_) => {},
            Err(_) => warn!(tid=tid, path=%pth.display(), "Unable to remove file"),
        };
    } else if pth.is_dir() {
        match std::fs::remove_dir(pth) {
            Ok(_) => {},
            Err(_) => warn!(tid=tid, path=%pth.display(), "Unable to remove directory"),
        };
    }
}

/// Replace `path` with `contents` so readers only ever see the old or the new file.
/// The data is written to a temporary sibling, synced, and renamed over the target.
pub fn atomic_write<P: AsRef<Path>>(path: P, contents: &[u8], tid: &TransactionId) -> Result<()> {
    let path = path.as_ref();
    let dir = match path.parent() {
        Some(d) if !d.as_os_str().is_empty() => d,
        _ => Path::new("."),
    };
    ensure_dir(dir)?;
    let mut tmp = match tempfile::NamedTempFile::new_in(dir) {
        Ok(t) => t,
        Err(e) => crate::bail_error!(tid=tid, error=%e, dir=%dir.display(), "Failed to create temporary file"),
    };
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    match tmp.persist(path) {
        Ok(_) => {
            debug!(tid=tid, path=%path.display(), bytes=contents.len(), "File atomically replaced");
            Ok(())
        },
        Err(e) => crate::bail_error!(tid=tid, error=%e.error, path=%path.display(), "Failed to move temporary file into place"),
    }
}

/// Read a small sysfs/procfs style file holding one value.
pub fn read_trimmed<P: AsRef<Path>>(path: P) -> std::io::Result<String> {
    let mut s = std::fs::read_to_string(path)?;
    s.truncate(s.trim_end().len());
    Ok(s)
}
