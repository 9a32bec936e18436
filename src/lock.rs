//! File-based locking for single-writer-process safety.
//!
//! Cross-platform (fs2) advisory lock on a `<db-file>.lock` sibling.
//! Multi-process sharing is out of scope for the engine; the lock only
//! keeps a second handle in another process from opening the same file.
//! Released on Drop.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::{Result, StreamDbError};

pub struct LockGuard {
    file: std::fs::File,
    path: PathBuf,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // fs2 unlock errors on drop are ignored deliberately.
        let _ = self.file.unlock();
    }
}

fn lock_file_path(db_path: &Path) -> PathBuf {
    let mut os = db_path.as_os_str().to_os_string();
    os.push(".lock");
    PathBuf::from(os)
}

/// Acquire the exclusive lock next to `db_path`. Fails immediately if the
/// database is held by another process.
pub fn acquire_exclusive(db_path: &Path) -> Result<LockGuard> {
    let path = lock_file_path(db_path);
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&path)?;
    file.try_lock_exclusive().map_err(|e| {
        StreamDbError::Io(std::io::Error::new(
            e.kind(),
            format!("database is locked by another process: {}", path.display()),
        ))
    })?;
    Ok(LockGuard { file, path })
}
