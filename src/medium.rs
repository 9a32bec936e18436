//! Backing medium abstraction.
//!
//! The engine consumes only a random-access byte source: length, grow,
//! positioned read/write, flush. All engine I/O is 4096-aligned; the
//! medium itself does not know about pages.
//!
//! Two implementations:
//! - `FileMedium` — обычный файл, позиционное I/O через platform FileExt,
//!   чтобы читатели могли работать с одним handle параллельно;
//! - `MemoryMedium` — память, для тестов и volatile-сценариев.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use log::warn;
use parking_lot::RwLock;

use crate::error::{Result, StreamDbError};

pub trait Medium: Send + Sync {
    /// Current length in bytes.
    fn len(&self) -> Result<u64>;

    /// Grow to `new_len` bytes (never shrinks). `OutOfSpace` on refusal.
    fn grow(&self, new_len: u64) -> Result<()>;

    /// Read exactly `buf.len()` bytes at `offset`.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all of `data` at `offset`.
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Force pending writes down to durable storage.
    fn flush(&self) -> Result<()>;
}

// ---------- FileMedium ----------

pub struct FileMedium {
    file: File,
    path: PathBuf,
    // Длина файла кэшируется: len() дергается на каждую проверку границ.
    len: AtomicU64,
}

impl FileMedium {
    /// Open an existing database file.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            file,
            path: path.to_path_buf(),
            len: AtomicU64::new(len),
        })
    }

    /// Create a new database file. Fails if it already exists.
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            len: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, offset: u64, buf: &mut [u8]) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
fn write_all_at(file: &File, offset: u64, data: &[u8]) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(data, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut offset: u64, mut buf: &mut [u8]) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_read(buf, offset)?;
        if n == 0 {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
        }
        offset += n as u64;
        buf = &mut std::mem::take(&mut buf)[n..];
    }
    Ok(())
}

#[cfg(windows)]
fn write_all_at(file: &File, mut offset: u64, mut data: &[u8]) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !data.is_empty() {
        let n = file.seek_write(data, offset)?;
        offset += n as u64;
        data = &data[n..];
    }
    Ok(())
}

impl Medium for FileMedium {
    fn len(&self) -> Result<u64> {
        Ok(self.len.load(Ordering::Acquire))
    }

    fn grow(&self, new_len: u64) -> Result<()> {
        let cur = self.len.load(Ordering::Acquire);
        if new_len <= cur {
            return Ok(());
        }
        if let Err(e) = self.file.set_len(new_len) {
            warn!("grow {} to {} bytes failed: {}", self.path.display(), new_len, e);
            return Err(StreamDbError::OutOfSpace);
        }
        // Зафиксировать новый размер метаданных до того, как страницы
        // в расширенной области станут достижимыми.
        if let Err(e) = self.file.sync_all() {
            warn!("sync after grow of {} failed: {}", self.path.display(), e);
            return Err(StreamDbError::OutOfSpace);
        }
        self.len.store(new_len, Ordering::Release);
        Ok(())
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        read_exact_at(&self.file, offset, buf)?;
        Ok(())
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        write_all_at(&self.file, offset, data)?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

// ---------- MemoryMedium ----------

#[derive(Default)]
pub struct MemoryMedium {
    buf: RwLock<Vec<u8>>,
    /// Отказ расти за этот предел — эмуляция заполненного носителя в тестах.
    cap: Option<u64>,
}

impl MemoryMedium {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity_limit(cap: u64) -> Self {
        Self {
            buf: RwLock::new(Vec::new()),
            cap: Some(cap),
        }
    }
}

impl Medium for MemoryMedium {
    fn len(&self) -> Result<u64> {
        Ok(self.buf.read().len() as u64)
    }

    fn grow(&self, new_len: u64) -> Result<()> {
        if let Some(cap) = self.cap {
            if new_len > cap {
                return Err(StreamDbError::OutOfSpace);
            }
        }
        let mut buf = self.buf.write();
        if new_len as usize > buf.len() {
            buf.resize(new_len as usize, 0);
        }
        Ok(())
    }

    fn read_at(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        let buf = self.buf.read();
        let start = offset as usize;
        let end = start + out.len();
        if end > buf.len() {
            return Err(StreamDbError::Io(io::Error::from(
                io::ErrorKind::UnexpectedEof,
            )));
        }
        out.copy_from_slice(&buf[start..end]);
        Ok(())
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut buf = self.buf.write();
        let start = offset as usize;
        let end = start + data.len();
        if end > buf.len() {
            buf.resize(end, 0);
        }
        buf[start..end].copy_from_slice(data);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}
