//! # File Store
//!
//! Positioned I/O over the single store file. Chunks are append-only, so the
//! access pattern is simple: `write_fully` appends a serialized chunk (or
//! rewrites the 128-byte store header at offset 0), `read_fully` fetches a
//! page or header from a known offset, and `sync` orders a commit against
//! crashes.
//!
//! The file handle lives behind a mutex; every operation seeks and reads or
//! writes under it. Page reads are already absorbed by the page cache above
//! this layer, so the lock is not a throughput concern.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use eyre::{ensure, Result, WrapErr};
use parking_lot::Mutex;

#[derive(Debug)]
pub struct FileStore {
    file: Mutex<File>,
    path: PathBuf,
    size: AtomicU64,
}

impl FileStore {
    /// Opens (creating if absent) the store file at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open store file {}", path.display()))?;
        let size = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat store file {}", path.display()))?
            .len();
        Ok(Self {
            file: Mutex::new(file),
            path: path.to_path_buf(),
            size: AtomicU64::new(size),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current file size in bytes; the append offset for the next chunk.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Reads exactly `len` bytes starting at `pos`.
    pub fn read_fully(&self, pos: u64, len: usize) -> Result<Vec<u8>> {
        ensure!(
            pos + len as u64 <= self.size(),
            "read of {} bytes at {} beyond end of store file ({} bytes)",
            len,
            pos,
            self.size()
        );
        let mut buf = vec![0u8; len];
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(pos))
            .wrap_err("failed to seek store file")?;
        file.read_exact(&mut buf)
            .wrap_err_with(|| format!("failed to read {} bytes at {}", len, pos))?;
        Ok(buf)
    }

    /// Writes all of `data` starting at `pos`, growing the file if needed.
    pub fn write_fully(&self, pos: u64, data: &[u8]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(pos))
            .wrap_err("failed to seek store file")?;
        file.write_all(data)
            .wrap_err_with(|| format!("failed to write {} bytes at {}", data.len(), pos))?;
        let end = pos + data.len() as u64;
        self.size.fetch_max(end, Ordering::AcqRel);
        Ok(())
    }

    /// Flushes file contents to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.file
            .lock()
            .sync_data()
            .wrap_err_with(|| format!("failed to sync store file {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, FileStore) {
        let dir = tempfile::tempdir().unwrap();
        let fs = FileStore::open(&dir.path().join("store.db")).unwrap();
        (dir, fs)
    }

    #[test]
    fn new_file_is_empty() {
        let (_dir, fs) = temp_store();
        assert_eq!(fs.size(), 0);
    }

    #[test]
    fn write_then_read_roundtrip() {
        let (_dir, fs) = temp_store();
        fs.write_fully(0, b"hello chunk").unwrap();
        assert_eq!(fs.size(), 11);
        assert_eq!(fs.read_fully(6, 5).unwrap(), b"chunk");
    }

    #[test]
    fn append_grows_size() {
        let (_dir, fs) = temp_store();
        fs.write_fully(0, &[1u8; 100]).unwrap();
        fs.write_fully(fs.size(), &[2u8; 50]).unwrap();
        assert_eq!(fs.size(), 150);
        assert_eq!(fs.read_fully(100, 50).unwrap(), vec![2u8; 50]);
    }

    #[test]
    fn overwrite_does_not_shrink() {
        let (_dir, fs) = temp_store();
        fs.write_fully(0, &[1u8; 100]).unwrap();
        fs.write_fully(0, &[9u8; 10]).unwrap();
        assert_eq!(fs.size(), 100);
        assert_eq!(fs.read_fully(0, 10).unwrap(), vec![9u8; 10]);
    }

    #[test]
    fn read_past_end_fails() {
        let (_dir, fs) = temp_store();
        fs.write_fully(0, &[0u8; 10]).unwrap();
        assert!(fs.read_fully(5, 10).is_err());
    }

    #[test]
    fn reopen_sees_existing_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        {
            let fs = FileStore::open(&path).unwrap();
            fs.write_fully(0, &[3u8; 64]).unwrap();
            fs.sync().unwrap();
        }
        let fs = FileStore::open(&path).unwrap();
        assert_eq!(fs.size(), 64);
        assert_eq!(fs.read_fully(0, 64).unwrap(), vec![3u8; 64]);
    }
}
