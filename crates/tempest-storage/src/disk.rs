//! Disk manager: page-granular I/O against a single data file.
//!
//! Pages live at `page_id * PAGE_SIZE` offsets. Ids are handed out by the
//! buffer pool without reserving file space, so reads beyond the current
//! end of file yield zeroed pages rather than an error.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use tempest_common::error::StorageError;
use tempest_common::types::PageId;
use tempest_common::{Error, Result};

use crate::PAGE_SIZE;

/// Low-level page I/O over one database file.
pub struct DiskManager {
    path: PathBuf,
    file: Mutex<File>,
}

impl DiskManager {
    /// Open the database file, creating it if it doesn't exist.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| {
                Error::Storage(StorageError::IoError(format!(
                    "Failed to open database file: {}",
                    e
                )))
            })?;

        Ok(Self { path, file: Mutex::new(file) })
    }

    fn page_offset(page_id: PageId) -> Result<u64> {
        page_id
            .0
            .checked_mul(PAGE_SIZE as u64)
            .ok_or_else(|| Error::invalid_argument(format!("page id {} out of range", page_id)))
    }

    fn check_buffer(buf: &[u8]) -> Result<()> {
        if buf.len() != PAGE_SIZE {
            return Err(Error::invalid_argument(format!(
                "page buffer must be {} bytes, got {}",
                PAGE_SIZE,
                buf.len()
            )));
        }
        Ok(())
    }

    /// Read a page into `buf`, filling exactly `PAGE_SIZE` bytes.
    ///
    /// The portion of the page beyond the end of the file (a page that
    /// was allocated but never written) reads as zeroes.
    pub fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> Result<()> {
        Self::check_buffer(buf)?;
        let offset = Self::page_offset(page_id)?;

        let mut file = self.file.lock();
        let file_len = file
            .metadata()
            .map_err(|e| Error::Storage(StorageError::IoError(e.to_string())))?
            .len();

        if offset >= file_len {
            buf.fill(0);
            return Ok(());
        }

        let available = ((file_len - offset) as usize).min(PAGE_SIZE);
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| Error::Storage(StorageError::IoError(e.to_string())))?;
        file.read_exact(&mut buf[..available])
            .map_err(|e| Error::Storage(StorageError::IoError(e.to_string())))?;
        buf[available..].fill(0);

        Ok(())
    }

    /// Persist exactly `PAGE_SIZE` bytes as `page_id`.
    pub fn write_page(&self, page_id: PageId, buf: &[u8]) -> Result<()> {
        Self::check_buffer(buf)?;
        let offset = Self::page_offset(page_id)?;

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| Error::Storage(StorageError::IoError(e.to_string())))?;
        file.write_all(buf)
            .map_err(|e| Error::Storage(StorageError::IoError(e.to_string())))?;

        Ok(())
    }

    /// Mark `page_id` free on backing store by zeroing its region.
    ///
    /// Arbitrary ids are accepted: a page beyond the end of the file has
    /// no bytes to reclaim and the call is a no-op.
    pub fn deallocate_page(&self, page_id: PageId) -> Result<()> {
        let offset = Self::page_offset(page_id)?;

        let mut file = self.file.lock();
        let file_len = file
            .metadata()
            .map_err(|e| Error::Storage(StorageError::IoError(e.to_string())))?
            .len();

        if offset >= file_len {
            return Ok(());
        }

        let span = ((file_len - offset) as usize).min(PAGE_SIZE);
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| Error::Storage(StorageError::IoError(e.to_string())))?;
        file.write_all(&vec![0u8; span])
            .map_err(|e| Error::Storage(StorageError::IoError(e.to_string())))?;

        Ok(())
    }

    /// Sync file contents to durable storage.
    pub fn sync(&self) -> Result<()> {
        let file = self.file.lock();
        file.sync_all()
            .map_err(|e| Error::Storage(StorageError::IoError(e.to_string())))
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of whole pages currently materialized in the file.
    pub fn num_pages(&self) -> Result<u64> {
        let file = self.file.lock();
        let len = file
            .metadata()
            .map_err(|e| Error::Storage(StorageError::IoError(e.to_string())))?
            .len();
        Ok(len / PAGE_SIZE as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempest_common::testing::fixtures;
    use tempfile::tempdir;

    #[test]
    fn test_read_write_round_trip() {
        let dir = tempdir().unwrap();
        let dm = DiskManager::new(dir.path().join("test.db")).unwrap();

        let payload = fixtures::stamped_page(PAGE_SIZE, 7);
        dm.write_page(PageId(3), &payload).unwrap();

        let mut buf = vec![0u8; PAGE_SIZE];
        dm.read_page(PageId(3), &mut buf).unwrap();
        assert_eq!(buf, payload);
    }

    #[test]
    fn test_unwritten_page_reads_as_zeroes() {
        let dir = tempdir().unwrap();
        let dm = DiskManager::new(dir.path().join("test.db")).unwrap();

        let mut buf = vec![0xFFu8; PAGE_SIZE];
        dm.read_page(PageId(100), &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_deallocate_zeroes_region() {
        let dir = tempdir().unwrap();
        let dm = DiskManager::new(dir.path().join("test.db")).unwrap();

        dm.write_page(PageId(0), &fixtures::page_fill(PAGE_SIZE, 0xAA)).unwrap();
        dm.deallocate_page(PageId(0)).unwrap();

        let mut buf = vec![0xFFu8; PAGE_SIZE];
        dm.read_page(PageId(0), &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_deallocate_accepts_arbitrary_ids() {
        let dir = tempdir().unwrap();
        let dm = DiskManager::new(dir.path().join("test.db")).unwrap();

        // Never-written ids, including far past the end of the file.
        dm.deallocate_page(PageId(0)).unwrap();
        dm.deallocate_page(PageId(1_000_000)).unwrap();
    }

    #[test]
    fn test_wrong_buffer_size_rejected() {
        let dir = tempdir().unwrap();
        let dm = DiskManager::new(dir.path().join("test.db")).unwrap();

        let small = vec![0u8; PAGE_SIZE - 1];
        assert!(dm.write_page(PageId(0), &small).is_err());

        let mut small = vec![0u8; 16];
        assert!(dm.read_page(PageId(0), &mut small).is_err());
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let payload = fixtures::stamped_page(PAGE_SIZE, 42);

        {
            let dm = DiskManager::new(&path).unwrap();
            dm.write_page(PageId(1), &payload).unwrap();
            dm.sync().unwrap();
        }

        let dm = DiskManager::new(&path).unwrap();
        let mut buf = vec![0u8; PAGE_SIZE];
        dm.read_page(PageId(1), &mut buf).unwrap();
        assert_eq!(buf, payload);
        assert_eq!(dm.num_pages().unwrap(), 2);
    }
}
