//! Buffer pool manager: page-table admission, eviction-driven frame
//! reuse, dirty write-back, and pin accounting.
//!
//! Lock order is strict: the pool latch may be taken first, then a frame
//! latch, then the replacer lock. Guard drops release their frame latch
//! before re-taking the pool latch for the final evictability update.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, error, trace};

use tempest_common::config::StorageConfig;
use tempest_common::error::StorageError;
use tempest_common::metrics::PoolMetrics;
use tempest_common::types::{FrameId, PageId};
use tempest_common::{Error, Result};

use crate::disk::DiskManager;
use crate::frame::FrameHeader;
use crate::guard::{ReadPageGuard, WritePageGuard};
use crate::replacer::LruKReplacer;
use crate::scheduler::DiskScheduler;
use crate::{AccessType, BufferPoolStats};

/// Page table and free list, guarded together by the pool latch.
pub(crate) struct PageTables {
    pub(crate) page_table: HashMap<PageId, FrameId>,
    pub(crate) free_list: VecDeque<FrameId>,
}

/// Mediates between the in-memory frame cache and the backing store,
/// serving concurrent readers and writers of pages through scoped guards.
pub struct BufferPoolManager {
    num_frames: usize,
    next_page_id: AtomicU64,
    frames: Vec<Arc<FrameHeader>>,
    tables: Arc<Mutex<PageTables>>,
    replacer: Arc<Mutex<LruKReplacer>>,
    scheduler: Arc<DiskScheduler>,
    metrics: PoolMetrics,
    flush_on_drop: bool,
}

/// Disk failure leaves the pool unable to keep guards consistent with
/// durable state; there is no recovery at this layer.
pub(crate) fn fatal_io(page_id: PageId, err: Error) -> ! {
    error!(%page_id, "fatal disk I/O failure: {err}");
    std::process::abort();
}

impl BufferPoolManager {
    /// Create a pool of `num_frames` frames over `disk`, with an LRU-K
    /// replacement policy of the given K.
    pub fn new(num_frames: usize, disk: Arc<DiskManager>, k_dist: usize) -> Self {
        let frames = (0..num_frames)
            .map(|frame_id| Arc::new(FrameHeader::new(frame_id)))
            .collect();
        let tables = PageTables {
            page_table: HashMap::with_capacity(num_frames),
            free_list: (0..num_frames).collect(),
        };

        Self {
            num_frames,
            next_page_id: AtomicU64::new(0),
            frames,
            tables: Arc::new(Mutex::new(tables)),
            replacer: Arc::new(Mutex::new(LruKReplacer::new(num_frames, k_dist))),
            scheduler: Arc::new(DiskScheduler::new(disk)),
            metrics: PoolMetrics::default(),
            flush_on_drop: true,
        }
    }

    /// Create a pool from configuration, opening the data file inside
    /// `data_dir`.
    pub fn with_config(config: &StorageConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|errors| Error::Config(errors.join("; ")))?;
        std::fs::create_dir_all(&config.data_dir)?;

        let disk = Arc::new(DiskManager::new(config.data_dir.join("tempest.db"))?);
        let mut pool = Self::new(config.buffer_pool_frames, disk, config.replacer_k);
        pool.flush_on_drop = config.flush_on_drop;
        Ok(pool)
    }

    /// Number of frames in the pool.
    pub fn size(&self) -> usize {
        self.num_frames
    }

    /// Allocate a fresh page id. No frame is reserved and no disk space
    /// is touched; the first acquisition faults the page in as zeroes.
    pub fn new_page(&self) -> PageId {
        PageId(self.next_page_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Acquire shared access to `page_id`, faulting it in if necessary.
    /// Returns `None` only when no frame is free and nothing is evictable.
    pub fn checked_read_page(
        &self,
        page_id: PageId,
        access_type: AccessType,
    ) -> Option<ReadPageGuard> {
        let frame = self.prepare_frame(page_id, access_type)?;
        Some(ReadPageGuard::acquire(
            page_id,
            frame,
            Arc::clone(&self.replacer),
            Arc::clone(&self.tables),
            Arc::clone(&self.scheduler),
        ))
    }

    /// Acquire exclusive access to `page_id`, faulting it in if necessary.
    /// Returns `None` only when no frame is free and nothing is evictable.
    pub fn checked_write_page(
        &self,
        page_id: PageId,
        access_type: AccessType,
    ) -> Option<WritePageGuard> {
        let frame = self.prepare_frame(page_id, access_type)?;
        Some(WritePageGuard::acquire(
            page_id,
            frame,
            Arc::clone(&self.replacer),
            Arc::clone(&self.tables),
            Arc::clone(&self.scheduler),
        ))
    }

    /// `checked_read_page` for callers that treat an exhausted pool as
    /// unrecoverable: aborts the process instead of returning `None`.
    pub fn read_page(&self, page_id: PageId, access_type: AccessType) -> ReadPageGuard {
        match self.checked_read_page(page_id, access_type) {
            Some(guard) => guard,
            None => {
                let err = Error::Storage(StorageError::BufferPoolFull);
                error!(%page_id, "failed to bring in page for reading: {err}");
                std::process::abort();
            }
        }
    }

    /// `checked_write_page` for callers that treat an exhausted pool as
    /// unrecoverable: aborts the process instead of returning `None`.
    pub fn write_page(&self, page_id: PageId, access_type: AccessType) -> WritePageGuard {
        match self.checked_write_page(page_id, access_type) {
            Some(guard) => guard,
            None => {
                let err = Error::Storage(StorageError::BufferPoolFull);
                error!(%page_id, "failed to bring in page for writing: {err}");
                std::process::abort();
            }
        }
    }

    /// Resolve `page_id` to a pinned, non-evictable frame, loading it
    /// from disk on a miss. The pool latch is released before returning,
    /// so the caller can block on the frame latch with nothing held.
    fn prepare_frame(&self, page_id: PageId, access_type: AccessType) -> Option<Arc<FrameHeader>> {
        let mut tables = self.tables.lock();

        if let Some(&frame_id) = tables.page_table.get(&page_id) {
            let frame = Arc::clone(&self.frames[frame_id]);
            {
                let mut replacer = self.replacer.lock();
                replacer
                    .record_access(frame_id, access_type)
                    .expect("resident frame id within pool bounds");
                replacer
                    .set_evictable(frame_id, false)
                    .expect("resident frame id within pool bounds");
            }
            frame.pin();
            self.metrics.hits.inc();
            trace!(%page_id, frame_id, "buffer pool hit");
            return Some(frame);
        }

        self.metrics.misses.inc();

        let frame_id = match tables.free_list.pop_front() {
            Some(frame_id) => frame_id,
            None => {
                let victim = self.replacer.lock().evict()?;
                self.evict_frame(&mut tables, victim);
                victim
            }
        };

        let frame = Arc::clone(&self.frames[frame_id]);
        let bytes = match self.scheduler.read_page(page_id) {
            Ok(bytes) => bytes,
            Err(e) => fatal_io(page_id, e),
        };
        frame.latch().write().copy_from_slice(&bytes);
        frame.bind(page_id);
        tables.page_table.insert(page_id, frame_id);

        {
            let mut replacer = self.replacer.lock();
            replacer
                .record_access(frame_id, access_type)
                .expect("frame id within pool bounds");
            replacer
                .set_evictable(frame_id, false)
                .expect("frame id within pool bounds");
        }
        frame.pin();
        debug!(%page_id, frame_id, "page loaded into frame");
        Some(frame)
    }

    /// Write back and unmap whatever page the victim frame holds, then
    /// reset it. Runs under the pool latch; the victim is unpinned, so
    /// its latch is free.
    fn evict_frame(&self, tables: &mut PageTables, frame_id: FrameId) {
        let frame = &self.frames[frame_id];
        let old_page_id = frame.page_id();
        if old_page_id.is_valid() {
            if frame.is_dirty() {
                let data = {
                    let buf = frame.latch().read();
                    Bytes::copy_from_slice(&buf[..])
                };
                if let Err(e) = self.scheduler.write_page(old_page_id, data) {
                    fatal_io(old_page_id, e);
                }
                frame.clear_dirty();
                self.metrics.flushes.inc();
            }
            tables.page_table.remove(&old_page_id);
            self.metrics.evictions.inc();
            trace!(page_id = %old_page_id, frame_id, "evicted page");
        }
        frame.reset();
    }

    /// Drop `page_id` from the pool and deallocate it on backing store.
    ///
    /// Fails (returns `false`) only when the page is resident and pinned;
    /// a page that was never resident still gets its deallocation issued.
    pub fn delete_page(&self, page_id: PageId) -> bool {
        let mut tables = self.tables.lock();

        if let Some(&frame_id) = tables.page_table.get(&page_id) {
            let frame = &self.frames[frame_id];
            if frame.pin_count() > 0 {
                return false;
            }
            tables.page_table.remove(&page_id);
            self.replacer
                .lock()
                .set_evictable(frame_id, false)
                .expect("resident frame id within pool bounds");
            frame.reset();
            tables.free_list.push_back(frame_id);
            debug!(%page_id, frame_id, "page deleted from pool");
        }

        if let Err(e) = self.scheduler.deallocate_page(page_id) {
            fatal_io(page_id, e);
        }
        true
    }

    /// Flush `page_id` if it is resident, under its write latch.
    /// Returns `false` when the page is not resident; a clean resident
    /// page is a successful no-op.
    pub fn flush_page(&self, page_id: PageId) -> bool {
        let frame = {
            let tables = self.tables.lock();
            match tables.page_table.get(&page_id) {
                Some(&frame_id) => Arc::clone(&self.frames[frame_id]),
                None => return false,
            }
        };

        let buf = frame.latch().write();
        if !frame.is_dirty() {
            return true;
        }
        let data = Bytes::copy_from_slice(&buf[..]);
        if let Err(e) = self.scheduler.write_page(page_id, data) {
            fatal_io(page_id, e);
        }
        frame.clear_dirty();
        self.metrics.flushes.inc();
        true
    }

    /// Flush `page_id` without taking its write latch. The caller
    /// asserts no concurrent writer; the buffer is still viewed under
    /// the shared latch.
    pub fn flush_page_unsafe(&self, page_id: PageId) -> bool {
        let tables = self.tables.lock();
        let Some(&frame_id) = tables.page_table.get(&page_id) else {
            return false;
        };
        let frame = &self.frames[frame_id];
        if !frame.is_dirty() {
            return true;
        }
        let data = {
            let buf = frame.latch().read();
            Bytes::copy_from_slice(&buf[..])
        };
        if let Err(e) = self.scheduler.write_page(page_id, data) {
            fatal_io(page_id, e);
        }
        frame.clear_dirty();
        self.metrics.flushes.inc();
        true
    }

    /// Flush every resident page. The page table is snapshotted under the
    /// pool latch; each flush then runs under its own frame write latch
    /// with no global latch held across I/O.
    pub fn flush_all_pages(&self) {
        let targets: Vec<(PageId, Arc<FrameHeader>)> = {
            let tables = self.tables.lock();
            tables
                .page_table
                .iter()
                .map(|(&page_id, &frame_id)| (page_id, Arc::clone(&self.frames[frame_id])))
                .collect()
        };

        for (page_id, frame) in targets {
            let buf = frame.latch().write();
            if !frame.is_dirty() {
                continue;
            }
            let data = Bytes::copy_from_slice(&buf[..]);
            if let Err(e) = self.scheduler.write_page(page_id, data) {
                fatal_io(page_id, e);
            }
            frame.clear_dirty();
            self.metrics.flushes.inc();
        }
    }

    /// Pin count of a resident page, `None` otherwise.
    pub fn get_pin_count(&self, page_id: PageId) -> Option<u32> {
        let tables = self.tables.lock();
        tables
            .page_table
            .get(&page_id)
            .map(|&frame_id| self.frames[frame_id].pin_count())
    }

    /// Snapshot of pool occupancy and activity counters.
    pub fn stats(&self) -> BufferPoolStats {
        let resident_pages = self.tables.lock().page_table.len();
        let dirty_pages = self.frames.iter().filter(|f| f.is_dirty()).count();

        BufferPoolStats {
            total_frames: self.num_frames,
            resident_pages,
            dirty_pages,
            hits: self.metrics.hits.get(),
            misses: self.metrics.misses.get(),
            evictions: self.metrics.evictions.get(),
            flushes: self.metrics.flushes.get(),
        }
    }
}

impl Drop for BufferPoolManager {
    fn drop(&mut self) {
        if self.flush_on_drop {
            self.flush_all_pages();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn create_pool(num_frames: usize, k_dist: usize) -> (BufferPoolManager, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let disk = Arc::new(DiskManager::new(dir.path().join("test.db")).unwrap());
        (BufferPoolManager::new(num_frames, disk, k_dist), dir)
    }

    #[test]
    fn test_new_page_ids_are_monotonic() {
        let (pool, _dir) = create_pool(4, 2);
        assert_eq!(pool.new_page(), PageId(0));
        assert_eq!(pool.new_page(), PageId(1));
        assert_eq!(pool.new_page(), PageId(2));
    }

    #[test]
    fn test_size() {
        let (pool, _dir) = create_pool(7, 2);
        assert_eq!(pool.size(), 7);
    }

    #[test]
    fn test_fresh_page_reads_as_zeroes() {
        let (pool, _dir) = create_pool(4, 2);
        let pid = pool.new_page();
        let guard = pool.checked_read_page(pid, AccessType::Lookup).unwrap();
        assert!(guard.data().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_hit_and_miss_counters() {
        let (pool, _dir) = create_pool(4, 2);
        let pid = pool.new_page();

        drop(pool.checked_read_page(pid, AccessType::Lookup).unwrap());
        drop(pool.checked_read_page(pid, AccessType::Lookup).unwrap());

        let stats = pool.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.resident_pages, 1);
    }

    #[test]
    fn test_get_pin_count() {
        let (pool, _dir) = create_pool(4, 2);
        let pid = pool.new_page();
        assert_eq!(pool.get_pin_count(pid), None);

        let guard = pool.checked_read_page(pid, AccessType::Lookup).unwrap();
        assert_eq!(pool.get_pin_count(pid), Some(1));
        drop(guard);
        assert_eq!(pool.get_pin_count(pid), Some(0));
    }

    #[test]
    fn test_flush_not_resident_returns_false() {
        let (pool, _dir) = create_pool(4, 2);
        assert!(!pool.flush_page(PageId(99)));
        assert!(!pool.flush_page_unsafe(PageId(99)));
    }

    #[test]
    fn test_flush_clean_page_is_noop() {
        let (pool, _dir) = create_pool(4, 2);
        let pid = pool.new_page();
        drop(pool.checked_read_page(pid, AccessType::Lookup).unwrap());

        assert!(pool.flush_page(pid));
        assert!(pool.flush_page(pid));
        assert_eq!(pool.stats().flushes, 0);
    }

    #[test]
    fn test_with_config() {
        let dir = tempdir().unwrap();
        let config = StorageConfig {
            data_dir: dir.path().join("data"),
            buffer_pool_frames: 8,
            replacer_k: 2,
            flush_on_drop: true,
        };
        let pool = BufferPoolManager::with_config(&config).unwrap();
        assert_eq!(pool.size(), 8);
    }

    #[test]
    fn test_with_config_rejects_invalid() {
        let dir = tempdir().unwrap();
        let config = StorageConfig {
            data_dir: dir.path().to_path_buf(),
            buffer_pool_frames: 0,
            replacer_k: 2,
            flush_on_drop: false,
        };
        assert!(matches!(
            BufferPoolManager::with_config(&config),
            Err(Error::Config(_))
        ));
    }
}
