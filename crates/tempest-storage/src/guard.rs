//! Scoped page guards.
//!
//! A guard owns a frame latch, a pin, and the frame's non-evictable
//! status, and releases all three deterministically when dropped. Guards
//! are move-only; moving one transfers the pin and latch, and drop runs
//! exactly once.
//!
//! Drop order is load-bearing: the pin is released, then the frame latch,
//! and only then is the pool latch taken to flip evictability. Taking the
//! pool latch while still holding the frame latch would invert the
//! acquisition path's lock order.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock};

use tempest_common::types::PageId;

use crate::frame::FrameHeader;
use crate::pool::{fatal_io, PageTables};
use crate::replacer::LruKReplacer;
use crate::scheduler::DiskScheduler;

type ReadLatch = ArcRwLockReadGuard<RawRwLock, Box<[u8]>>;
type WriteLatch = ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>;

/// Release the pin taken at acquisition and, when this was the last pin,
/// mark the frame evictable again.
///
/// The pin count and page binding are rechecked under the pool latch:
/// between our pin release and taking the latch, the frame may have been
/// deleted (unbound, on the free list) or re-acquired by another thread,
/// and neither may be flagged evictable.
fn release(
    frame: &FrameHeader,
    replacer: &Mutex<LruKReplacer>,
    pool_latch: &Mutex<PageTables>,
    prev_pins: u32,
) {
    if prev_pins != 1 {
        return;
    }
    let _tables = pool_latch.lock();
    if frame.pin_count() == 0 && frame.page_id().is_valid() {
        replacer
            .lock()
            .set_evictable(frame.frame_id(), true)
            .expect("frame id within pool bounds");
    }
}

fn flush_frame(page_id: PageId, frame: &FrameHeader, scheduler: &DiskScheduler, data: &[u8]) {
    if !frame.is_dirty() {
        return;
    }
    if let Err(e) = scheduler.write_page(page_id, Bytes::copy_from_slice(data)) {
        fatal_io(page_id, e);
    }
    frame.clear_dirty();
}

/// Shared access to one resident page.
///
/// Holds the frame's latch in read mode, so any number of readers may
/// coexist while writers are excluded.
pub struct ReadPageGuard {
    page_id: PageId,
    frame: Arc<FrameHeader>,
    replacer: Arc<Mutex<LruKReplacer>>,
    pool_latch: Arc<Mutex<PageTables>>,
    scheduler: Arc<DiskScheduler>,
    latch: Option<ReadLatch>,
}

impl ReadPageGuard {
    /// The pool has already pinned the frame and marked it non-evictable
    /// under its latch; all that remains is taking the frame latch.
    pub(crate) fn acquire(
        page_id: PageId,
        frame: Arc<FrameHeader>,
        replacer: Arc<Mutex<LruKReplacer>>,
        pool_latch: Arc<Mutex<PageTables>>,
        scheduler: Arc<DiskScheduler>,
    ) -> Self {
        let latch = frame.latch().read_arc();
        Self {
            page_id,
            frame,
            replacer,
            pool_latch,
            scheduler,
            latch: Some(latch),
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn data(&self) -> &[u8] {
        self.latch
            .as_ref()
            .expect("latch held for the guard's lifetime")
    }

    pub fn is_dirty(&self) -> bool {
        self.frame.is_dirty()
    }

    /// Synchronously write this page out and clear its dirty flag.
    ///
    /// Safe under the shared latch: writers are excluded, so the bytes
    /// cannot change mid-write.
    pub fn flush(&self) {
        flush_frame(self.page_id, &self.frame, &self.scheduler, self.data());
    }
}

impl Deref for ReadPageGuard {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data()
    }
}

impl Drop for ReadPageGuard {
    fn drop(&mut self) {
        let prev = self.frame.unpin();
        self.latch.take();
        release(&self.frame, &self.replacer, &self.pool_latch, prev);
    }
}

/// Exclusive access to one resident page.
///
/// Holds the frame's latch in write mode. Obtaining write access is
/// modeled as a mutation: the frame is marked dirty at acquisition.
pub struct WritePageGuard {
    page_id: PageId,
    frame: Arc<FrameHeader>,
    replacer: Arc<Mutex<LruKReplacer>>,
    pool_latch: Arc<Mutex<PageTables>>,
    scheduler: Arc<DiskScheduler>,
    latch: Option<WriteLatch>,
}

impl WritePageGuard {
    pub(crate) fn acquire(
        page_id: PageId,
        frame: Arc<FrameHeader>,
        replacer: Arc<Mutex<LruKReplacer>>,
        pool_latch: Arc<Mutex<PageTables>>,
        scheduler: Arc<DiskScheduler>,
    ) -> Self {
        let latch = frame.latch().write_arc();
        frame.mark_dirty();
        Self {
            page_id,
            frame,
            replacer,
            pool_latch,
            scheduler,
            latch: Some(latch),
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn data(&self) -> &[u8] {
        self.latch
            .as_ref()
            .expect("latch held for the guard's lifetime")
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.latch
            .as_mut()
            .expect("latch held for the guard's lifetime")
    }

    pub fn is_dirty(&self) -> bool {
        self.frame.is_dirty()
    }

    /// Synchronously write this page out and clear its dirty flag.
    pub fn flush(&self) {
        flush_frame(self.page_id, &self.frame, &self.scheduler, self.data());
    }
}

impl Deref for WritePageGuard {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data()
    }
}

impl DerefMut for WritePageGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.data_mut()
    }
}

impl Drop for WritePageGuard {
    fn drop(&mut self) {
        let prev = self.frame.unpin();
        self.latch.take();
        release(&self.frame, &self.replacer, &self.pool_latch, prev);
    }
}
