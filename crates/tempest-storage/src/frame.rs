//! Buffer frames: fixed-size page slots with latch, pin count, and dirty
//! bit.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use tempest_common::types::{FrameId, PageId};

use crate::PAGE_SIZE;

/// A fixed-size in-memory slot that may host one page.
///
/// The page buffer lives inside the reader/writer latch, so holding the
/// latch is the only way to reach the bytes. The bound page id doubles as
/// the frame-to-page reverse lookup used during eviction;
/// `PageId::INVALID` marks an unbound frame.
pub struct FrameHeader {
    frame_id: FrameId,
    /// Page currently bound to this frame, `PageId::INVALID` when free.
    page_id: AtomicU64,
    /// Number of live guards holding this frame resident.
    pin_count: AtomicU32,
    /// Resident bytes differ from backing store.
    dirty: AtomicBool,
    /// Page buffer of exactly `PAGE_SIZE` bytes, behind the rwlatch.
    data: Arc<RwLock<Box<[u8]>>>,
}

impl FrameHeader {
    pub fn new(frame_id: FrameId) -> Self {
        Self {
            frame_id,
            page_id: AtomicU64::new(PageId::INVALID.0),
            pin_count: AtomicU32::new(0),
            dirty: AtomicBool::new(false),
            data: Arc::new(RwLock::new(vec![0u8; PAGE_SIZE].into_boxed_slice())),
        }
    }

    #[inline]
    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    /// Page currently bound to this frame (`PageId::INVALID` when none).
    #[inline]
    pub fn page_id(&self) -> PageId {
        PageId(self.page_id.load(Ordering::Acquire))
    }

    pub(crate) fn bind(&self, page_id: PageId) {
        self.page_id.store(page_id.0, Ordering::Release);
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub(crate) fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    #[inline]
    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    /// Take a pin. Returns the pre-increment count.
    pub(crate) fn pin(&self) -> u32 {
        self.pin_count.fetch_add(1, Ordering::AcqRel)
    }

    /// Release a pin. Returns the pre-decrement count.
    pub(crate) fn unpin(&self) -> u32 {
        let prev = self.pin_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unpin on a frame with pin count 0");
        prev
    }

    /// The latch guarding the page buffer.
    pub(crate) fn latch(&self) -> &Arc<RwLock<Box<[u8]>>> {
        &self.data
    }

    /// Return the frame to its unbound state: buffer zeroed, pin and
    /// dirty cleared, page id invalidated.
    ///
    /// Only called while the frame is unreachable from the page table,
    /// under the pool latch.
    pub(crate) fn reset(&self) {
        self.data.write().fill(0);
        self.pin_count.store(0, Ordering::Release);
        self.dirty.store(false, Ordering::Release);
        self.page_id.store(PageId::INVALID.0, Ordering::Release);
    }
}
