//! LRU-K replacement policy.
//!
//! Tracks per-frame access history and selects eviction victims by
//! backward K-distance (O'Neil, O'Neil & Weikum): the victim is the
//! evictable frame whose K-th most recent access lies furthest in the
//! past. Frames with fewer than K recorded accesses have infinite
//! backward distance and are evicted first, oldest first access winning.

use std::collections::{BTreeMap, VecDeque};

use tempest_common::types::FrameId;
use tempest_common::{Error, Result};

use crate::AccessType;

/// Per-frame replacement state.
#[derive(Debug)]
struct LruKNode {
    /// Up to K most recent access timestamps, oldest at the front.
    history: VecDeque<u64>,
    evictable: bool,
}

/// LRU-K eviction policy over a fixed range of frame ids.
///
/// The replacer carries no lock of its own; the buffer pool wraps it in a
/// mutex, which guard drops reach through the pool latch.
pub struct LruKReplacer {
    nodes: BTreeMap<FrameId, LruKNode>,
    current_timestamp: u64,
    num_frames: usize,
    k: usize,
    evictable_count: usize,
}

impl LruKReplacer {
    pub fn new(num_frames: usize, k: usize) -> Self {
        debug_assert!(k >= 1, "LRU-K requires k >= 1");
        Self {
            nodes: BTreeMap::new(),
            current_timestamp: 0,
            num_frames,
            k,
            evictable_count: 0,
        }
    }

    fn check_frame_id(&self, frame_id: FrameId) -> Result<()> {
        if frame_id >= self.num_frames {
            return Err(Error::invalid_argument(format!(
                "frame id {} out of range (pool has {} frames)",
                frame_id, self.num_frames
            )));
        }
        Ok(())
    }

    /// Record an access to `frame_id` at the next timestamp.
    ///
    /// Frames seen for the first time start non-evictable. `access_type`
    /// is accepted but does not influence victim selection.
    pub fn record_access(&mut self, frame_id: FrameId, _access_type: AccessType) -> Result<()> {
        self.check_frame_id(frame_id)?;

        self.current_timestamp += 1;
        let timestamp = self.current_timestamp;
        let k = self.k;

        let node = self.nodes.entry(frame_id).or_insert_with(|| LruKNode {
            history: VecDeque::with_capacity(k),
            evictable: false,
        });
        node.history.push_back(timestamp);
        while node.history.len() > k {
            node.history.pop_front();
        }
        Ok(())
    }

    /// Toggle whether `frame_id` may be chosen as an eviction victim.
    ///
    /// Untracked frames are a no-op; the evictable count moves by one
    /// exactly when the value actually changes.
    pub fn set_evictable(&mut self, frame_id: FrameId, evictable: bool) -> Result<()> {
        self.check_frame_id(frame_id)?;

        let Some(node) = self.nodes.get_mut(&frame_id) else {
            return Ok(());
        };
        if node.evictable != evictable {
            node.evictable = evictable;
            if evictable {
                self.evictable_count += 1;
            } else {
                self.evictable_count -= 1;
            }
        }
        Ok(())
    }

    /// Select, remove, and return the eviction victim, or `None` when no
    /// frame is evictable.
    ///
    /// Candidates are scanned in ascending frame-id order with strict
    /// comparisons, so ties on the oldest timestamp resolve to the
    /// smallest frame id.
    pub fn evict(&mut self) -> Option<FrameId> {
        if self.evictable_count == 0 {
            return None;
        }

        // (frame id, has a full K history, oldest recorded timestamp)
        let mut victim: Option<(FrameId, bool, u64)> = None;
        for (&frame_id, node) in &self.nodes {
            if !node.evictable {
                continue;
            }
            let Some(&oldest) = node.history.front() else {
                continue;
            };
            let full = node.history.len() >= self.k;
            let better = match victim {
                None => true,
                Some((_, victim_full, victim_oldest)) => match (full, victim_full) {
                    // infinite backward distance beats any finite one
                    (false, true) => true,
                    (true, false) => false,
                    // within a class, the older first access wins
                    _ => oldest < victim_oldest,
                },
            };
            if better {
                victim = Some((frame_id, full, oldest));
            }
        }

        let (frame_id, _, _) = victim?;
        self.nodes.remove(&frame_id);
        self.evictable_count -= 1;
        Some(frame_id)
    }

    /// Drop all replacement state for `frame_id`, regardless of its
    /// backward distance. Untracked frames are a no-op; removing a
    /// tracked non-evictable frame is a caller error.
    pub fn remove(&mut self, frame_id: FrameId) -> Result<()> {
        let Some(node) = self.nodes.get(&frame_id) else {
            return Ok(());
        };
        if !node.evictable {
            return Err(Error::invalid_argument(format!(
                "cannot remove non-evictable frame {frame_id}"
            )));
        }
        self.nodes.remove(&frame_id);
        self.evictable_count -= 1;
        Ok(())
    }

    /// Number of frames currently marked evictable.
    pub fn size(&self) -> usize {
        self.evictable_count
    }
}
