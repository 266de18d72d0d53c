//! Global LRU frame cache shared across sequences
//!
//! Structure: HashMap<SequenceId, HashMap<FrameIndex, slot>>
//! - Outer map: sequence -> frames
//! - Inner map: frame index -> resident frame + tracked byte size
//! - One IndexSet over (sequence, index) keys holds the global recency order
//!   (front = least recent, back = most recent), so O(1) clear per sequence
//!   and cross-sequence fairness under eviction come for free.
//!
//! The map and the recency order live behind ONE mutex: a lookup and its
//! recency re-splice are a single atomic step, and the order can never hold
//! a key the map does not. The lock covers map/order mutation only, never
//! decode I/O.
//!
//! # Admission
//!
//! The cache is bounded by a byte budget (CacheManager). Admission evicts
//! from the least-recent end until the incoming frame fits, BEFORE inserting,
//! so the resident total never exceeds the budget. A frame larger than the
//! whole budget is rejected outright and logged; evicting everything else
//! would not help.
//!
//! # Partial Frames
//!
//! Entries are `VideoFrame` handles whose payload grows as more mip levels
//! land. Re-adding an existing key re-accounts bytes against the previously
//! tracked size (the handle may be the same frame, mutated in place).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexSet;
use log::{debug, warn};
use uuid::Uuid;

use crate::core::cache_man::CacheManager;
use crate::frame::{MipMask, VideoFrame};

/// Opaque identifier of one image sequence
pub type SequenceId = Uuid;

/// Integer position within a sequence
pub type FrameIndex = usize;

/// Cache hit/miss statistics
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStats {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.hits() + self.misses();
        if total == 0 {
            0.0
        } else {
            self.hits() as f64 / total as f64
        }
    }
}

/// Entry in the global recency order
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
struct CacheKey {
    seq: SequenceId,
    idx: FrameIndex,
}

/// Resident frame plus the byte size it was admitted with.
///
/// Tracked separately from `frame.mem()` because the payload may have grown
/// in place since admission; accounting always frees what was charged.
#[derive(Debug)]
struct CacheSlot {
    frame: VideoFrame,
    bytes: usize,
}

/// Map and recency order, mutated together under one lock
#[derive(Debug, Default)]
struct CacheInner {
    /// Nested cache: sequence -> (frame index -> slot)
    frames: HashMap<SequenceId, HashMap<FrameIndex, CacheSlot>>,
    /// Global recency order: front = least recent, back = most recent
    lru: IndexSet<CacheKey>,
}

/// Byte-bounded global LRU cache keyed by (sequence, frame index).
#[derive(Debug)]
pub struct FrameCache {
    inner: Mutex<CacheInner>,
    /// Shared byte-budget accountant
    cache_manager: Arc<CacheManager>,
    /// Hit/miss statistics
    stats: Arc<CacheStats>,
}

impl FrameCache {
    pub fn new(manager: Arc<CacheManager>) -> Self {
        debug!(
            "FrameCache created: budget={} MB",
            manager.capacity() / 1024 / 1024
        );
        Self {
            inner: Mutex::new(CacheInner::default()),
            cache_manager: manager,
            stats: Arc::new(CacheStats::default()),
        }
    }

    /// Insert or replace a frame.
    ///
    /// Evicts least-recently-used entries (across ALL sequences) until the
    /// frame fits, then inserts it as most-recently-used. A frame larger than
    /// the total budget is rejected and the call is a no-op.
    ///
    /// Returns true if the frame is resident afterwards.
    pub fn add_frame(&self, seq: SequenceId, idx: FrameIndex, frame: VideoFrame) -> bool {
        let frame_size = frame.mem();
        let capacity = self.cache_manager.capacity();

        if frame_size > capacity {
            warn!(
                "Frame {}:{} rejected: {} bytes exceeds total cache budget of {} bytes",
                seq, idx, frame_size, capacity
            );
            return false;
        }

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        // Re-admission of an existing key: free what was charged before.
        // The handle may be the very frame we're inserting, grown in place.
        if let Some(old) = inner.frames.get_mut(&seq).and_then(|f| f.remove(&idx)) {
            self.cache_manager.free_memory(old.bytes);
            inner.lru.shift_remove(&CacheKey { seq, idx });
        }

        // Evict before insert so the budget invariant holds at every return
        while self.cache_manager.available() < frame_size {
            if !Self::evict_locked(&mut inner, &self.cache_manager) {
                break;
            }
        }

        inner.frames.entry(seq).or_default().insert(
            idx,
            CacheSlot {
                frame,
                bytes: frame_size,
            },
        );
        inner.lru.insert(CacheKey { seq, idx });
        self.cache_manager.add_memory(frame_size);

        debug!("Cached frame {}:{} ({} bytes)", seq, idx, frame_size);
        true
    }

    /// Look up a frame and mark it most-recently-used.
    ///
    /// Lookup and re-splice happen under the same lock, so a concurrent
    /// eviction can never leave the touched key dangling in the order.
    pub fn find_and_touch(&self, seq: SequenceId, idx: FrameIndex) -> Option<VideoFrame> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        let result = inner
            .frames
            .get(&seq)
            .and_then(|frames| frames.get(&idx))
            .map(|slot| slot.frame.clone());

        if result.is_some() {
            self.stats.record_hit();
            let key = CacheKey { seq, idx };
            inner.lru.shift_remove(&key);
            inner.lru.insert(key);
        } else {
            self.stats.record_miss();
        }

        result
    }

    /// Look up a frame without disturbing recency (scheduler-side queries)
    pub fn peek(&self, seq: SequenceId, idx: FrameIndex) -> Option<VideoFrame> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .frames
            .get(&seq)
            .and_then(|frames| frames.get(&idx))
            .map(|slot| slot.frame.clone())
    }

    /// Mip-loaded bitmask of a resident frame, without touching the LRU order
    pub fn mip_mask(&self, seq: SequenceId, idx: FrameIndex) -> Option<MipMask> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .frames
            .get(&seq)
            .and_then(|frames| frames.get(&idx))
            .map(|slot| slot.frame.mip_mask())
    }

    /// Check residency without touching the LRU order
    pub fn contains(&self, seq: SequenceId, idx: FrameIndex) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .frames
            .get(&seq)
            .map(|frames| frames.contains_key(&idx))
            .unwrap_or(false)
    }

    /// All resident frame indices for one sequence, most-recently-used first.
    pub fn get_indices(&self, seq: SequenceId) -> Vec<FrameIndex> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .lru
            .iter()
            .rev()
            .filter(|k| k.seq == seq)
            .map(|k| k.idx)
            .collect()
    }

    /// Evict the least-recent entry backed by the map. Returns false only
    /// when nothing evictable remains.
    fn evict_locked(inner: &mut CacheInner, manager: &CacheManager) -> bool {
        while let Some(key) = inner.lru.shift_remove_index(0) {
            #[allow(clippy::collapsible_if)]
            if let Some(frames) = inner.frames.get_mut(&key.seq) {
                if let Some(evicted) = frames.remove(&key.idx) {
                    manager.free_memory(evicted.bytes);
                    if frames.is_empty() {
                        inner.frames.remove(&key.seq);
                    }
                    debug!(
                        "LRU evicted: {}:{} (freed {} bytes)",
                        key.seq, key.idx, evicted.bytes
                    );
                    return true;
                }
            }
            // Order-only key with no map entry: drop it and keep going
        }

        false
    }

    /// Drop all frames of one sequence - O(1) on the map level
    pub fn clear_sequence(&self, seq: SequenceId) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(frames) = inner.frames.remove(&seq) {
            let mut total_freed = 0usize;
            for slot in frames.values() {
                self.cache_manager.free_memory(slot.bytes);
                total_freed += slot.bytes;
            }
            inner.lru.retain(|k| k.seq != seq);

            debug!(
                "Cleared sequence {}: {} frames, {} bytes freed",
                seq,
                frames.len(),
                total_freed
            );
        }
    }

    /// Drop everything
    pub fn clear_all(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        for frames in inner.frames.values() {
            for slot in frames.values() {
                self.cache_manager.free_memory(slot.bytes);
            }
        }
        inner.frames.clear();
        inner.lru.clear();

        debug!("Cleared entire frame cache");
    }

    /// Total number of resident frames across all sequences
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.frames.values().map(|frames| frames.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shared statistics handle
    pub fn stats(&self) -> Arc<CacheStats> {
        Arc::clone(&self.stats)
    }

    /// Shared budget accountant
    pub fn manager(&self) -> Arc<CacheManager> {
        Arc::clone(&self.cache_manager)
    }
}
