//! Cache byte-budget accounting with epoch-based work cancellation
//!
//! **Why**: Multiple loader sessions share one frame cache; they need one
//! coordinated byte budget to prevent OOM. The epoch mechanism cancels stale
//! decode jobs wholesale when a session is torn down or the playhead jumps.
//!
//! **Used by**: FrameCache (admission/eviction decisions), Workers (epoch
//! check on job execution), Loader (job stamping).

use log::{debug, info};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use sysinfo::System;

/// Shared byte-budget accountant for all frame caches bound to it.
///
/// Usage is tracked atomically; the limit itself is atomic so it can be
/// re-derived from system memory at runtime without exclusive access.
#[derive(Debug)]
pub struct CacheManager {
    /// Atomically tracked memory usage (bytes)
    memory_usage: Arc<AtomicUsize>,
    /// Maximum allowed memory (bytes)
    max_memory_bytes: AtomicUsize,
    /// Epoch counter for cancelling stale decode jobs
    current_epoch: Arc<AtomicU64>,
}

impl CacheManager {
    /// Create cache manager with a limit derived from available memory
    ///
    /// # Arguments
    ///
    /// * `mem_fraction` - Fraction of available memory (0.0-1.0)
    /// * `reserve_gb` - Memory reserved for the rest of the system (GB)
    pub fn new(mem_fraction: f64, reserve_gb: f64) -> Self {
        let mut sys = System::new_all();
        sys.refresh_memory();

        let available = sys.available_memory() as usize;
        let reserve = (reserve_gb * 1024.0 * 1024.0 * 1024.0) as usize;
        let usable = available.saturating_sub(reserve);
        let max_memory_bytes = (usable as f64 * mem_fraction) as usize;

        info!(
            "CacheManager init: available={} MB, reserve={} MB, limit={} MB ({}%)",
            available / 1024 / 1024,
            reserve / 1024 / 1024,
            max_memory_bytes / 1024 / 1024,
            (mem_fraction * 100.0) as u32
        );

        Self::from_limit(max_memory_bytes)
    }

    /// Create cache manager with an explicit byte limit (tests, fixed configs)
    pub fn with_capacity(max_memory_bytes: usize) -> Self {
        debug!("CacheManager init: fixed limit={} bytes", max_memory_bytes);
        Self::from_limit(max_memory_bytes)
    }

    fn from_limit(max_memory_bytes: usize) -> Self {
        Self {
            memory_usage: Arc::new(AtomicUsize::new(0)),
            max_memory_bytes: AtomicUsize::new(max_memory_bytes),
            current_epoch: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Increment epoch and return new value.
    ///
    /// Pending decode jobs stamped with an older epoch are skipped by the
    /// worker pool when they reach execution.
    pub fn increment_epoch(&self) -> u64 {
        let new_epoch = self.current_epoch.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("Epoch incremented: {}", new_epoch);
        new_epoch
    }

    /// Get current epoch
    pub fn current_epoch(&self) -> u64 {
        self.current_epoch.load(Ordering::Relaxed)
    }

    /// Get shared epoch counter (for Workers)
    pub fn epoch_ref(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.current_epoch)
    }

    /// Configured byte limit
    pub fn capacity(&self) -> usize {
        self.max_memory_bytes.load(Ordering::Relaxed)
    }

    /// Bytes still admittable before hitting the limit
    pub fn available(&self) -> usize {
        self.capacity()
            .saturating_sub(self.memory_usage.load(Ordering::Relaxed))
    }

    /// Check if memory limit is exceeded
    pub fn check_memory_limit(&self) -> bool {
        self.memory_usage.load(Ordering::Relaxed) > self.max_memory_bytes.load(Ordering::Relaxed)
    }

    /// Get memory statistics (usage, limit)
    pub fn mem(&self) -> (usize, usize) {
        let usage = self.memory_usage.load(Ordering::Relaxed);
        let limit = self.max_memory_bytes.load(Ordering::Relaxed);
        (usage, limit)
    }

    /// Add memory usage
    pub fn add_memory(&self, bytes: usize) {
        let new_usage = self.memory_usage.fetch_add(bytes, Ordering::Relaxed) + bytes;
        let limit = self.max_memory_bytes.load(Ordering::Relaxed);
        if new_usage > limit {
            debug!(
                "Memory limit exceeded: {} MB / {} MB",
                new_usage / 1024 / 1024,
                limit / 1024 / 1024
            );
        }
    }

    /// Free memory usage (saturating subtraction to prevent underflow)
    pub fn free_memory(&self, bytes: usize) {
        loop {
            let current = self.memory_usage.load(Ordering::Relaxed);
            let new_val = current.saturating_sub(bytes);
            if self
                .memory_usage
                .compare_exchange_weak(current, new_val, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    /// Update memory limit from current system state
    pub fn set_memory_limit(&self, mem_fraction: f64, reserve_gb: f64) {
        let mut sys = System::new_all();
        sys.refresh_memory();

        let available = sys.available_memory() as usize;
        let reserve = (reserve_gb * 1024.0 * 1024.0 * 1024.0) as usize;
        let usable = available.saturating_sub(reserve);
        let new_limit = (usable as f64 * mem_fraction) as usize;
        self.max_memory_bytes.store(new_limit, Ordering::Relaxed);

        info!(
            "Memory limit updated: {} MB ({}%)",
            new_limit / 1024 / 1024,
            (mem_fraction * 100.0) as u32
        );
    }
}
