//! Core engine modules - cache accounting, frame cache, worker pool
//!
//! These modules form the caching engine, independent of any decode backend.

pub mod cache_man;
pub mod frame_cache;
pub mod workers;

// Re-exports for convenience
pub use cache_man::CacheManager;
pub use frame_cache::{CacheStats, FrameCache, FrameIndex, SequenceId};
pub use workers::Workers;
