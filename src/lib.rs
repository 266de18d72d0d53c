//! PLATESTREAM - Streaming frame cache and prefetch scheduler for tiled,
//! mip-mapped image sequences.
//!
//! A [`Loader`] owns one playback session over an on-disk sequence, keeps a
//! prefetch window of decoded frames resident in a shared byte-bounded
//! [`FrameCache`], and narrows decode work to the visible tile/mip set
//! computed by [`MipTileInfo`] from registered render targets. Decoding is
//! delegated through the [`DecodeBackend`] trait so any image format can be
//! plugged in.

// Core engine (cache accounting, frame cache, worker pool)
pub mod core;

// Scheduler and its collaborators
pub mod backend;
pub mod frame;
pub mod loader;
pub mod miptile;
pub mod sequence;
pub mod timespan;

// Re-export commonly used types from core
pub use crate::core::cache_man::CacheManager;
pub use crate::core::frame_cache::{CacheStats, FrameCache, FrameIndex, SequenceId};
pub use crate::core::workers::Workers;

pub use backend::{DecodeBackend, FrameInfo, LoaderError};
pub use frame::{MipMask, VideoFrame, mip_mask_all};
pub use loader::{Loader, LoaderConfig, LoaderWork, SampleStatus};
pub use miptile::{
    CameraInfo, MipTileInfo, SequenceInfo, TargetStrategy, TilePlan, TileSelection,
};
pub use sequence::{MAX_MIP_LEVELS, SequenceSource};
pub use timespan::{TimeRange, frames_to_time_ranges};
