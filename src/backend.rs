//! Decode backend contract
//!
//! **Why**: The scheduler never touches codecs. All frame I/O goes through
//! this narrow trait so EXR/DPX/test backends are interchangeable and loader
//! logic stays deterministic under test.
//!
//! **Used by**: sequence probe (`frame_info`), LoaderWork (`read_frame`),
//! Loader (`cancel_frame`, `on_tick`).

use std::path::Path;

use crate::frame::VideoFrame;
use crate::miptile::TileSelection;

/// Per-frame metadata returned by the backend probe
#[derive(Debug, Clone, PartialEq)]
pub struct FrameInfo {
    /// Pixel dimensions at mip 0
    pub dim: (u32, u32),
    /// Decoded size of one full frame in bytes
    pub uncompressed_size: usize,
    /// Native frame rate encoded in the file (if any)
    pub frame_rate: f32,
    /// Human-readable format name ("exr", "dpx", ...)
    pub format_name: String,
}

/// Errors fatal to session initialization.
///
/// Decode failures are NOT represented here: a failed `read_frame` is local
/// to one frame and surfaces as `false` so the frame stays non-resident and
/// gets retried opportunistically.
#[derive(Debug)]
pub enum LoaderError {
    /// Sequence directory contains no frames
    EmptySequence(String),
    /// First frame probed to a zero-byte payload
    ZeroSizedFrame(String),
    /// A mip directory exists but its dimensions/file count don't match level 0
    MipLevelMismatch(String),
    /// Backend could not read the first frame's header
    Probe(String),
    /// Filesystem error while scanning the sequence
    Io(String),
}

impl std::fmt::Display for LoaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoaderError::EmptySequence(s) => write!(f, "Empty sequence: {}", s),
            LoaderError::ZeroSizedFrame(s) => write!(f, "Zero-sized frame: {}", s),
            LoaderError::MipLevelMismatch(s) => write!(f, "Mip level mismatch: {}", s),
            LoaderError::Probe(s) => write!(f, "Probe error: {}", s),
            LoaderError::Io(s) => write!(f, "I/O error: {}", s),
        }
    }
}

impl std::error::Error for LoaderError {}

/// Frame decode backend.
///
/// Implementations are shared across worker threads; `read_frame` is the only
/// method expected to block on I/O. `cancel_frame` is a best-effort flag: an
/// already-running decode is not preempted, chunked readers are expected to
/// check it between chunks and bail out early.
pub trait DecodeBackend: Send + Sync {
    /// Probe one file for dimensions / size / frame rate
    fn frame_info(&self, path: &Path) -> Result<FrameInfo, LoaderError>;

    /// Decode `mip_level` of the frame at `path`, restricted to `tiles`,
    /// into `frame` (in-out: may already hold other mip levels).
    ///
    /// Returns false on decode failure; the frame is left non-resident.
    fn read_frame(
        &self,
        path: &Path,
        frame_index: usize,
        mip_level: u32,
        tiles: &TileSelection,
        frame: &VideoFrame,
    ) -> bool;

    /// Best-effort cancellation of an in-flight frame
    fn cancel_frame(&self, frame_index: usize);

    /// Optional hint: up to `max_in_flight` frames of `info` shape will be
    /// decoded concurrently. Backends with buffer pools pre-warm here.
    fn pre_allocate_pool(&self, _max_in_flight: usize, _info: &FrameInfo) {}

    /// Housekeeping hook, called once per loader update
    fn on_tick(&self) {}
}
