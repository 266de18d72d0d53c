//! One decode task
//!
//! A `LoaderWork` is handed from the scheduler to a pool worker, executed
//! against the backend exactly once, and reported back exactly once through
//! the loader's completion queue. Items are pooled and reused to avoid
//! allocation churn at playback rates.

use std::path::PathBuf;

use crate::backend::DecodeBackend;
use crate::frame::VideoFrame;
use crate::miptile::TileSelection;

/// One frame decode request: which frame, which mip level, which tiles,
/// and optionally an existing partial frame to augment in place.
#[derive(Debug, Default)]
pub struct LoaderWork {
    frame_index: usize,
    path: PathBuf,
    mip_level: u32,
    tiles: TileSelection,
    /// Partially-loaded frame to augment; None = build a fresh frame
    existing: Option<VideoFrame>,
    /// Mip-0 dimensions and format for fresh frames
    dim: (u32, u32),
    format: String,
}

impl LoaderWork {
    /// Arm a (fresh or recycled) work item for one decode
    #[allow(clippy::too_many_arguments)]
    pub fn prepare(
        &mut self,
        frame_index: usize,
        path: PathBuf,
        mip_level: u32,
        tiles: TileSelection,
        existing: Option<VideoFrame>,
        dim: (u32, u32),
        format: &str,
    ) {
        self.frame_index = frame_index;
        self.path = path;
        self.mip_level = mip_level;
        self.tiles = tiles;
        self.existing = existing;
        self.dim = dim;
        self.format = format.to_string();
    }

    pub fn frame_index(&self) -> usize {
        self.frame_index
    }

    pub fn mip_level(&self) -> u32 {
        self.mip_level
    }

    pub fn tiles(&self) -> &TileSelection {
        &self.tiles
    }

    /// Run the decode. Called on a pool worker; this is the only place the
    /// loader machinery blocks on I/O.
    ///
    /// Returns the (possibly augmented) frame on success, None on decode
    /// failure - the frame simply stays non-resident and is retried by a
    /// later update.
    pub fn execute(&mut self, backend: &dyn DecodeBackend) -> Option<VideoFrame> {
        let frame = self
            .existing
            .take()
            .unwrap_or_else(|| VideoFrame::new(self.dim.0, self.dim.1, &self.format));

        let ok = backend.read_frame(
            &self.path,
            self.frame_index,
            self.mip_level,
            &self.tiles,
            &frame,
        );

        if ok {
            frame.mark_mip_loaded(self.mip_level);
            Some(frame)
        } else {
            None
        }
    }

    /// Return the item to pooled state (drops the frame handle)
    pub fn reset(&mut self) {
        self.existing = None;
        self.path.clear();
        self.format.clear();
        self.tiles = TileSelection::EMPTY;
    }
}
