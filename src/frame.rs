//! Video frame payload with mip-level completeness tracking
//!
//! **Why**: A frame may be only partially resident (a subset of mip levels /
//! tiles). The payload stays opaque to the scheduler; completeness is tracked
//! as a mip-loaded bitmask that only ever grows until the frame is evicted.
//!
//! **Used by**: FrameCache (residency + byte accounting), LoaderWork (in-place
//! augmentation on decode workers), consumers (read access).
//!
//! # Sharing Model
//!
//! `VideoFrame` is a cheap-clone handle (`Arc<Mutex<..>>`). The cache, the
//! scheduler and a decode worker can all hold the same frame; a worker that
//! augments it with another mip level mutates the shared payload in place and
//! the cache re-accounts bytes when the completed work is merged back.

use std::sync::{Arc, Mutex};

/// Bitmask over mip levels; bit N set = level N is loaded for the frame's
/// current tile selection.
pub type MipMask = u32;

/// Mask with the lowest `count` mip bits set.
pub fn mip_mask_all(count: u32) -> MipMask {
    if count >= 32 {
        MipMask::MAX
    } else {
        (1u32 << count) - 1
    }
}

/// Internal frame data protected by one mutex
#[derive(Debug)]
struct FrameData {
    /// Opaque decoded payload (pixel format is the backend's business)
    buffer: Vec<u8>,
    width: u32,
    height: u32,
    /// Bit N set = mip level N loaded. Grows monotonically.
    mip_mask: MipMask,
    format: String,
}

/// One decoded (possibly partial) frame of an image sequence.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    data: Arc<Mutex<FrameData>>,
}

impl VideoFrame {
    /// Create an empty frame shell (no mip levels loaded yet)
    pub fn new(width: u32, height: u32, format: &str) -> Self {
        let data = FrameData {
            buffer: Vec::new(),
            width,
            height,
            mip_mask: 0,
            format: format.to_string(),
        };
        Self {
            data: Arc::new(Mutex::new(data)),
        }
    }

    /// Create a frame with an already-decoded payload for `mip_level`
    pub fn from_buffer(buffer: Vec<u8>, width: u32, height: u32, mip_level: u32) -> Self {
        let data = FrameData {
            buffer,
            width,
            height,
            mip_mask: 1u32 << mip_level,
            format: String::new(),
        };
        Self {
            data: Arc::new(Mutex::new(data)),
        }
    }

    /// Frame dimensions at mip 0
    pub fn dim(&self) -> (u32, u32) {
        let d = self.data.lock().unwrap_or_else(|e| e.into_inner());
        (d.width, d.height)
    }

    /// Backend format name ("exr", "dpx", ...)
    pub fn format(&self) -> String {
        self.data.lock().unwrap_or_else(|e| e.into_inner()).format.clone()
    }

    /// Payload size in bytes (drives cache byte accounting)
    pub fn mem(&self) -> usize {
        self.data.lock().unwrap_or_else(|e| e.into_inner()).buffer.len()
    }

    /// Current mip-loaded bitmask
    pub fn mip_mask(&self) -> MipMask {
        self.data.lock().unwrap_or_else(|e| e.into_inner()).mip_mask
    }

    /// True if every bit in `required` is loaded
    pub fn satisfies(&self, required: MipMask) -> bool {
        let loaded = self.mip_mask();
        loaded & required == required
    }

    /// Mark one mip level as loaded. The mask only grows; clearing bits is
    /// not possible short of evicting the frame.
    pub fn mark_mip_loaded(&self, mip_level: u32) {
        let mut d = self.data.lock().unwrap_or_else(|e| e.into_inner());
        d.mip_mask |= 1u32 << mip_level;
    }

    /// Replace the payload bytes (backend writes decoded data here)
    pub fn set_payload(&self, buffer: Vec<u8>) {
        let mut d = self.data.lock().unwrap_or_else(|e| e.into_inner());
        d.buffer = buffer;
    }

    /// Append decoded bytes (chunked / per-mip augmentation)
    pub fn append_payload(&self, bytes: &[u8]) {
        let mut d = self.data.lock().unwrap_or_else(|e| e.into_inner());
        d.buffer.extend_from_slice(bytes);
    }

    /// Read access to the payload without cloning it
    pub fn with_payload<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let d = self.data.lock().unwrap_or_else(|e| e.into_inner());
        f(&d.buffer)
    }

    /// True if both handles refer to the same underlying frame
    pub fn same_frame(&self, other: &VideoFrame) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}
