//! Sequence probing and mip-directory discovery
//!
//! On-disk convention: the sequence path is a directory of frame files; mip
//! levels live in SIBLING directories named by their pixel dimensions
//! ("2048x1080", "1024x540", ...). Each level is exactly half the width and
//! height of its parent and holds the same number of files as level 0.
//! Discovery stops at the first missing level or at [`MAX_MIP_LEVELS`]; a
//! level that exists but has the wrong file count is a configuration error
//! and fails the probe.

use std::path::{Path, PathBuf};

use glam::UVec2;
use log::{debug, info};
use regex::Regex;

use crate::backend::{DecodeBackend, FrameInfo, LoaderError};
use crate::core::frame_cache::SequenceId;
use crate::miptile::SequenceInfo;
use uuid::Uuid;

/// Discovery stops after this many mip levels no matter what is on disk
pub const MAX_MIP_LEVELS: u32 = 16;

/// A probed sequence: identity, geometry, and per-mip frame paths.
#[derive(Debug, Clone)]
pub struct SequenceSource {
    pub id: SequenceId,
    pub name: String,
    /// First-frame probe result (mip-0 dimensions, byte cost, format)
    pub info: FrameInfo,
    /// Effective frame rate (override > probed > 24.0 fallback)
    pub frame_rate: f32,
    /// Tile grid at mip 0
    pub tile_grid: UVec2,
    /// `mip_paths[level][frame]`, level 0 first; all levels same length
    pub mip_paths: Vec<Vec<PathBuf>>,
}

impl SequenceSource {
    /// Probe a sequence directory.
    ///
    /// Fails on an empty directory, a zero-size first frame, or a mip level
    /// whose file count doesn't match level 0.
    pub fn probe(
        path: &Path,
        backend: &dyn DecodeBackend,
        frame_rate_override: Option<f32>,
        tile_size: u32,
    ) -> Result<Self, LoaderError> {
        let frames = list_frame_files(path)?;
        if frames.is_empty() {
            return Err(LoaderError::EmptySequence(path.display().to_string()));
        }

        let info = backend.frame_info(&frames[0])?;
        if info.uncompressed_size == 0 {
            return Err(LoaderError::ZeroSizedFrame(frames[0].display().to_string()));
        }

        let frame_rate = frame_rate_override
            .filter(|r| *r > 0.0)
            .or(Some(info.frame_rate).filter(|r| *r > 0.0))
            .unwrap_or(24.0);

        let tile_size = tile_size.max(1);
        let tile_grid = UVec2::new(
            info.dim.0.div_ceil(tile_size).max(1),
            info.dim.1.div_ceil(tile_size).max(1),
        );

        let num_frames = frames.len();
        let mut mip_paths = vec![frames];
        discover_mip_levels(path, info.dim, num_frames, &mut mip_paths)?;

        let name = path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("sequence")
            .to_string();

        info!(
            "Probed sequence '{}': {} frames, {}x{}, {} mip level(s), {:.3} fps",
            name,
            num_frames,
            info.dim.0,
            info.dim.1,
            mip_paths.len(),
            frame_rate
        );

        Ok(Self {
            id: Uuid::new_v4(),
            name,
            info,
            frame_rate,
            tile_grid,
            mip_paths,
        })
    }

    pub fn num_frames(&self) -> usize {
        self.mip_paths[0].len()
    }

    pub fn num_mip_levels(&self) -> u32 {
        self.mip_paths.len() as u32
    }

    /// Path of one frame at one mip level
    pub fn frame_path(&self, mip_level: u32, idx: usize) -> Option<&Path> {
        self.mip_paths
            .get(mip_level as usize)
            .and_then(|level| level.get(idx))
            .map(|p| p.as_path())
    }

    /// Planner-facing geometry
    pub fn seq_info(&self) -> SequenceInfo {
        SequenceInfo {
            name: self.name.clone(),
            dim: UVec2::new(self.info.dim.0, self.info.dim.1),
            tile_grid: self.tile_grid,
            num_mip_levels: self.num_mip_levels(),
        }
    }
}

/// Sorted list of regular files in a directory
fn list_frame_files(dir: &Path) -> Result<Vec<PathBuf>, LoaderError> {
    let pattern = dir.join("*");
    let pattern = pattern.to_string_lossy();

    let mut files = Vec::new();
    for entry in glob::glob(&pattern)
        .map_err(|e| LoaderError::Io(format!("Glob error for {}: {}", pattern, e)))?
    {
        let path = entry.map_err(|e| LoaderError::Io(format!("Glob entry error: {}", e)))?;
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Walk sibling "WxH" directories, halving dimensions per level.
///
/// A missing level ends discovery; a present level with the wrong file count
/// is a hard error (the sequence is misauthored and playback would hit holes).
fn discover_mip_levels(
    level0: &Path,
    dim: (u32, u32),
    num_frames: usize,
    mip_paths: &mut Vec<Vec<PathBuf>>,
) -> Result<(), LoaderError> {
    let Some(parent) = level0.parent() else {
        return Ok(());
    };

    // Collect every sibling directory following the WxH naming convention
    let re = Regex::new(r"^(\d+)x(\d+)$")
        .map_err(|e| LoaderError::Io(format!("Regex error: {}", e)))?;
    let mut siblings: Vec<(u32, u32, PathBuf)> = Vec::new();
    let entries = std::fs::read_dir(parent)
        .map_err(|e| LoaderError::Io(format!("Failed to read {}: {}", parent.display(), e)))?;
    for entry in entries {
        let entry = entry.map_err(|e| LoaderError::Io(format!("Dir entry error: {}", e)))?;
        let p = entry.path();
        if !p.is_dir() || p == level0 {
            continue;
        }
        if let Some(caps) = entry.file_name().to_str().and_then(|n| re.captures(n)) {
            let w = caps[1].parse::<u32>().unwrap_or(0);
            let h = caps[2].parse::<u32>().unwrap_or(0);
            siblings.push((w, h, p));
        }
    }

    let (mut w, mut h) = dim;
    for level in 1..MAX_MIP_LEVELS {
        w /= 2;
        h /= 2;
        if w == 0 || h == 0 {
            break;
        }

        let Some((_, _, dir)) = siblings.iter().find(|(sw, sh, _)| *sw == w && *sh == h) else {
            break; // first missing level ends discovery
        };

        let files = list_frame_files(dir)?;
        if files.len() != num_frames {
            return Err(LoaderError::MipLevelMismatch(format!(
                "{}: {} files, expected {}",
                dir.display(),
                files.len(),
                num_frames
            )));
        }

        debug!("Mip level {}: {} ({}x{})", level, dir.display(), w, h);
        mip_paths.push(files);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    struct StubBackend {
        dim: (u32, u32),
        size: usize,
    }

    impl DecodeBackend for StubBackend {
        fn frame_info(&self, _path: &Path) -> Result<FrameInfo, LoaderError> {
            Ok(FrameInfo {
                dim: self.dim,
                uncompressed_size: self.size,
                frame_rate: 24.0,
                format_name: "stub".to_string(),
            })
        }

        fn read_frame(
            &self,
            _path: &Path,
            _frame_index: usize,
            _mip_level: u32,
            _tiles: &crate::miptile::TileSelection,
            _frame: &crate::frame::VideoFrame,
        ) -> bool {
            true
        }

        fn cancel_frame(&self, _frame_index: usize) {}
    }

    fn write_frames(dir: &Path, count: usize) {
        fs::create_dir_all(dir).unwrap();
        for i in 0..count {
            fs::write(dir.join(format!("frame.{:04}.exr", i)), b"x").unwrap();
        }
    }

    #[test]
    fn test_probe_flat_sequence() {
        let tmp = tempfile::tempdir().unwrap();
        let seq_dir = tmp.path().join("plate");
        write_frames(&seq_dir, 5);

        let backend = StubBackend { dim: (2048, 1024), size: 100 };
        let src = SequenceSource::probe(&seq_dir, &backend, None, 256).unwrap();

        assert_eq!(src.num_frames(), 5);
        assert_eq!(src.num_mip_levels(), 1);
        assert_eq!(src.tile_grid, UVec2::new(8, 4));
        assert_eq!(src.frame_rate, 24.0);
        // Paths come back sorted
        assert!(src.frame_path(0, 0).unwrap().ends_with("frame.0000.exr"));
    }

    #[test]
    fn test_probe_discovers_mip_chain() {
        let tmp = tempfile::tempdir().unwrap();
        let seq_dir = tmp.path().join("2048x1024");
        write_frames(&seq_dir, 3);
        write_frames(&tmp.path().join("1024x512"), 3);
        write_frames(&tmp.path().join("512x256"), 3);
        // Gap: no 256x128, then a stray deeper level that must be ignored
        write_frames(&tmp.path().join("128x64"), 3);

        let backend = StubBackend { dim: (2048, 1024), size: 100 };
        let src = SequenceSource::probe(&seq_dir, &backend, None, 256).unwrap();

        assert_eq!(src.num_mip_levels(), 3);
        assert_eq!(src.mip_paths[1].len(), 3);
        assert_eq!(src.mip_paths[2].len(), 3);
    }

    #[test]
    fn test_probe_rejects_mismatched_mip_count() {
        let tmp = tempfile::tempdir().unwrap();
        let seq_dir = tmp.path().join("2048x1024");
        write_frames(&seq_dir, 3);
        write_frames(&tmp.path().join("1024x512"), 2); // one frame short

        let backend = StubBackend { dim: (2048, 1024), size: 100 };
        let err = SequenceSource::probe(&seq_dir, &backend, None, 256).unwrap_err();
        assert!(matches!(err, LoaderError::MipLevelMismatch(_)));
    }

    #[test]
    fn test_probe_empty_directory_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let seq_dir = tmp.path().join("empty");
        fs::create_dir_all(&seq_dir).unwrap();

        let backend = StubBackend { dim: (64, 64), size: 100 };
        let err = SequenceSource::probe(&seq_dir, &backend, None, 256).unwrap_err();
        assert!(matches!(err, LoaderError::EmptySequence(_)));
    }

    #[test]
    fn test_probe_zero_sized_frame_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let seq_dir = tmp.path().join("plate");
        write_frames(&seq_dir, 1);

        let backend = StubBackend { dim: (64, 64), size: 0 };
        let err = SequenceSource::probe(&seq_dir, &backend, None, 256).unwrap_err();
        assert!(matches!(err, LoaderError::ZeroSizedFrame(_)));
    }

    #[test]
    fn test_frame_rate_override_wins() {
        let tmp = tempfile::tempdir().unwrap();
        let seq_dir = tmp.path().join("plate");
        write_frames(&seq_dir, 1);

        let backend = StubBackend { dim: (64, 64), size: 100 };
        let src = SequenceSource::probe(&seq_dir, &backend, Some(30.0), 256).unwrap();
        assert_eq!(src.frame_rate, 30.0);
    }
}
