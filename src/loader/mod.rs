//! Prefetch scheduler for one playback session
//!
//! **Architecture**: The loader does not decode anything itself. `update`
//! re-derives the wanted-frame window around the playhead, diffs it against
//! cache state and in-flight work, and tops up decode jobs on the shared
//! worker pool. Jobs pull one `LoaderWork` each via `get_work`, execute it
//! against the backend, and push the outcome into a bounded completion queue
//! that the loader drains on its own turn - no lock is ever held across
//! decode I/O.
//!
//! **Why**: Playback must never stall on loading. All public queries
//! (`get_frame_sample`, `fetch_best_video_sample_for_time_range`) answer
//! from current cache state and only schedule future work as a side effect.
//!
//! # Prefetch Window
//!
//! The wanted set alternates ahead/behind steps from the playhead in the
//! direction of travel, wrapping when looping and shrinking at sequence
//! boundaries when not. Window size derives from the cache byte budget and
//! the per-frame cost, split by a configured behind-percentage.
//!
//! # Failure Semantics
//!
//! A failed decode leaves the frame non-resident and eligible again on the
//! next relevant update; no backoff (playhead motion rate-limits retries).
//! A completion for a frame that is no longer wanted is discarded without
//! error and its work item still returns to the pool.

mod work;

pub use work::LoaderWork;

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, Weak};

use crossbeam_channel::{Receiver, Sender, bounded};
use indexmap::IndexSet;
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::{DecodeBackend, LoaderError};
use crate::core::frame_cache::{FrameCache, SequenceId};
use crate::core::workers::Workers;
use crate::frame::{MipMask, VideoFrame};
use crate::miptile::{CameraInfo, MipTileInfo, TargetStrategy, TilePlan, TileSelection};
use crate::sequence::SequenceSource;
use crate::timespan::{TimeRange, frames_to_time_ranges};

/// Outcome of a best-sample query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleStatus {
    Ok,
    NoSample,
}

/// Tunables for one loader session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Tile edge length in pixels (defines the mip-0 tile grid)
    pub tile_size: u32,
    /// Share of the frame budget spent behind the playhead (percent)
    pub behind_percentage: f32,
    /// Max decode jobs in flight; also the completion queue capacity
    pub max_in_flight: usize,
    /// Hard cap on the prefetch window regardless of cache budget
    pub max_window: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            tile_size: 256,
            behind_percentage: 25.0,
            max_in_flight: 16,
            max_window: 256,
        }
    }
}

impl LoaderConfig {
    /// Serialize config to a JSON file.
    pub fn to_json<P: AsRef<Path>>(&self, path: P) -> Result<(), String> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Serialize config error: {}", e))?;
        std::fs::write(path.as_ref(), json).map_err(|e| format!("Write config error: {}", e))?;
        Ok(())
    }

    /// Load config from a JSON file.
    pub fn from_json<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let json = std::fs::read_to_string(path.as_ref())
            .map_err(|e| format!("Read config error: {}", e))?;
        serde_json::from_str(&json).map_err(|e| format!("Parse config error: {}", e))
    }
}

/// One decode completion traveling back from a pool worker
struct Completion {
    work: LoaderWork,
    frame_index: usize,
    frame: Option<VideoFrame>,
}

/// Per-session scheduler state, rebuilt by every `update`
struct Session {
    source: SequenceSource,
    /// Frames the last update decided should be resident (window order)
    wanted: IndexSet<usize>,
    /// Wanted frames awaiting dispatch, nearest-playhead first
    pending: IndexSet<usize>,
    /// Frames with a decode in flight. Disjoint from `pending`.
    queued: HashSet<usize>,
    /// Work item free list
    pool: Vec<LoaderWork>,
    /// Latest visibility plan + the mip levels it requires
    plan: TilePlan,
    required_mask: MipMask,
    last_requested: Option<usize>,
    last_play_rate: f32,
    last_looping: bool,
    /// Monotonic loop counter; bumps on playhead wraparound so consumers can
    /// disambiguate timestamps across loop iterations
    loop_index: i64,
    num_load_ahead: usize,
    num_load_behind: usize,
    /// Epoch this session's jobs are stamped with
    epoch: u64,
}

/// Prefetch scheduler for one image sequence.
///
/// Construct with [`Loader::new`]; the returned `Arc` is required because
/// decode jobs hold a `Weak` reference back to their loader and silently
/// discard results once it is gone.
pub struct Loader {
    backend: Arc<dyn DecodeBackend>,
    cache: Arc<FrameCache>,
    /// Shared pool; None = caller drives `get_work` manually
    workers: Option<Arc<Workers>>,
    config: LoaderConfig,
    tiles: Mutex<MipTileInfo>,
    cameras: Mutex<Vec<CameraInfo>>,
    session: Mutex<Option<Session>>,
    completion_tx: Sender<Completion>,
    completion_rx: Receiver<Completion>,
    weak_self: Weak<Loader>,
}

impl Loader {
    pub fn new(
        backend: Arc<dyn DecodeBackend>,
        cache: Arc<FrameCache>,
        workers: Option<Arc<Workers>>,
        config: LoaderConfig,
    ) -> Arc<Self> {
        let (tx, rx) = bounded(config.max_in_flight.max(1));
        Arc::new_cyclic(|weak| Self {
            backend,
            cache,
            workers,
            config,
            tiles: Mutex::new(MipTileInfo::new()),
            cameras: Mutex::new(Vec::new()),
            session: Mutex::new(None),
            completion_tx: tx,
            completion_rx: rx,
            weak_self: weak.clone(),
        })
    }

    // ===== Session lifecycle =====

    /// Probe the sequence and size the prefetch window.
    ///
    /// On failure the session stays uninitialized and every query answers
    /// "no sample".
    pub fn initialize(
        &self,
        path: &Path,
        frame_rate_override: Option<f32>,
        _looping: bool,
    ) -> Result<(), LoaderError> {
        let source = SequenceSource::probe(
            path,
            self.backend.as_ref(),
            frame_rate_override,
            self.config.tile_size,
        )?;

        let capacity = self.cache.manager().capacity();
        let cost = source.info.uncompressed_size;
        let budget = (capacity / cost.max(1))
            .min(source.num_frames())
            .min(self.config.max_window)
            .max(1);
        let behind = ((budget as f32 * self.config.behind_percentage / 100.0) as usize)
            .min(budget.saturating_sub(1));
        let ahead = budget.saturating_sub(behind + 1);

        self.backend
            .pre_allocate_pool(self.config.max_in_flight, &source.info);

        info!(
            "Loader initialized: '{}' {} frames, window ahead={} behind={} (budget {} frames)",
            source.name,
            source.num_frames(),
            ahead,
            behind,
            budget
        );

        let mut session = self.session.lock().unwrap_or_else(|e| e.into_inner());

        // Re-initialization replaces the session: retire the old sequence's
        // in-flight jobs and cached frames just like shutdown would
        if let Some(old) = session.take() {
            self.cache.manager().increment_epoch();
            self.cache.clear_sequence(old.source.id);
            debug!("Replacing session '{}'", old.source.name);
        }

        let epoch = self.cache.manager().current_epoch();
        *session = Some(Session {
            source,
            wanted: IndexSet::new(),
            pending: IndexSet::new(),
            queued: HashSet::new(),
            pool: Vec::new(),
            plan: Vec::new(),
            required_mask: 1, // whole frame, mip 0
            last_requested: None,
            last_play_rate: 1.0,
            last_looping: false,
            loop_index: 0,
            num_load_ahead: ahead,
            num_load_behind: behind,
            epoch,
        });
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Tear the session down: stale jobs are skipped via the epoch bump and
    /// the sequence's frames leave the shared cache.
    pub fn shutdown(&self) {
        let mut session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(sess) = session.take() {
            self.cache.manager().increment_epoch();
            self.cache.clear_sequence(sess.source.id);
            debug!("Loader shut down: '{}'", sess.source.name);
        }
    }

    pub fn sequence_id(&self) -> Option<SequenceId> {
        let session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        session.as_ref().map(|s| s.source.id)
    }

    pub fn num_frames(&self) -> usize {
        let session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        session.as_ref().map(|s| s.source.num_frames()).unwrap_or(0)
    }

    pub fn frame_rate(&self) -> f32 {
        let session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        session.as_ref().map(|s| s.source.frame_rate).unwrap_or(0.0)
    }

    /// Current loop iteration of the playhead (monotonic per direction)
    pub fn loop_index(&self) -> i64 {
        let session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        session.as_ref().map(|s| s.loop_index).unwrap_or(0)
    }

    /// Override the derived prefetch window (mainly for tests and tuning)
    pub fn set_window(&self, ahead: usize, behind: usize) {
        let mut session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(sess) = session.as_mut() {
            sess.num_load_ahead = ahead;
            sess.num_load_behind = behind;
        }
    }

    // ===== Visibility targets =====

    /// Latest camera set; consumed by the next `update`
    pub fn set_cameras(&self, cameras: Vec<CameraInfo>) {
        *self.cameras.lock().unwrap_or_else(|e| e.into_inner()) = cameras;
    }

    pub fn register_target(
        &self,
        handle: Uuid,
        width_hint: f32,
        lod_bias: f32,
        strategy: TargetStrategy,
    ) {
        self.tiles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .register_target(handle, width_hint, lod_bias, strategy);
    }

    pub fn unregister_target(&self, handle: &Uuid) {
        self.tiles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .unregister_target(handle);
    }

    // ===== Playhead-driven scheduling =====

    /// Map a timestamp onto the sequence and reschedule if it moved.
    ///
    /// Returns false if no session is initialized. An unchanged frame index
    /// is a no-op apart from backend housekeeping.
    pub fn request_frame(&self, time: f64, play_rate: f32, looping: bool) -> bool {
        self.drain_completions();

        let playhead = {
            let mut session = self.session.lock().unwrap_or_else(|e| e.into_inner());
            let Some(sess) = session.as_mut() else {
                return false;
            };

            let len = sess.source.num_frames();
            let idx = time_to_frame(time, sess.source.frame_rate as f64, len, looping);

            sess.last_play_rate = play_rate;
            sess.last_looping = looping;

            if sess.last_requested == Some(idx) {
                self.backend.on_tick();
                return true;
            }

            // Wraparound detection: a jump of more than half the sequence
            // against the travel direction means the playhead looped
            if looping && len > 1 {
                if let Some(last) = sess.last_requested {
                    let half = len / 2;
                    if play_rate >= 0.0 && idx < last && last - idx > half {
                        sess.loop_index += 1;
                        trace!("Loop index -> {}", sess.loop_index);
                    } else if play_rate < 0.0 && idx > last && idx - last > half {
                        sess.loop_index -= 1;
                        trace!("Loop index -> {}", sess.loop_index);
                    }
                }
            }

            sess.last_requested = Some(idx);
            idx
        };

        self.update(playhead, play_rate, looping);
        true
    }

    /// Rebuild the wanted window around `playhead` and reconcile work.
    pub fn update(&self, playhead: usize, play_rate: f32, looping: bool) {
        self.drain_completions();

        let dispatch = {
            let mut session = self.session.lock().unwrap_or_else(|e| e.into_inner());
            let Some(sess) = session.as_mut() else {
                return;
            };

            let len = sess.source.num_frames();
            let playhead = playhead.min(len.saturating_sub(1));

            // Refresh the tile plan from the current cameras/targets
            let seq_info = sess.source.seq_info();
            let cameras = self.cameras.lock().unwrap_or_else(|e| e.into_inner()).clone();
            let mut tiles = self.tiles.lock().unwrap_or_else(|e| e.into_inner());
            if tiles.has_targets() {
                let plan = tiles.calculate_visible_tiles(&cameras, &seq_info);
                let mut mask: MipMask = 0;
                for (level, sel) in plan.iter().enumerate() {
                    if sel.is_visible() {
                        mask |= 1 << level;
                    }
                }
                sess.plan = plan;
                sess.required_mask = mask;
            } else {
                // No targets registered: whole frame at full resolution
                sess.plan = Vec::new();
                sess.required_mask = 1;
            }
            drop(tiles);

            sess.wanted = build_wanted_window(
                playhead,
                play_rate,
                looping,
                len,
                sess.num_load_ahead,
                sess.num_load_behind,
            );

            // Best-effort cancel for in-flight frames that fell out of the
            // window; the completion still arrives and is discarded
            for &idx in &sess.queued {
                if !sess.wanted.contains(&idx) {
                    trace!("Cancelling stale decode of frame {}", idx);
                    self.backend.cancel_frame(idx);
                }
            }

            // Rebuild pending: wanted, unsatisfied, not already in flight
            let seq = sess.source.id;
            let required = sess.required_mask;
            sess.pending.clear();
            if required != 0 {
                let wanted: Vec<usize> = sess.wanted.iter().copied().collect();
                for idx in wanted {
                    let satisfied = self
                        .cache
                        .mip_mask(seq, idx)
                        .map(|m| m & required == required)
                        .unwrap_or(false);
                    if !satisfied && !sess.queued.contains(&idx) {
                        sess.pending.insert(idx);
                    }
                }
            }

            self.backend.on_tick();

            let to_dispatch = sess
                .pending
                .len()
                .min(self.config.max_in_flight.saturating_sub(sess.queued.len()));
            (to_dispatch, sess.epoch)
        };

        let (to_dispatch, epoch) = dispatch;
        if let Some(workers) = &self.workers {
            let weak = self.weak_self.clone();
            for _ in 0..to_dispatch {
                let weak = weak.clone();
                workers.execute_with_epoch(epoch, move || {
                    // Expired loader: silently discard (pool job outlived us)
                    let Some(loader) = weak.upgrade() else {
                        return;
                    };
                    loader.run_one();
                });
            }
        }
    }

    /// Pull one pending frame and execute it synchronously (pool job body)
    fn run_one(&self) {
        let Some(mut work) = self.get_work() else {
            return;
        };
        let frame_index = work.frame_index();
        let frame = work.execute(self.backend.as_ref());
        // Bounded queue: a full queue back-pressures the pool until the
        // loader next drains on its own turn
        let _ = self.completion_tx.send(Completion {
            work,
            frame_index,
            frame,
        });
    }

    /// Pop the highest-priority pending frame as an armed work item.
    ///
    /// Pending order is nearest-playhead-first as rebuilt by `update`; the
    /// only guarantee is that nearer frames are not worse off.
    pub fn get_work(&self) -> Option<LoaderWork> {
        let mut session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        let sess = session.as_mut()?;
        let seq = sess.source.id;

        loop {
            let idx = sess.pending.shift_remove_index(0)?;

            let loaded = self.cache.mip_mask(seq, idx).unwrap_or(0);
            let missing = sess.required_mask & !loaded;
            if missing == 0 {
                // Satisfied since the window was built; try the next frame
                continue;
            }

            // Coarsest missing level first: fastest path to something
            // displayable. One clamped level drives the tile lookup, the
            // file path, and the work item alike.
            let mip_level =
                (31 - missing.leading_zeros()).min(sess.source.num_mip_levels() - 1);
            let tiles = sess
                .plan
                .get(mip_level as usize)
                .copied()
                .filter(|s| s.is_visible())
                .unwrap_or_else(|| {
                    TileSelection::full(sess.source.seq_info().tile_grid_at(mip_level))
                });

            let Some(path) = sess.source.frame_path(mip_level, idx) else {
                continue;
            };
            let path = path.to_path_buf();
            let existing = self.cache.peek(seq, idx);

            let mut work = sess.pool.pop().unwrap_or_default();
            work.prepare(
                idx,
                path,
                mip_level,
                tiles,
                existing,
                sess.source.info.dim,
                &sess.source.info.format_name,
            );

            sess.queued.insert(idx);
            trace!("Work armed: frame {} mip {}", idx, mip_level);
            return Some(work);
        }
    }

    /// Merge one finished decode back into the session.
    ///
    /// Frames that fell out of the wanted window are discarded without
    /// error; the work item always returns to the pool.
    pub fn notify_work_complete(
        &self,
        mut work: LoaderWork,
        frame_index: usize,
        frame: Option<VideoFrame>,
    ) {
        let mut session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        let Some(sess) = session.as_mut() else {
            return; // Session torn down while the decode ran
        };

        sess.queued.remove(&frame_index);

        match frame {
            Some(frame) if sess.wanted.contains(&frame_index) => {
                self.cache.add_frame(sess.source.id, frame_index, frame);
            }
            Some(_) => {
                trace!("Discarding stale decode of frame {}", frame_index);
            }
            None => {
                warn!("Decode failed for frame {}; will retry on demand", frame_index);
            }
        }

        work.reset();
        if sess.pool.len() < self.config.max_in_flight * 2 {
            sess.pool.push(work);
        }
    }

    fn drain_completions(&self) {
        while let Ok(c) = self.completion_rx.try_recv() {
            self.notify_work_complete(c.work, c.frame_index, c.frame);
        }
    }

    // ===== Consumer queries =====

    /// Exact-timestamp read. Never blocks; schedules the frame as a side
    /// effect so a later call may succeed.
    pub fn get_frame_sample(&self, time: f64) -> Option<VideoFrame> {
        self.drain_completions();

        let lookup = {
            let session = self.session.lock().unwrap_or_else(|e| e.into_inner());
            let sess = session.as_ref()?;
            let idx = time_to_frame(
                time,
                sess.source.frame_rate as f64,
                sess.source.num_frames(),
                sess.last_looping,
            );
            (sess.source.id, idx, sess.last_play_rate, sess.last_looping)
        };

        let (seq, idx, rate, looping) = lookup;
        let found = self.cache.find_and_touch(seq, idx);
        self.request_frame(time, rate, looping);
        found
    }

    /// Best resident frame for a time range.
    ///
    /// Picks the index with maximum overlap, biased toward the trailing edge
    /// in the playback direction; non-blocking mode degrades gracefully by
    /// walking back toward the range start for any resident frame.
    pub fn fetch_best_video_sample_for_time_range(
        &self,
        range: TimeRange,
        looping: bool,
        play_rate: f32,
        blocking: bool,
    ) -> (SampleStatus, Option<VideoFrame>) {
        self.drain_completions();

        let picked = {
            let session = self.session.lock().unwrap_or_else(|e| e.into_inner());
            let Some(sess) = session.as_ref() else {
                return (SampleStatus::NoSample, None);
            };

            let fps = sess.source.frame_rate as f64;
            let len = sess.source.num_frames();
            let duration = len as f64 / fps;

            // A wrapping range splits at the sequence boundary; the half
            // with the greater overlap wins
            let mut sub = range;
            if looping && range.end > duration {
                if range.start < duration {
                    let head = TimeRange::new(range.start, duration);
                    let tail = TimeRange::new(0.0, range.end - duration);
                    sub = if tail.duration() > head.duration() { tail } else { head };
                } else {
                    sub = TimeRange::new(range.start % duration, (range.end - range.start) + range.start % duration);
                    sub.end = sub.end.min(duration);
                }
            }
            sub.start = sub.start.clamp(0.0, duration);
            sub.end = sub.end.clamp(0.0, duration);
            if sub.duration() <= 0.0 {
                return (SampleStatus::NoSample, None);
            }

            let first = (sub.start * fps).floor().max(0.0) as usize;
            let last = (((sub.end * fps).ceil() as usize).saturating_sub(1)).min(len - 1);
            let first = first.min(last);

            // Max overlap; ties go to the trailing edge of travel
            let mut ideal = first;
            let mut best = -1.0f64;
            for idx in first..=last {
                let cell = TimeRange::new(idx as f64 / fps, (idx + 1) as f64 / fps);
                let overlap = cell.overlap(&sub);
                let wins = if play_rate >= 0.0 { overlap >= best } else { overlap > best };
                if wins {
                    best = overlap;
                    ideal = idx;
                }
            }

            (sess.source.id, fps, first, last, ideal)
        };

        let (seq, fps, first, last, ideal) = picked;
        self.request_frame((ideal as f64 + 0.5) / fps, play_rate, looping);

        if blocking {
            return match self.cache.find_and_touch(seq, ideal) {
                Some(frame) => (SampleStatus::Ok, Some(frame)),
                None => (SampleStatus::NoSample, None),
            };
        }

        // Walk from the ideal index back toward the range start, taking the
        // first resident frame (graceful degradation under load)
        let candidates: Vec<usize> = if play_rate >= 0.0 {
            (first..=ideal).rev().collect()
        } else {
            (ideal..=last).collect()
        };
        for idx in candidates {
            if let Some(frame) = self.cache.find_and_touch(seq, idx) {
                return (SampleStatus::Ok, Some(frame));
            }
        }
        (SampleStatus::NoSample, None)
    }

    // ===== Progress reporting =====

    /// Time intervals with a decode currently in flight
    pub fn get_busy_time_ranges(&self) -> Vec<TimeRange> {
        let session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        let Some(sess) = session.as_ref() else {
            return Vec::new();
        };
        let indices: Vec<usize> = sess.queued.iter().copied().collect();
        frames_to_time_ranges(&indices, sess.source.frame_rate as f64)
    }

    /// Time intervals wanted but not yet dispatched
    pub fn get_pending_time_ranges(&self) -> Vec<TimeRange> {
        let session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        let Some(sess) = session.as_ref() else {
            return Vec::new();
        };
        let indices: Vec<usize> = sess.pending.iter().copied().collect();
        frames_to_time_ranges(&indices, sess.source.frame_rate as f64)
    }

    /// Time intervals resident in the cache
    pub fn get_completed_time_ranges(&self) -> Vec<TimeRange> {
        let session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        let Some(sess) = session.as_ref() else {
            return Vec::new();
        };
        let indices = self.cache.get_indices(sess.source.id);
        frames_to_time_ranges(&indices, sess.source.frame_rate as f64)
    }

    /// Frame indices the last update decided should be resident (window order)
    pub fn wanted_indices(&self) -> Vec<usize> {
        let session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        session
            .as_ref()
            .map(|s| s.wanted.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Frame indices awaiting dispatch, highest priority first
    pub fn pending_indices(&self) -> Vec<usize> {
        let session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        session
            .as_ref()
            .map(|s| s.pending.iter().copied().collect())
            .unwrap_or_default()
    }
}

impl Drop for Loader {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Map a timestamp onto a frame index, wrapping when looping, clamping when
/// not.
fn time_to_frame(time: f64, fps: f64, len: usize, looping: bool) -> usize {
    if len == 0 || fps <= 0.0 {
        return 0;
    }
    let raw = (time * fps).floor() as i64;
    let len_i = len as i64;
    let idx = if looping {
        raw.rem_euclid(len_i)
    } else {
        raw.clamp(0, len_i - 1)
    };
    idx as usize
}

/// Wanted window: playhead first, then alternating ahead/behind steps in the
/// direction of travel. Non-looping windows shrink at the boundaries.
fn build_wanted_window(
    playhead: usize,
    play_rate: f32,
    looping: bool,
    len: usize,
    ahead: usize,
    behind: usize,
) -> IndexSet<usize> {
    let mut wanted = IndexSet::new();
    if len == 0 {
        return wanted;
    }

    let dir: i64 = if play_rate >= 0.0 { 1 } else { -1 };
    let len_i = len as i64;
    let mut resolve = |offset: i64, out: &mut IndexSet<usize>| {
        let raw = playhead as i64 + offset;
        if looping {
            out.insert(raw.rem_euclid(len_i) as usize);
        } else if (0..len_i).contains(&raw) {
            out.insert(raw as usize);
        }
    };

    resolve(0, &mut wanted);
    let steps = ahead.max(behind);
    for k in 1..=steps as i64 {
        if k <= ahead as i64 {
            resolve(dir * k, &mut wanted);
        }
        if k <= behind as i64 {
            resolve(-dir * k, &mut wanted);
        }
    }
    wanted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::FrameInfo;
    use crate::core::cache_man::CacheManager;
    use std::fs;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::TempDir;

    const FRAME_BYTES: usize = 64;

    /// Deterministic in-memory backend: every decode produces FRAME_BYTES of
    /// payload, optionally failing on demand.
    struct FakeBackend {
        dim: (u32, u32),
        reads: AtomicUsize,
        cancels: Mutex<Vec<usize>>,
        fail: AtomicBool,
    }

    impl FakeBackend {
        fn new() -> Self {
            Self {
                dim: (512, 512),
                reads: AtomicUsize::new(0),
                cancels: Mutex::new(Vec::new()),
                fail: AtomicBool::new(false),
            }
        }
    }

    impl DecodeBackend for FakeBackend {
        fn frame_info(&self, _path: &Path) -> Result<FrameInfo, LoaderError> {
            Ok(FrameInfo {
                dim: self.dim,
                uncompressed_size: FRAME_BYTES,
                frame_rate: 1.0, // 1 fps keeps time == frame index in tests
                format_name: "fake".to_string(),
            })
        }

        fn read_frame(
            &self,
            _path: &Path,
            _frame_index: usize,
            _mip_level: u32,
            _tiles: &TileSelection,
            frame: &VideoFrame,
        ) -> bool {
            self.reads.fetch_add(1, Ordering::Relaxed);
            if self.fail.load(Ordering::Relaxed) {
                return false;
            }
            frame.set_payload(vec![0u8; FRAME_BYTES]);
            true
        }

        fn cancel_frame(&self, frame_index: usize) {
            self.cancels.lock().unwrap().push(frame_index);
        }
    }

    struct Fixture {
        _tmp: TempDir,
        backend: Arc<FakeBackend>,
        loader: Arc<Loader>,
    }

    /// A sequence of `frames` files and a loader with a generous cache,
    /// driven manually (no worker pool) for determinism.
    fn fixture(frames: usize) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("plate");
        fs::create_dir_all(&dir).unwrap();
        for i in 0..frames {
            fs::write(dir.join(format!("frame.{:04}.exr", i)), b"x").unwrap();
        }

        let backend = Arc::new(FakeBackend::new());
        let cache = Arc::new(FrameCache::new(Arc::new(CacheManager::with_capacity(
            1024 * 1024,
        ))));
        let loader = Loader::new(backend.clone(), cache, None, LoaderConfig::default());
        loader.initialize(&dir, None, false).unwrap();
        Fixture {
            _tmp: tmp,
            backend,
            loader,
        }
    }

    /// Run pending work to completion, synchronously
    fn drive(loader: &Loader) {
        while let Some(mut work) = loader.get_work() {
            let idx = work.frame_index();
            let frame = work.execute(loader.backend.as_ref());
            loader.notify_work_complete(work, idx, frame);
        }
    }

    #[test]
    fn test_config_json_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("loader.json");

        let config = LoaderConfig {
            tile_size: 128,
            behind_percentage: 10.0,
            max_in_flight: 4,
            max_window: 32,
        };
        config.to_json(&path).unwrap();

        let loaded = LoaderConfig::from_json(&path).unwrap();
        assert_eq!(loaded.tile_size, 128);
        assert_eq!(loaded.max_in_flight, 4);
    }

    #[test]
    fn test_window_boundary_non_looping() {
        let fx = fixture(100);
        fx.loader.set_window(5, 2);
        fx.loader.update(98, 1.0, false);

        let mut wanted = fx.loader.wanted_indices();
        wanted.sort_unstable();
        assert_eq!(wanted, vec![96, 97, 98, 99]);
    }

    #[test]
    fn test_window_wraps_when_looping() {
        let fx = fixture(100);
        fx.loader.set_window(3, 1);
        fx.loader.update(99, 1.0, true);

        let mut wanted = fx.loader.wanted_indices();
        wanted.sort_unstable();
        assert_eq!(wanted, vec![0, 1, 2, 98, 99]);
    }

    #[test]
    fn test_window_direction_reverses() {
        let fx = fixture(100);
        fx.loader.set_window(3, 1);
        fx.loader.update(50, -1.0, false);

        let mut wanted = fx.loader.wanted_indices();
        wanted.sort_unstable();
        assert_eq!(wanted, vec![47, 48, 49, 50, 51]);
    }

    #[test]
    fn test_pending_nearest_playhead_first() {
        let fx = fixture(100);
        fx.loader.set_window(3, 1);
        fx.loader.update(10, 1.0, false);

        assert_eq!(fx.loader.pending_indices(), vec![10, 11, 9, 12, 13]);
    }

    #[test]
    fn test_update_then_drive_loads_window() {
        let fx = fixture(20);
        fx.loader.set_window(2, 1);
        fx.loader.update(5, 1.0, false);
        drive(&fx.loader);

        assert!(fx.loader.pending_indices().is_empty());
        assert_eq!(
            fx.loader.get_completed_time_ranges(),
            vec![TimeRange::new(4.0, 8.0)]
        );
        assert!(fx.loader.get_frame_sample(5.5).is_some());
    }

    #[test]
    fn test_satisfied_frames_not_repended() {
        let fx = fixture(20);
        fx.loader.set_window(2, 1);
        fx.loader.update(5, 1.0, false);
        drive(&fx.loader);
        let reads = fx.backend.reads.load(Ordering::Relaxed);

        fx.loader.update(5, 1.0, false);
        assert!(fx.loader.pending_indices().is_empty());
        drive(&fx.loader);
        assert_eq!(fx.backend.reads.load(Ordering::Relaxed), reads);
    }

    #[test]
    fn test_cancellation_race_discards_stale_result() {
        let fx = fixture(100);
        fx.loader.set_window(1, 0);
        fx.loader.update(10, 1.0, false);

        // Decode starts for frame 10...
        let mut work = fx.loader.get_work().expect("work for frame 10");
        let idx = work.frame_index();
        let frame = work.execute(fx.loader.backend.as_ref());

        // ...but the playhead jumps far away before it completes
        fx.loader.update(90, 1.0, false);
        assert!(fx.backend.cancels.lock().unwrap().contains(&10));

        fx.loader.notify_work_complete(work, idx, frame);
        let seq = fx.loader.sequence_id().unwrap();
        assert!(!fx.loader.get_completed_time_ranges().iter().any(|r| r.contains(10.0)));
        assert_eq!(fx.loader.cache.mip_mask(seq, 10), None);

        // The queued slot was reclaimed: frame 10 is loadable again later
        fx.loader.update(10, 1.0, false);
        assert_eq!(fx.loader.pending_indices(), vec![10, 11]);
    }

    #[test]
    fn test_decode_failure_retried_on_next_update() {
        let fx = fixture(20);
        fx.loader.set_window(0, 0);
        fx.backend.fail.store(true, Ordering::Relaxed);

        fx.loader.update(3, 1.0, false);
        drive(&fx.loader);
        assert!(fx.loader.get_frame_sample(3.5).is_none());

        fx.backend.fail.store(false, Ordering::Relaxed);
        fx.loader.update(3, 1.0, false);
        drive(&fx.loader);
        assert!(fx.loader.get_frame_sample(3.5).is_some());
    }

    #[test]
    fn test_pending_queued_disjoint() {
        let fx = fixture(20);
        fx.loader.set_window(3, 1);
        fx.loader.update(5, 1.0, false);

        let _in_flight = fx.loader.get_work().unwrap();
        fx.loader.update(5, 1.0, false);

        let pending = fx.loader.pending_indices();
        assert!(!pending.contains(&5), "in-flight frame must not be re-pended");
    }

    #[test]
    fn test_get_work_skips_satisfied_head() {
        let fx = fixture(20);
        fx.loader.set_window(2, 0);
        fx.loader.update(4, 1.0, false);

        // Frame 4 becomes resident behind the scheduler's back (e.g. an
        // earlier in-flight decode landed between update and dispatch)
        let seq = fx.loader.sequence_id().unwrap();
        let frame = VideoFrame::new(512, 512, "fake");
        frame.set_payload(vec![0u8; FRAME_BYTES]);
        frame.mark_mip_loaded(0);
        fx.loader.cache.add_frame(seq, 4, frame);

        // The satisfied head must not starve the rest of the pending set
        let work = fx.loader.get_work().expect("next unsatisfied frame");
        assert_eq!(work.frame_index(), 5);
        let work = fx.loader.get_work().expect("one more pending frame");
        assert_eq!(work.frame_index(), 6);
        assert!(fx.loader.get_work().is_none());
    }

    #[test]
    fn test_reinitialize_clears_previous_sequence() {
        let fx = fixture(10);
        fx.loader.set_window(2, 0);
        fx.loader.update(0, 1.0, false);
        drive(&fx.loader);

        let old_seq = fx.loader.sequence_id().unwrap();
        assert!(!fx.loader.cache.get_indices(old_seq).is_empty());

        let dir = fx._tmp.path().join("plate");
        fx.loader.initialize(&dir, None, false).unwrap();

        let new_seq = fx.loader.sequence_id().unwrap();
        assert_ne!(old_seq, new_seq);
        assert!(
            fx.loader.cache.get_indices(old_seq).is_empty(),
            "old sequence's frames must leave the cache on re-initialize"
        );
    }

    #[test]
    fn test_get_frame_sample_schedules_miss() {
        let fx = fixture(20);
        fx.loader.set_window(1, 0);

        assert!(fx.loader.get_frame_sample(7.5).is_none());
        drive(&fx.loader);
        assert!(fx.loader.get_frame_sample(7.5).is_some());
    }

    #[test]
    fn test_fetch_best_degrades_to_nearby_frame() {
        // Range [10,13) with only frame 11 resident must still serve a frame
        let fx = fixture(20);
        fx.loader.set_window(0, 0);
        fx.loader.update(11, 1.0, false);
        drive(&fx.loader); // loads exactly frame 11

        let (status, frame) = fx.loader.fetch_best_video_sample_for_time_range(
            TimeRange::new(10.0, 13.0),
            false,
            1.0,
            false,
        );
        assert_eq!(status, SampleStatus::Ok);
        assert!(frame.is_some());
    }

    #[test]
    fn test_fetch_best_blocking_requires_exact_match() {
        let fx = fixture(20);
        fx.loader.set_window(0, 0);
        fx.loader.update(11, 1.0, false);
        drive(&fx.loader);

        // Ideal index for [10,13) going forward is 12, which is not resident
        let (status, frame) = fx.loader.fetch_best_video_sample_for_time_range(
            TimeRange::new(10.0, 13.0),
            false,
            1.0,
            true,
        );
        assert_eq!(status, SampleStatus::NoSample);
        assert!(frame.is_none());
    }

    #[test]
    fn test_fetch_best_empty_session() {
        let backend = Arc::new(FakeBackend::new());
        let cache = Arc::new(FrameCache::new(Arc::new(CacheManager::with_capacity(1024))));
        let loader = Loader::new(backend, cache, None, LoaderConfig::default());

        let (status, frame) = loader.fetch_best_video_sample_for_time_range(
            TimeRange::new(0.0, 1.0),
            false,
            1.0,
            false,
        );
        assert_eq!(status, SampleStatus::NoSample);
        assert!(frame.is_none());
    }

    #[test]
    fn test_loop_counter_wraparound() {
        let fx = fixture(10);
        fx.loader.set_window(1, 0);

        fx.loader.request_frame(8.5, 1.0, true);
        fx.loader.request_frame(9.5, 1.0, true);
        assert_eq!(fx.loader.loop_index(), 0);

        fx.loader.request_frame(0.5, 1.0, true); // wrapped forward
        assert_eq!(fx.loader.loop_index(), 1);

        fx.loader.request_frame(9.5, -1.0, true); // wrapped backward
        assert_eq!(fx.loader.loop_index(), 0);
    }

    #[test]
    fn test_request_frame_same_index_noop() {
        let fx = fixture(20);
        fx.loader.set_window(1, 0);
        fx.loader.request_frame(5.2, 1.0, false);
        let pending = fx.loader.pending_indices();

        // Same frame index; window must not be rebuilt differently
        fx.loader.request_frame(5.7, 1.0, false);
        assert_eq!(fx.loader.pending_indices(), pending);
    }

    #[test]
    fn test_progress_ranges() {
        let fx = fixture(20);
        fx.loader.set_window(2, 0);
        fx.loader.update(4, 1.0, false);

        // 4,5,6 pending; take one in flight
        let work = fx.loader.get_work().unwrap();
        let busy = fx.loader.get_busy_time_ranges();
        assert_eq!(busy, vec![TimeRange::new(4.0, 5.0)]);

        let pending = fx.loader.get_pending_time_ranges();
        assert_eq!(pending, vec![TimeRange::new(5.0, 7.0)]);

        let idx = work.frame_index();
        let mut work = work;
        let frame = work.execute(fx.loader.backend.as_ref());
        fx.loader.notify_work_complete(work, idx, frame);

        let completed = fx.loader.get_completed_time_ranges();
        assert_eq!(completed, vec![TimeRange::new(4.0, 5.0)]);
    }

    #[test]
    fn test_uninitialized_answers_no_sample() {
        let backend = Arc::new(FakeBackend::new());
        let cache = Arc::new(FrameCache::new(Arc::new(CacheManager::with_capacity(1024))));
        let loader = Loader::new(backend, cache, None, LoaderConfig::default());

        assert!(!loader.is_initialized());
        assert!(!loader.request_frame(0.0, 1.0, false));
        assert!(loader.get_frame_sample(0.0).is_none());
        assert!(loader.get_busy_time_ranges().is_empty());
    }

    #[test]
    fn test_shutdown_clears_cache() {
        let fx = fixture(10);
        fx.loader.set_window(2, 0);
        fx.loader.update(0, 1.0, false);
        drive(&fx.loader);
        let seq = fx.loader.sequence_id().unwrap();
        assert!(!fx.loader.cache.get_indices(seq).is_empty());

        fx.loader.shutdown();
        assert!(!fx.loader.is_initialized());
        assert!(fx.loader.cache.get_indices(seq).is_empty());
    }

    #[test]
    fn test_worker_pool_integration() {
        // End-to-end: real pool, completions drained by later calls
        let _ = env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or("warn"),
        )
        .is_test(true)
        .try_init();

        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("plate");
        fs::create_dir_all(&dir).unwrap();
        for i in 0..10 {
            fs::write(dir.join(format!("frame.{:04}.exr", i)), b"x").unwrap();
        }

        let backend = Arc::new(FakeBackend::new());
        let manager = Arc::new(CacheManager::with_capacity(1024 * 1024));
        let workers = Arc::new(Workers::new(2, manager.epoch_ref()));
        let cache = Arc::new(FrameCache::new(manager));
        let loader = Loader::new(
            backend,
            cache,
            Some(workers),
            LoaderConfig::default(),
        );
        loader.initialize(&dir, None, false).unwrap();
        loader.set_window(2, 1);
        loader.request_frame(5.5, 1.0, false);

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        loop {
            if loader.get_frame_sample(5.5).is_some() {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "frame 5 never loaded");
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
    }
}
