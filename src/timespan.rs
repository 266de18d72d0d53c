//! Half-open time intervals for progress reporting
//!
//! The loader reports busy/pending/completed state to the front end as sets
//! of merged `[start, end)` intervals derived from frame-index sets.

use serde::{Deserialize, Serialize};

/// Half-open time interval `[start, end)` in seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

impl TimeRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }

    pub fn contains(&self, time: f64) -> bool {
        time >= self.start && time < self.end
    }

    /// Overlap duration with another range (0.0 if disjoint)
    pub fn overlap(&self, other: &TimeRange) -> f64 {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (end - start).max(0.0)
    }
}

/// Convert a set of frame indices into merged time intervals.
///
/// Consecutive indices collapse into one `[first/fps, (last+1)/fps)` range.
/// Input order is irrelevant; duplicates are tolerated.
pub fn frames_to_time_ranges(indices: &[usize], fps: f64) -> Vec<TimeRange> {
    if indices.is_empty() || fps <= 0.0 {
        return Vec::new();
    }

    let mut sorted = indices.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut ranges = Vec::new();
    let mut run_start = sorted[0];
    let mut run_end = sorted[0];

    for &idx in &sorted[1..] {
        if idx == run_end + 1 {
            run_end = idx;
        } else {
            ranges.push(TimeRange::new(
                run_start as f64 / fps,
                (run_end + 1) as f64 / fps,
            ));
            run_start = idx;
            run_end = idx;
        }
    }
    ranges.push(TimeRange::new(
        run_start as f64 / fps,
        (run_end + 1) as f64 / fps,
    ));

    ranges
}
