//! Per-cycle and per-run reports.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::FusionMode;

/// Wall-clock time spent in each stage of a cycle, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StageTimings {
    pub ingest_ms: f64,
    pub correction_ms: f64,
    pub fusion_ms: f64,
    pub handoff_ms: f64,
}

impl StageTimings {
    pub fn total_ms(&self) -> f64 {
        self.ingest_ms + self.correction_ms + self.fusion_ms + self.handoff_ms
    }
}

pub(crate) fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub cycle: usize,
    pub start_idx: usize,
    pub end_idx: usize,
    /// Drift correction applied at this cycle, row-major.
    pub correction: [[f64; 4]; 4],
    pub correction_rejected: bool,
    pub rms_before: f64,
    pub rms_after: f64,
    /// Frames of this cycle placed via the failure policy.
    pub degraded_frames: Vec<usize>,
    pub points_added: usize,
    pub accumulated_points: usize,
    pub timings: StageTimings,
}

impl CycleReport {
    pub fn frames(&self) -> usize {
        self.end_idx + 1 - self.start_idx
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub mode: FusionMode,
    pub frames: usize,
    pub cycles: Vec<CycleReport>,
    pub degraded_frames: Vec<usize>,
    pub accumulated_points: usize,
    pub downsampled_points: usize,
    pub viz_failures: usize,
    pub elapsed_ms: f64,
    pub frames_per_second: f64,
}

impl RunReport {
    pub fn new(mode: FusionMode, frames: usize) -> Self {
        Self {
            mode,
            frames,
            cycles: Vec::new(),
            degraded_frames: Vec::new(),
            accumulated_points: 0,
            downsampled_points: 0,
            viz_failures: 0,
            elapsed_ms: 0.0,
            frames_per_second: 0.0,
        }
    }

    pub(crate) fn finish(&mut self, elapsed: Duration) {
        self.elapsed_ms = millis(elapsed);
        let seconds = elapsed.as_secs_f64();
        self.frames_per_second = if seconds > 0.0 {
            self.frames as f64 / seconds
        } else {
            0.0
        };
    }
}
