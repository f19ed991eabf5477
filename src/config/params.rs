//! Parameter structures for the fusion pipeline

use std::path::PathBuf;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::fusion::CloudMode;
use crate::io::PlyFormat;

/// Streaming (one window at a time) or full-batch processing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum FusionMode {
    /// Fixed-size windows; per-cycle clouds appended as-is
    #[default]
    Online,
    /// One window over the whole sequence; downsampled before commit
    Offline,
}

/// What to do when a frame's correspondence estimation fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MatchFailurePolicy {
    /// Reuse the previous frame's relative transform
    #[default]
    PropagatePrevious,
    /// Place the frame at its reported pose
    ReportedPose,
    /// Abort the run
    Fatal,
}

/// Correspondence estimator implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EstimatorKind {
    /// Match keypoints by track id against the recent window
    #[default]
    TrackMatch,
    /// Trust the reported pose
    Identity,
}

/// Visualization sink implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    /// Log snapshot statistics only
    #[default]
    Log,
    /// Write one PLY preview per cycle
    Ply,
}

/// Cycle scheduling parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineParams {
    /// Processing mode
    pub mode: FusionMode,
    /// Frames per cycle in online mode
    pub window: usize,
    /// Concurrent frame workers per fusion batch
    pub batch_width: usize,
}

impl Default for PipelineParams {
    fn default() -> Self {
        Self {
            mode: FusionMode::Online,
            window: 10,
            batch_width: 7,
        }
    }
}

/// Frame-to-window registration parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingParams {
    /// Estimator implementation
    pub estimator: EstimatorKind,
    /// Number of most recent placed frames matched against
    pub match_window: usize,
    /// Minimum track correspondences for a valid estimate
    pub min_matches: usize,
    /// Behaviour on estimation failure
    pub failure_policy: MatchFailurePolicy,
    /// Discard drift corrections that increase the position error
    pub reject_worsening: bool,
}

impl Default for MatchingParams {
    fn default() -> Self {
        Self {
            estimator: EstimatorKind::TrackMatch,
            match_window: 3,
            min_matches: 6,
            failure_policy: MatchFailurePolicy::PropagatePrevious,
            reject_worsening: true,
        }
    }
}

/// Per-frame cloud construction parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudParams {
    /// Dense grid or keypoint neighbourhoods
    pub mode: CloudMode,
    /// Pixel step between sampled rows/columns
    pub pixel_stride: u32,
    /// Keypoint neighbourhood radius (pixels, sparse mode)
    pub range_width: u32,
    /// Maximum local depth (meters); unset keeps everything
    pub max_depth: Option<f32>,
}

impl Default for CloudParams {
    fn default() -> Self {
        Self {
            mode: CloudMode::Dense,
            pixel_stride: 1,
            range_width: 2,
            max_depth: None,
        }
    }
}

/// Voxel downsampling parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownsampleParams {
    /// Voxel size for each transformed frame cloud; 0 disables
    pub frame_voxel_size: f32,
    /// Voxel size for the final (and offline per-cycle) downsample
    pub output_voxel_size: f32,
    /// Voxels with fewer points are dropped from downsampled output
    pub min_points_per_voxel: u32,
}

impl Default for DownsampleParams {
    fn default() -> Self {
        Self {
            frame_voxel_size: 0.05,
            output_voxel_size: 0.1,
            min_points_per_voxel: 1,
        }
    }
}

/// Visualization parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerParams {
    /// Hand snapshots to a sink after each cycle
    pub enabled: bool,
    /// Sink implementation
    pub sink: SinkKind,
    /// Voxel size applied to previews in the background task
    pub preview_voxel_size: Option<f32>,
}

impl Default for ViewerParams {
    fn default() -> Self {
        Self {
            enabled: false,
            sink: SinkKind::Log,
            preview_voxel_size: Some(0.2),
        }
    }
}

/// Output parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputParams {
    /// Output directory
    pub dir: PathBuf,
    /// PLY encoding of written clouds
    pub format: PlyFormat,
    /// Write the accumulated cloud and a run manifest after every cycle
    pub checkpoint_cycles: bool,
}

impl Default for OutputParams {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("output"),
            format: PlyFormat::BinaryLittleEndian,
            checkpoint_cycles: false,
        }
    }
}

/// Log line format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging parameters (command-line flags and `RUST_LOG` take precedence)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingParams {
    /// Filter directive, e.g. `info` or `rustfuse=debug`
    pub level: Option<String>,
    /// Line format
    pub format: LogFormat,
}
