//! Visualization handoff.
//!
//! After each cycle the orchestrator hands a copy of the accumulated cloud to
//! a background thread. At most one handoff is in flight: the previous one is
//! joined right before the next is launched, so cycle N's visualization
//! overlaps cycle N+1's computation. Sink failures are logged and counted,
//! never propagated.

use std::path::PathBuf;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use glam::DVec3;
use thiserror::Error;

use crate::chain::{REPORTED_POSITION_COLOR, VISION_POSITION_COLOR};
use crate::core::PointCloud;
use crate::fusion::{Downsampler, VoxelGrid};
use crate::io::{ply, PlyError, PlyFormat};

#[derive(Debug, Error)]
pub enum VizError {
    #[error("failed to write preview: {0}")]
    Ply(#[from] PlyError),
    #[error("viewer is still busy with the previous snapshot")]
    Busy,
    #[error("viewer disconnected")]
    Disconnected,
    #[error("{0}")]
    Other(String),
}

/// Geometry handed to a sink. Owned, so the sink never sees the live cloud.
#[derive(Debug, Clone)]
pub struct VizSnapshot {
    pub cycle: usize,
    pub total_cycles: usize,
    pub cloud: PointCloud,
    pub vision_positions: Vec<DVec3>,
    pub reported_positions: Vec<DVec3>,
}

pub trait VizSink: Send {
    fn push(&mut self, snapshot: &VizSnapshot) -> Result<(), VizError>;
}

/// Logs snapshot sizes.
#[derive(Debug, Default)]
pub struct LogSink;

impl VizSink for LogSink {
    fn push(&mut self, snapshot: &VizSnapshot) -> Result<(), VizError> {
        log::info!(
            "viewer: cycle {}/{} with {} points and {} camera positions",
            snapshot.cycle + 1,
            snapshot.total_cycles,
            snapshot.cloud.len(),
            snapshot.vision_positions.len()
        );
        Ok(())
    }
}

/// Writes `preview_cycle_NNNN.ply` per snapshot: the cloud followed by the
/// vision (green) and reported (red) camera positions.
#[derive(Debug, Clone)]
pub struct PlyPreviewSink {
    dir: PathBuf,
    format: PlyFormat,
}

impl PlyPreviewSink {
    pub fn new(dir: PathBuf, format: PlyFormat) -> Self {
        Self { dir, format }
    }

    pub fn preview_path(&self, cycle: usize) -> PathBuf {
        self.dir.join(format!("preview_cycle_{cycle:04}.ply"))
    }
}

impl VizSink for PlyPreviewSink {
    fn push(&mut self, snapshot: &VizSnapshot) -> Result<(), VizError> {
        let mut preview = snapshot.cloud.clone();
        preview.append(PointCloud::from_positions(&snapshot.vision_positions, VISION_POSITION_COLOR));
        preview.append(PointCloud::from_positions(&snapshot.reported_positions, REPORTED_POSITION_COLOR));
        ply::save_cloud(&self.preview_path(snapshot.cycle), &preview, self.format)?;
        Ok(())
    }
}

/// Forwards snapshots to an external viewer over a single-slot channel.
/// A snapshot is dropped when the viewer has not taken the previous one.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: Sender<VizSnapshot>,
}

impl ChannelSink {
    pub fn bounded() -> (Self, Receiver<VizSnapshot>) {
        let (sender, receiver) = bounded(1);
        (Self { sender }, receiver)
    }
}

impl VizSink for ChannelSink {
    fn push(&mut self, snapshot: &VizSnapshot) -> Result<(), VizError> {
        self.sender.try_send(snapshot.clone()).map_err(|e| match e {
            TrySendError::Full(_) => VizError::Busy,
            TrySendError::Disconnected(_) => VizError::Disconnected,
        })
    }
}

type InFlight = JoinHandle<(Box<dyn VizSink>, Result<(), VizError>)>;

pub struct VizHandoff {
    sink: Option<Box<dyn VizSink>>,
    in_flight: Option<InFlight>,
    preview_voxel_size: Option<f32>,
    launched: usize,
    failures: usize,
}

impl VizHandoff {
    pub fn new(sink: Box<dyn VizSink>) -> Self {
        Self {
            sink: Some(sink),
            in_flight: None,
            preview_voxel_size: None,
            launched: 0,
            failures: 0,
        }
    }

    /// Downsample snapshots on the background thread before pushing.
    pub fn with_preview_voxel_size(mut self, voxel_size: Option<f32>) -> Self {
        self.preview_voxel_size = voxel_size;
        self
    }

    /// Join the previous handoff, then push `snapshot` on a new thread.
    pub fn launch(&mut self, mut snapshot: VizSnapshot) {
        self.join_in_flight();
        let Some(mut sink) = self.sink.take() else {
            log::debug!("viewer disabled, skipping cycle {}", snapshot.cycle);
            return;
        };

        let voxel_size = self.preview_voxel_size;
        let cycle = snapshot.cycle;
        let spawned = thread::Builder::new()
            .name(format!("viz-cycle-{cycle}"))
            .spawn(move || {
                if let Some(size) = voxel_size {
                    snapshot.cloud = VoxelGrid::default().downsample(&snapshot.cloud, size);
                }
                let result = sink.push(&snapshot);
                (sink, result)
            });

        match spawned {
            Ok(handle) => {
                self.in_flight = Some(handle);
                self.launched += 1;
            }
            Err(e) => {
                self.failures += 1;
                log::warn!("failed to start viewer thread for cycle {cycle}, viewer disabled: {e}");
            }
        }
    }

    /// Wait for the outstanding handoff, if any.
    pub fn join_in_flight(&mut self) {
        let Some(handle) = self.in_flight.take() else {
            return;
        };
        match handle.join() {
            Ok((sink, result)) => {
                self.sink = Some(sink);
                if let Err(e) = result {
                    self.failures += 1;
                    log::warn!("viewer sink failed: {e}");
                }
            }
            Err(_) => {
                self.failures += 1;
                log::warn!("viewer thread panicked, viewer disabled");
            }
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn launched(&self) -> usize {
        self.launched
    }

    pub fn failures(&self) -> usize {
        self.failures
    }

    /// Join any outstanding handoff and return the failure count.
    pub fn finish(mut self) -> usize {
        self.join_in_flight();
        self.failures
    }
}

impl Drop for VizHandoff {
    fn drop(&mut self) {
        self.join_in_flight();
    }
}
