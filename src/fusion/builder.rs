//! Per-frame local cloud construction from organized grids.

use serde::{Deserialize, Serialize};

use super::FusionError;
use crate::core::{Frame, PointCloud};

/// Converts one frame into a local (camera-frame) point cloud.
pub trait CloudBuilder: Send + Sync {
    fn build(&self, frame: &Frame) -> Result<PointCloud, FusionError>;
}

/// Which pixels of the grid contribute points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CloudMode {
    /// Every `pixel_stride`-th row and column.
    #[default]
    Dense,
    /// Neighbourhoods around tracked keypoints only.
    Sparse,
}

#[derive(Debug, Clone)]
pub struct GridCloudBuilder {
    pub mode: CloudMode,
    pub pixel_stride: u32,
    /// Neighbourhood radius in pixels for sparse mode.
    pub range_width: u32,
    /// Points with local depth beyond this are dropped.
    pub max_depth: Option<f32>,
}

impl Default for GridCloudBuilder {
    fn default() -> Self {
        Self {
            mode: CloudMode::Dense,
            pixel_stride: 1,
            range_width: 2,
            max_depth: None,
        }
    }
}

impl GridCloudBuilder {
    pub fn dense(pixel_stride: u32) -> Self {
        Self {
            mode: CloudMode::Dense,
            pixel_stride,
            ..Default::default()
        }
    }

    pub fn sparse(range_width: u32, pixel_stride: u32) -> Self {
        Self {
            mode: CloudMode::Sparse,
            pixel_stride,
            range_width,
            ..Default::default()
        }
    }

    pub fn with_max_depth(mut self, max_depth: Option<f32>) -> Self {
        self.max_depth = max_depth;
        self
    }

    fn within_depth(&self, z: f32) -> bool {
        self.max_depth.map_or(true, |max| z <= max)
    }

    fn build_dense(&self, frame: &Frame) -> PointCloud {
        let grid = frame.grid();
        let stride = self.pixel_stride.max(1) as usize;
        let mut cloud = PointCloud::with_capacity(grid.points().len() / (stride * stride));
        for v in (0..grid.height()).step_by(stride) {
            for u in (0..grid.width()).step_by(stride) {
                if let Some(point) = grid.get(u, v) {
                    if self.within_depth(point.position.z) {
                        cloud.push(*point);
                    }
                }
            }
        }
        cloud
    }

    fn build_sparse(&self, frame: &Frame) -> PointCloud {
        let grid = frame.grid();
        let (width, height) = (grid.width() as i64, grid.height() as i64);
        let stride = self.pixel_stride.max(1) as usize;
        let radius = self.range_width as i64;
        let mut visited = vec![false; grid.points().len()];
        let mut cloud = PointCloud::new();

        for keypoint in frame.keypoints() {
            let (cu, cv) = (keypoint.u as i64, keypoint.v as i64);
            for v in (cv - radius..=cv + radius).step_by(stride) {
                if v < 0 || v >= height {
                    continue;
                }
                for u in (cu - radius..=cu + radius).step_by(stride) {
                    if u < 0 || u >= width {
                        continue;
                    }
                    let slot = (v * width + u) as usize;
                    if visited[slot] {
                        continue;
                    }
                    visited[slot] = true;
                    if let Some(point) = grid.get(u as u32, v as u32) {
                        if self.within_depth(point.position.z) {
                            cloud.push(*point);
                        }
                    }
                }
            }
        }
        cloud
    }
}

impl CloudBuilder for GridCloudBuilder {
    fn build(&self, frame: &Frame) -> Result<PointCloud, FusionError> {
        Ok(match self.mode {
            CloudMode::Dense => self.build_dense(frame),
            CloudMode::Sparse => self.build_sparse(frame),
        })
    }
}
