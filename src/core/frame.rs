//! Input frames: reported pose plus per-pixel 3-D data.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::point_cloud::ColoredPoint;
use super::pose::{PoseError, SE3};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("grid of {width}x{height} needs {expected} points, got {actual}")]
    DimensionMismatch {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
}

/// Pose as reported by the external positioning source, before validation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReportedPose {
    pub position: [f64; 3],
    /// Orientation quaternion in `[x, y, z, w]` order.
    pub orientation: [f64; 4],
}

impl ReportedPose {
    pub fn new(position: [f64; 3], orientation: [f64; 4]) -> Self {
        Self {
            position,
            orientation,
        }
    }

    pub fn from_se3(transform: &SE3) -> Self {
        let q = transform.rotation();
        Self {
            position: transform.translation().to_array(),
            orientation: [q.x, q.y, q.z, q.w],
        }
    }

    /// Absolute camera-to-world transform for this pose.
    pub fn to_se3(&self) -> Result<SE3, PoseError> {
        SE3::from_xyzw(self.orientation, self.position)
    }
}

/// A keypoint with a track identifier assigned by the external matcher.
/// Two keypoints in different frames with the same `track_id` observe the
/// same scene point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackedKeypoint {
    pub track_id: u64,
    pub u: u32,
    pub v: u32,
}

/// Organized, row-major grid of camera-frame points. Invalid pixels hold a
/// non-finite position.
#[derive(Debug, Clone, PartialEq)]
pub struct PointGrid {
    width: u32,
    height: u32,
    points: Vec<ColoredPoint>,
}

impl PointGrid {
    pub fn new(width: u32, height: u32, points: Vec<ColoredPoint>) -> Result<Self, FrameError> {
        let expected = width as usize * height as usize;
        if points.len() != expected {
            return Err(FrameError::DimensionMismatch {
                width,
                height,
                expected,
                actual: points.len(),
            });
        }
        Ok(Self {
            width,
            height,
            points,
        })
    }

    pub fn empty() -> Self {
        Self {
            width: 0,
            height: 0,
            points: Vec::new(),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn points(&self) -> &[ColoredPoint] {
        &self.points
    }

    /// Valid point at pixel `(u, v)`, if any.
    pub fn get(&self, u: u32, v: u32) -> Option<&ColoredPoint> {
        if u >= self.width || v >= self.height {
            return None;
        }
        let point = &self.points[v as usize * self.width as usize + u as usize];
        point.is_valid().then_some(point)
    }

    pub fn valid_count(&self) -> usize {
        self.points.iter().filter(|p| p.is_valid()).count()
    }
}

/// One camera frame. Immutable once ingested; shared between pipeline stages
/// behind an `Arc`.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    index: usize,
    timestamp: Option<f64>,
    pose: ReportedPose,
    grid: PointGrid,
    keypoints: Vec<TrackedKeypoint>,
}

impl Frame {
    pub fn new(index: usize, pose: ReportedPose, grid: PointGrid) -> Self {
        Self {
            index,
            timestamp: None,
            pose,
            grid,
            keypoints: Vec::new(),
        }
    }

    pub fn with_keypoints(mut self, keypoints: Vec<TrackedKeypoint>) -> Self {
        self.keypoints = keypoints;
        self
    }

    pub fn with_timestamp(mut self, timestamp: f64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn timestamp(&self) -> Option<f64> {
        self.timestamp
    }

    pub fn pose(&self) -> &ReportedPose {
        &self.pose
    }

    pub fn grid(&self) -> &PointGrid {
        &self.grid
    }

    pub fn keypoints(&self) -> &[TrackedKeypoint] {
        &self.keypoints
    }

    /// Local 3-D position of a keypoint, if its pixel holds a valid point.
    pub fn keypoint_point(&self, keypoint: &TrackedKeypoint) -> Option<&ColoredPoint> {
        self.grid.get(keypoint.u, keypoint.v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn test_grid_dimension_check() {
        let err = PointGrid::new(2, 2, vec![ColoredPoint::invalid(); 3]).unwrap_err();
        assert_eq!(
            err,
            FrameError::DimensionMismatch {
                width: 2,
                height: 2,
                expected: 4,
                actual: 3
            }
        );
    }

    #[test]
    fn test_grid_get_skips_invalid() {
        let points = vec![
            ColoredPoint::new(Vec3::new(0.0, 0.0, 1.0), [1, 2, 3]),
            ColoredPoint::invalid(),
        ];
        let grid = PointGrid::new(2, 1, points).unwrap();
        assert!(grid.get(0, 0).is_some());
        assert!(grid.get(1, 0).is_none());
        assert!(grid.get(5, 0).is_none());
        assert_eq!(grid.valid_count(), 1);
    }

    #[test]
    fn test_reported_pose_roundtrip() {
        let t = SE3::from_axis_angle(glam::DVec3::X, 0.2, glam::DVec3::new(5.0, 6.0, 7.0));
        let pose = ReportedPose::from_se3(&t);
        assert!(pose.to_se3().unwrap().approx_eq(&t, 1e-12));
    }
}
