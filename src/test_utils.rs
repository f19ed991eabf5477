//! Test utilities for rustfuse
//!
//! Synthetic frames, trajectories and scripted collaborators used by the unit
//! tests, the integration tests and the benchmarks.
//!
//! # Examples
//!
//! ```
//! use rustfuse::test_utils::*;
//!
//! let frames = create_sequence(5, 8, 6, TrajectoryType::Line);
//! assert_eq!(frames.len(), 5);
//! ```

use std::collections::HashMap;

use glam::{DVec3, Vec3};

use crate::core::{ColoredPoint, Frame, PointGrid, ReportedPose, TrackedKeypoint, SE3};
use crate::registration::{AlignmentError, CorrespondenceEstimator, EstimationError, PlacedFrame, RigidAligner};

/// Trajectory type for synthetic camera poses
#[derive(Debug, Clone, Copy)]
pub enum TrajectoryType {
    /// Straight line along X at constant altitude
    Line,
    /// Circle around the origin, camera yawing with the motion
    Circle,
}

/// Camera-to-world poses for `n` frames.
pub fn synthetic_poses(n: usize, trajectory: TrajectoryType) -> Vec<SE3> {
    (0..n)
        .map(|i| {
            let t = i as f64;
            match trajectory {
                TrajectoryType::Line => SE3::from_axis_angle(DVec3::Z, 0.02 * t, DVec3::new(2.0 * t, 0.1 * t, 30.0)),
                TrajectoryType::Circle => {
                    let angle = t * std::f64::consts::TAU / n.max(1) as f64;
                    SE3::from_axis_angle(
                        DVec3::Z,
                        angle,
                        DVec3::new(20.0 * angle.cos(), 20.0 * angle.sin(), 30.0),
                    )
                }
            }
        })
        .collect()
}

/// Organized grid of a tilted plane in front of the camera, colored by pixel.
pub fn create_planar_grid(width: u32, height: u32, depth: f32) -> PointGrid {
    let mut points = Vec::with_capacity((width * height) as usize);
    for v in 0..height {
        for u in 0..width {
            let x = (u as f32 - width as f32 / 2.0) * 0.1;
            let y = (v as f32 - height as f32 / 2.0) * 0.1;
            let color = [(u * 17 % 256) as u8, (v * 29 % 256) as u8, 128];
            points.push(ColoredPoint::new(Vec3::new(x, y, depth + 0.05 * x), color));
        }
    }
    // Dimensions and point count agree by construction.
    PointGrid::new(width, height, points).unwrap_or_else(|_| PointGrid::empty())
}

pub fn create_frame(index: usize, pose: &SE3, grid: PointGrid) -> Frame {
    Frame::new(index, ReportedPose::from_se3(pose), grid)
}

/// `n` frames with planar grids along `trajectory`.
pub fn create_sequence(n: usize, width: u32, height: u32, trajectory: TrajectoryType) -> Vec<Frame> {
    synthetic_poses(n, trajectory)
        .iter()
        .enumerate()
        .map(|(i, pose)| create_frame(i, pose, create_planar_grid(width, height, 5.0 + 0.1 * i as f32)))
        .collect()
}

/// Non-planar world landmarks spread below the camera path.
pub fn synthetic_landmarks(count: usize) -> Vec<DVec3> {
    (0..count)
        .map(|i| {
            let t = i as f64;
            DVec3::new(
                (t * 1.7) % 40.0 - 5.0,
                (t * 3.1) % 12.0 - 6.0,
                (t * 0.37).sin() * 2.0,
            )
        })
        .collect()
}

/// A frame observing `landmarks` from `true_pose` but reporting
/// `reported_pose`. The grid is one row; pixel `u` holds landmark `u` and
/// carries keypoint track id `u`.
pub fn create_tracked_frame(index: usize, true_pose: &SE3, reported_pose: &SE3, landmarks: &[DVec3]) -> Frame {
    let to_local = true_pose.inverse();
    let points = landmarks
        .iter()
        .map(|p| ColoredPoint::new(to_local.transform_point(*p).as_vec3(), [200, 200, 200]))
        .collect();
    let grid = PointGrid::new(landmarks.len() as u32, 1, points).unwrap_or_else(|_| PointGrid::empty());
    let keypoints = (0..landmarks.len())
        .map(|u| TrackedKeypoint {
            track_id: u as u64,
            u: u as u32,
            v: 0,
        })
        .collect();
    Frame::new(index, ReportedPose::from_se3(reported_pose), grid).with_keypoints(keypoints)
}

/// Returns a fixed relative transform per frame index; frames listed in
/// `failures` report an estimation error.
#[derive(Debug, Clone, Default)]
pub struct ScriptedEstimator {
    pub relatives: HashMap<usize, SE3>,
    pub default: SE3,
    pub failures: Vec<usize>,
}

impl ScriptedEstimator {
    pub fn constant(relative: SE3) -> Self {
        Self {
            default: relative,
            ..Default::default()
        }
    }

    pub fn failing_on(mut self, frames: &[usize]) -> Self {
        self.failures.extend_from_slice(frames);
        self
    }
}

impl CorrespondenceEstimator for ScriptedEstimator {
    fn estimate(&mut self, frame: &Frame, _reported: &SE3, _window: &[PlacedFrame<'_>]) -> Result<SE3, EstimationError> {
        if self.failures.contains(&frame.index()) {
            return Err(EstimationError::InsufficientMatches { found: 0, required: 1 });
        }
        Ok(self.relatives.get(&frame.index()).copied().unwrap_or(self.default))
    }
}

/// Returns a scripted correction keyed by the number of aligned positions
/// (that is, the correction frontier + 1); identity otherwise.
#[derive(Debug, Clone, Default)]
pub struct ScriptedAligner {
    pub by_len: HashMap<usize, SE3>,
    pub fail_on_len: Option<usize>,
}

impl ScriptedAligner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn at_len(mut self, len: usize, correction: SE3) -> Self {
        self.by_len.insert(len, correction);
        self
    }

    pub fn failing_at_len(mut self, len: usize) -> Self {
        self.fail_on_len = Some(len);
        self
    }
}

impl RigidAligner for ScriptedAligner {
    fn align(&self, source: &[DVec3], _target: &[DVec3]) -> Result<SE3, AlignmentError> {
        if self.fail_on_len == Some(source.len()) {
            return Err(AlignmentError::NotConverged("scripted failure".to_string()));
        }
        Ok(self.by_len.get(&source.len()).copied().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_shape() {
        let frames = create_sequence(3, 4, 2, TrajectoryType::Circle);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[2].index(), 2);
        assert_eq!(frames[0].grid().valid_count(), 8);
    }

    #[test]
    fn test_tracked_frame_reprojects_landmarks() {
        let landmarks = synthetic_landmarks(10);
        let pose = synthetic_poses(4, TrajectoryType::Line)[3];
        let frame = create_tracked_frame(3, &pose, &pose, &landmarks);
        let kp = frame.keypoints()[7];
        let local = frame.keypoint_point(&kp).unwrap().position.as_dvec3();
        assert!((pose.transform_point(local) - landmarks[7]).length() < 1e-4);
    }
}
