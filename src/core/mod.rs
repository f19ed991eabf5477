//! Core data structures: rigid transforms, point clouds and frames.

pub mod frame;
pub mod point_cloud;
pub mod pose;

pub use frame::{Frame, FrameError, PointGrid, ReportedPose, TrackedKeypoint};
pub use point_cloud::{ColoredPoint, PointCloud};
pub use pose::{PoseError, SE3};
