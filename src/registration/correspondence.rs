//! Relative-transform estimation between the current frame and the recent
//! window of already-placed frames.

use std::collections::HashMap;

use glam::DVec3;
use thiserror::Error;

use super::alignment::{AlignmentError, KabschAligner, RigidAligner};
use crate::core::{Frame, SE3};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EstimationError {
    #[error("no previously placed frames to match against")]
    EmptyWindow,
    #[error("found {found} correspondences, need at least {required}")]
    InsufficientMatches { found: usize, required: usize },
    #[error("fit failed: {0}")]
    Fit(#[from] AlignmentError),
}

/// A frame already on the vision chain, with its current vision transform.
#[derive(Debug, Clone, Copy)]
pub struct PlacedFrame<'a> {
    pub frame: &'a Frame,
    pub vision: SE3,
}

/// Produces `T_rel` such that `T_rel * T_reported` places the current frame
/// consistently with the window.
pub trait CorrespondenceEstimator: Send {
    fn estimate(
        &mut self,
        frame: &Frame,
        reported: &SE3,
        window: &[PlacedFrame<'_>],
    ) -> Result<SE3, EstimationError>;
}

/// Trusts the reported pose completely.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityEstimator;

impl CorrespondenceEstimator for IdentityEstimator {
    fn estimate(
        &mut self,
        _frame: &Frame,
        _reported: &SE3,
        _window: &[PlacedFrame<'_>],
    ) -> Result<SE3, EstimationError> {
        Ok(SE3::identity())
    }
}

/// Pairs keypoints by track id with the window and fits a rigid transform
/// between the reported-placed current points and the vision-placed prior
/// points.
///
/// Each track is matched against the most recent window frame that observes
/// it with a valid 3-D point.
pub struct TrackMatchEstimator {
    min_matches: usize,
    aligner: Box<dyn RigidAligner>,
}

impl TrackMatchEstimator {
    pub fn new(min_matches: usize) -> Self {
        Self {
            min_matches,
            aligner: Box::new(KabschAligner::new()),
        }
    }

    pub fn with_aligner(mut self, aligner: Box<dyn RigidAligner>) -> Self {
        self.aligner = aligner;
        self
    }

    pub fn min_matches(&self) -> usize {
        self.min_matches
    }

    /// World-space correspondences `(current via reported, prior via vision)`.
    pub fn correspondences(
        frame: &Frame,
        reported: &SE3,
        window: &[PlacedFrame<'_>],
    ) -> (Vec<DVec3>, Vec<DVec3>) {
        let indexed: Vec<HashMap<u64, DVec3>> = window
            .iter()
            .map(|placed| {
                placed
                    .frame
                    .keypoints()
                    .iter()
                    .filter_map(|kp| {
                        placed.frame.keypoint_point(kp).map(|p| {
                            (kp.track_id, placed.vision.transform_point(p.position.as_dvec3()))
                        })
                    })
                    .collect()
            })
            .collect();

        let mut source = Vec::new();
        let mut target = Vec::new();
        for keypoint in frame.keypoints() {
            let Some(point) = frame.keypoint_point(keypoint) else {
                continue;
            };
            let prior = indexed
                .iter()
                .rev()
                .find_map(|tracks| tracks.get(&keypoint.track_id));
            if let Some(prior) = prior {
                source.push(reported.transform_point(point.position.as_dvec3()));
                target.push(*prior);
            }
        }
        (source, target)
    }
}

impl CorrespondenceEstimator for TrackMatchEstimator {
    fn estimate(
        &mut self,
        frame: &Frame,
        reported: &SE3,
        window: &[PlacedFrame<'_>],
    ) -> Result<SE3, EstimationError> {
        if window.is_empty() {
            return Err(EstimationError::EmptyWindow);
        }
        let (source, target) = Self::correspondences(frame, reported, window);
        if source.len() < self.min_matches.max(1) {
            return Err(EstimationError::InsufficientMatches {
                found: source.len(),
                required: self.min_matches.max(1),
            });
        }
        log::debug!(
            "frame {}: {} track correspondences against {} window frames",
            frame.index(),
            source.len(),
            window.len()
        );
        Ok(self.aligner.align(&source, &target)?)
    }
}
