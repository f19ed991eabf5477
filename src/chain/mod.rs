//! Reported and vision-corrected transform chains.
//!
//! The chain is event sourced: every vision placement is stored as it was
//! first computed (`vision_base`), and every drift correction is appended to a
//! correction log. The effective vision chain is kept up to date eagerly and
//! [`TransformChain::replay`] recomputes it from the log, which keeps the
//! retroactive rewrites auditable.

use glam::DVec3;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{Frame, PointCloud, PoseError, SE3};

/// Color of reported camera positions in exported clouds.
pub const REPORTED_POSITION_COLOR: [u8; 3] = [255, 0, 0];
/// Color of vision camera positions in exported clouds.
pub const VISION_POSITION_COLOR: [u8; 3] = [0, 255, 0];

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("frame {index} has a malformed reported pose: {source}")]
    MalformedPose {
        index: usize,
        #[source]
        source: PoseError,
    },
    #[error("expected frame {expected}, got frame {actual}")]
    OutOfOrder { expected: usize, actual: usize },
    #[error("frame {index} has no reported transform yet")]
    MissingReported { index: usize },
    #[error("correction frontier {upto} is outside the vision chain (len {len})")]
    FrontierOutOfRange { upto: usize, len: usize },
    #[error("frame {index} is not in the vision chain")]
    UnknownFrame { index: usize },
}

/// One drift correction: `transform` was left-multiplied onto every vision
/// transform with index `<= upto_index`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CorrectionEvent {
    pub transform: SE3,
    pub upto_index: usize,
}

#[derive(Debug, Clone, Default)]
pub struct TransformChain {
    reported: Vec<SE3>,
    vision_base: Vec<SE3>,
    vision: Vec<SE3>,
    corrections: Vec<CorrectionEvent>,
    degraded: Vec<bool>,
    reported_positions: Vec<DVec3>,
    vision_positions: Vec<DVec3>,
}

impl TransformChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of frames with a reported transform.
    pub fn len(&self) -> usize {
        self.reported.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reported.is_empty()
    }

    /// Number of frames placed on the vision chain.
    pub fn vision_len(&self) -> usize {
        self.vision.len()
    }

    /// Append the reported transform for `frame`, which must be the next
    /// frame in index order.
    pub fn append_reported(&mut self, frame: &Frame) -> Result<SE3, ChainError> {
        let expected = self.reported.len();
        if frame.index() != expected {
            return Err(ChainError::OutOfOrder {
                expected,
                actual: frame.index(),
            });
        }
        let transform = frame
            .pose()
            .to_se3()
            .map_err(|source| ChainError::MalformedPose {
                index: frame.index(),
                source,
            })?;
        self.reported.push(transform);
        self.reported_positions.push(transform.translation());
        Ok(transform)
    }

    /// Place frame `index` on the vision chain. Frame 0 anchors both chains
    /// and ignores `relative`; later frames get `relative * T_reported[index]`.
    pub fn append_vision(&mut self, index: usize, relative: &SE3) -> Result<SE3, ChainError> {
        let expected = self.vision.len();
        if index != expected {
            return Err(ChainError::OutOfOrder {
                expected,
                actual: index,
            });
        }
        let reported = self
            .reported
            .get(index)
            .copied()
            .ok_or(ChainError::MissingReported { index })?;

        let transform = if index == 0 {
            reported
        } else {
            *relative * reported
        };
        self.vision_base.push(transform);
        self.vision.push(transform);
        self.degraded.push(false);
        self.vision_positions.push(transform.translation());
        Ok(transform)
    }

    /// Flag a placed frame whose relative transform came from a fallback.
    pub fn mark_degraded(&mut self, index: usize) -> Result<(), ChainError> {
        let flag = self
            .degraded
            .get_mut(index)
            .ok_or(ChainError::UnknownFrame { index })?;
        *flag = true;
        Ok(())
    }

    /// Left-multiply every vision transform in `[0, upto_index]` by
    /// `correction` and refresh the matching camera positions.
    pub fn apply_correction(&mut self, correction: SE3, upto_index: usize) -> Result<(), ChainError> {
        if upto_index >= self.vision.len() {
            return Err(ChainError::FrontierOutOfRange {
                upto: upto_index,
                len: self.vision.len(),
            });
        }
        self.corrections.push(CorrectionEvent {
            transform: correction,
            upto_index,
        });
        if correction.is_identity() {
            return Ok(());
        }
        for (transform, position) in self.vision[..=upto_index]
            .iter_mut()
            .zip(self.vision_positions[..=upto_index].iter_mut())
        {
            *transform = correction * *transform;
            *position = transform.translation();
        }
        Ok(())
    }

    /// Recompute the effective vision chain from the base placements and the
    /// correction log. Matches [`TransformChain::vision`] exactly.
    pub fn replay(&self) -> Vec<SE3> {
        self.vision_base
            .iter()
            .enumerate()
            .map(|(index, base)| {
                self.corrections
                    .iter()
                    .filter(|event| event.upto_index >= index && !event.transform.is_identity())
                    .fold(*base, |acc, event| event.transform * acc)
            })
            .collect()
    }

    /// Product of every correction that has touched frame `index`, in
    /// application order (latest leftmost).
    pub fn cumulative_correction(&self, index: usize) -> SE3 {
        self.corrections
            .iter()
            .filter(|event| event.upto_index >= index)
            .fold(SE3::identity(), |acc, event| event.transform * acc)
    }

    pub fn reported(&self) -> &[SE3] {
        &self.reported
    }

    pub fn vision(&self) -> &[SE3] {
        &self.vision
    }

    /// Vision placements as first computed, before any correction.
    pub fn vision_base(&self) -> &[SE3] {
        &self.vision_base
    }

    pub fn reported_at(&self, index: usize) -> Option<&SE3> {
        self.reported.get(index)
    }

    pub fn vision_at(&self, index: usize) -> Option<&SE3> {
        self.vision.get(index)
    }

    pub fn corrections(&self) -> &[CorrectionEvent] {
        &self.corrections
    }

    pub fn reported_positions(&self) -> &[DVec3] {
        &self.reported_positions
    }

    pub fn vision_positions(&self) -> &[DVec3] {
        &self.vision_positions
    }

    pub fn is_degraded(&self, index: usize) -> bool {
        self.degraded.get(index).copied().unwrap_or(false)
    }

    pub fn degraded_frames(&self) -> Vec<usize> {
        self.degraded
            .iter()
            .enumerate()
            .filter_map(|(index, flag)| flag.then_some(index))
            .collect()
    }

    pub fn reported_position_cloud(&self) -> PointCloud {
        PointCloud::from_positions(&self.reported_positions, REPORTED_POSITION_COLOR)
    }

    pub fn vision_position_cloud(&self) -> PointCloud {
        PointCloud::from_positions(&self.vision_positions, VISION_POSITION_COLOR)
    }

    /// Vision positions followed by reported positions.
    pub fn combined_position_cloud(&self) -> PointCloud {
        let mut combined = self.vision_position_cloud();
        combined.append(self.reported_position_cloud());
        combined
    }

    /// RMS distance between vision and reported camera positions over
    /// `[0, upto_index]`.
    pub fn rms_position_error(&self, upto_index: usize) -> f64 {
        let n = (upto_index + 1)
            .min(self.vision_positions.len())
            .min(self.reported_positions.len());
        rms_distance(&self.vision_positions[..n], &self.reported_positions[..n])
    }
}

/// Root-mean-square distance between index-aligned point sets.
pub fn rms_distance(a: &[DVec3], b: &[DVec3]) -> f64 {
    let n = a.len().min(b.len());
    if n == 0 {
        return 0.0;
    }
    let sum: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(p, q)| p.distance_squared(*q))
        .sum();
    (sum / n as f64).sqrt()
}
