//! Rigid alignment of paired point sets.

use glam::{DMat3, DQuat, DVec3};
use nalgebra::{Matrix3, Vector3};
use thiserror::Error;

use crate::core::SE3;

/// Singular values below this fraction of the largest are treated as zero
/// when deciding whether the cross-covariance constrains a full rotation.
const RANK_TOLERANCE: f64 = 1e-9;

/// A set whose points all lie within this fraction of its coordinate scale
/// of the centroid is treated as a single point.
const COINCIDENT_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AlignmentError {
    #[error("point sets differ in size: {source_len} source vs {target_len} target")]
    CardinalityMismatch { source_len: usize, target_len: usize },
    #[error("cannot align empty point sets")]
    Empty,
    #[error("point sets contain non-finite coordinates")]
    NonFinite,
    #[error("singular value decomposition did not produce U and V")]
    SvdFailed,
    #[error("alignment did not converge: {0}")]
    NotConverged(String),
}

/// Computes the rigid transform `T` minimizing `sum |T * source[i] - target[i]|^2`.
pub trait RigidAligner: Send {
    fn align(&self, source: &[DVec3], target: &[DVec3]) -> Result<SE3, AlignmentError>;
}

/// Closed-form least-squares alignment (Kabsch with reflection guard).
///
/// When the cross-covariance has rank one (two pairs, or collinear sets) the
/// rotation is the shortest arc taking the dominant source direction onto
/// the dominant target direction. Any roll about that line leaves the
/// residual unchanged. Only a coincident set (including a single pair)
/// reduces to the centroid offset.
#[derive(Debug, Clone, Copy, Default)]
pub struct KabschAligner;

impl KabschAligner {
    pub fn new() -> Self {
        Self
    }
}

impl RigidAligner for KabschAligner {
    fn align(&self, source: &[DVec3], target: &[DVec3]) -> Result<SE3, AlignmentError> {
        if source.len() != target.len() {
            return Err(AlignmentError::CardinalityMismatch {
                source_len: source.len(),
                target_len: target.len(),
            });
        }
        if source.is_empty() {
            return Err(AlignmentError::Empty);
        }
        if source.iter().chain(target.iter()).any(|p| !p.is_finite()) {
            return Err(AlignmentError::NonFinite);
        }

        let n = source.len() as f64;
        let source_centroid = source.iter().copied().sum::<DVec3>() / n;
        let target_centroid = target.iter().copied().sum::<DVec3>() / n;

        let translation_only = || SE3::from_translation(target_centroid - source_centroid);
        let source_extent = max_distance(source, source_centroid);
        let target_extent = max_distance(target, target_centroid);
        let scale = 1.0 + source_centroid.length().max(target_centroid.length());
        if source_extent <= COINCIDENT_TOLERANCE * scale || target_extent <= COINCIDENT_TOLERANCE * scale {
            return Ok(translation_only());
        }

        let mut sigma = Matrix3::<f64>::zeros();
        for (s, t) in source.iter().zip(target.iter()) {
            let p = to_vector(*s - source_centroid);
            let q = to_vector(*t - target_centroid);
            sigma += q * p.transpose();
        }

        let svd = sigma.svd(true, true);
        let singular = svd.singular_values;
        let largest = singular.max();
        if largest <= RANK_TOLERANCE * source_extent * target_extent {
            // Uncorrelated sets: no rotation is preferred over another.
            return Ok(translation_only());
        }
        let rank = singular.iter().filter(|s| **s > largest * RANK_TOLERANCE).count();

        let u = svd.u.ok_or(AlignmentError::SvdFailed)?;
        let v_t = svd.v_t.ok_or(AlignmentError::SvdFailed)?;

        let rotation = if rank <= 1 {
            let k = singular.imax();
            let from = DVec3::new(v_t[(k, 0)], v_t[(k, 1)], v_t[(k, 2)]);
            let to = DVec3::new(u[(0, k)], u[(1, k)], u[(2, k)]);
            DQuat::from_rotation_arc(from.normalize(), to.normalize())
        } else {
            // Flip the axis of the smallest singular value if U V^T is a reflection.
            let mut d = Matrix3::<f64>::identity();
            if (u * v_t).determinant() < 0.0 {
                let smallest = singular.imin();
                d[(smallest, smallest)] = -1.0;
            }
            let r = u * d * v_t;
            DQuat::from_mat3(&DMat3::from_cols(
                DVec3::new(r[(0, 0)], r[(1, 0)], r[(2, 0)]),
                DVec3::new(r[(0, 1)], r[(1, 1)], r[(2, 1)]),
                DVec3::new(r[(0, 2)], r[(1, 2)], r[(2, 2)]),
            ))
        };
        let translation = target_centroid - rotation * source_centroid;

        SE3::from_rotation_translation(rotation, translation)
            .map_err(|e| AlignmentError::NotConverged(e.to_string()))
    }
}

fn to_vector(v: DVec3) -> Vector3<f64> {
    Vector3::new(v.x, v.y, v.z)
}

fn max_distance(points: &[DVec3], centre: DVec3) -> f64 {
    points.iter().map(|p| p.distance(centre)).fold(0.0, f64::max)
}

/// Root-mean-square residual of `transform` over the paired sets.
pub fn rms_error(transform: &SE3, source: &[DVec3], target: &[DVec3]) -> f64 {
    let n = source.len().min(target.len());
    if n == 0 {
        return 0.0;
    }
    let sum: f64 = source
        .iter()
        .zip(target.iter())
        .map(|(s, t)| transform.transform_point(*s).distance_squared(*t))
        .sum();
    (sum / n as f64).sqrt()
}
