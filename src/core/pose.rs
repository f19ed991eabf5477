//! Rigid-body transforms.
//!
//! Both transform chains store absolute camera-to-world transforms as [`SE3`].
//! Rotation is kept as a unit quaternion and translation in double precision,
//! since reported poses are georeferenced and single precision loses
//! centimetres at typical UTM magnitudes.

use std::ops::Mul;

use glam::{DMat3, DMat4, DQuat, DVec3, DVec4, Vec3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tolerance used when deciding whether a 3x3 block is a rotation.
const ORTHONORMAL_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PoseError {
    #[error("non-finite {0} component")]
    NonFinite(&'static str),
    #[error("quaternion with norm {0} cannot be normalized")]
    DegenerateQuaternion(f64),
    #[error("matrix is not a rigid transform (orthonormality error {0:.3e})")]
    NotRigid(f64),
    #[error("matrix has a non-affine bottom row")]
    NotAffine,
}

/// A proper rigid transform: rotation followed by translation, no scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SE3 {
    rotation: DQuat,
    translation: DVec3,
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}

impl SE3 {
    pub const fn identity() -> Self {
        Self {
            rotation: DQuat::IDENTITY,
            translation: DVec3::ZERO,
        }
    }

    /// Build from a rotation and translation. The quaternion is normalized;
    /// a zero or non-finite quaternion is rejected.
    pub fn from_rotation_translation(rotation: DQuat, translation: DVec3) -> Result<Self, PoseError> {
        if !translation.is_finite() {
            return Err(PoseError::NonFinite("translation"));
        }
        if !rotation.is_finite() {
            return Err(PoseError::NonFinite("rotation"));
        }
        let norm = rotation.length();
        if norm < 1e-9 {
            return Err(PoseError::DegenerateQuaternion(norm));
        }
        Ok(Self {
            rotation: rotation / norm,
            translation,
        })
    }

    /// Build from an `[x, y, z, w]` quaternion and an `[x, y, z]` position.
    pub fn from_xyzw(quaternion: [f64; 4], position: [f64; 3]) -> Result<Self, PoseError> {
        Self::from_rotation_translation(
            DQuat::from_xyzw(quaternion[0], quaternion[1], quaternion[2], quaternion[3]),
            DVec3::from_array(position),
        )
    }

    pub fn from_translation(translation: DVec3) -> Self {
        Self {
            rotation: DQuat::IDENTITY,
            translation,
        }
    }

    /// Rotation about `axis` by `angle` radians, followed by `translation`.
    pub fn from_axis_angle(axis: DVec3, angle: f64, translation: DVec3) -> Self {
        Self {
            rotation: DQuat::from_axis_angle(axis.normalize(), angle),
            translation,
        }
    }

    /// Interpret a homogeneous 4x4 matrix as a rigid transform.
    pub fn from_matrix(matrix: &DMat4) -> Result<Self, PoseError> {
        if !matrix.is_finite() {
            return Err(PoseError::NonFinite("matrix"));
        }
        let bottom = matrix.row(3);
        if (bottom - DVec4::new(0.0, 0.0, 0.0, 1.0)).abs().max_element() > ORTHONORMAL_TOLERANCE {
            return Err(PoseError::NotAffine);
        }
        let rotation = DMat3::from_mat4(*matrix);
        let gram = rotation.transpose() * rotation;
        let error = (gram.x_axis - DVec3::X)
            .abs()
            .max_element()
            .max((gram.y_axis - DVec3::Y).abs().max_element())
            .max((gram.z_axis - DVec3::Z).abs().max_element());
        if error > ORTHONORMAL_TOLERANCE || rotation.determinant() <= 0.0 {
            return Err(PoseError::NotRigid(error));
        }
        Self::from_rotation_translation(
            DQuat::from_mat3(&rotation),
            matrix.w_axis.truncate(),
        )
    }

    pub fn to_matrix(&self) -> DMat4 {
        DMat4::from_rotation_translation(self.rotation, self.translation)
    }

    /// Row-major 4x4 representation, handy for reports.
    pub fn to_rows(&self) -> [[f64; 4]; 4] {
        self.to_matrix().transpose().to_cols_array_2d()
    }

    pub fn rotation(&self) -> DQuat {
        self.rotation
    }

    pub fn translation(&self) -> DVec3 {
        self.translation
    }

    pub fn inverse(&self) -> Self {
        let rotation = self.rotation.conjugate();
        Self {
            rotation,
            translation: -(rotation * self.translation),
        }
    }

    pub fn transform_point(&self, point: DVec3) -> DVec3 {
        self.rotation * point + self.translation
    }

    pub fn transform_point_f32(&self, point: Vec3) -> Vec3 {
        self.transform_point(point.as_dvec3()).as_vec3()
    }

    /// Exact identity check. Used to skip no-op corrections so that applying
    /// the identity never perturbs stored values, not even in the last bit.
    pub fn is_identity(&self) -> bool {
        self.rotation == DQuat::IDENTITY && self.translation == DVec3::ZERO
    }

    /// Largest absolute element-wise difference between the two matrices.
    pub fn max_abs_diff(&self, other: &SE3) -> f64 {
        let a = self.to_matrix().to_cols_array();
        let b = other.to_matrix().to_cols_array();
        a.iter()
            .zip(b.iter())
            .map(|(x, y)| (x - y).abs())
            .fold(0.0, f64::max)
    }

    pub fn approx_eq(&self, other: &SE3, tolerance: f64) -> bool {
        self.max_abs_diff(other) <= tolerance
    }
}

impl Mul for SE3 {
    type Output = SE3;

    /// `a * b` applies `b` first, then `a`.
    fn mul(self, rhs: SE3) -> SE3 {
        SE3 {
            rotation: self.rotation * rhs.rotation,
            translation: self.rotation * rhs.translation + self.translation,
        }
    }
}

impl Mul<&SE3> for &SE3 {
    type Output = SE3;

    fn mul(self, rhs: &SE3) -> SE3 {
        *self * *rhs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn test_identity_is_neutral() {
        let t = SE3::from_axis_angle(DVec3::Z, 0.3, DVec3::new(1.0, 2.0, 3.0));
        assert_eq!(SE3::identity() * t, t);
        assert!(SE3::identity().is_identity());
        assert!(!t.is_identity());
    }

    #[test]
    fn test_compose_order() {
        let rotate = SE3::from_axis_angle(DVec3::Z, FRAC_PI_2, DVec3::ZERO);
        let shift = SE3::from_translation(DVec3::new(1.0, 0.0, 0.0));

        // shift first, then rotate: (1,0,0) -> (0,1,0)
        let p = (rotate * shift).transform_point(DVec3::ZERO);
        assert!((p - DVec3::new(0.0, 1.0, 0.0)).length() < 1e-12);

        // rotate first, then shift: origin stays at (1,0,0)
        let q = (shift * rotate).transform_point(DVec3::ZERO);
        assert!((q - DVec3::new(1.0, 0.0, 0.0)).length() < 1e-12);
    }

    #[test]
    fn test_inverse_roundtrip() {
        let t = SE3::from_axis_angle(DVec3::new(1.0, 1.0, 0.0), 0.7, DVec3::new(-4.0, 0.5, 9.0));
        assert!((t * t.inverse()).approx_eq(&SE3::identity(), 1e-12));
    }

    #[test]
    fn test_matrix_roundtrip() {
        let t = SE3::from_axis_angle(DVec3::Y, -1.1, DVec3::new(3.0, -2.0, 0.25));
        let back = SE3::from_matrix(&t.to_matrix()).unwrap();
        assert!(back.approx_eq(&t, 1e-12));
    }

    #[test]
    fn test_rejects_scaled_matrix() {
        let scaled = DMat4::from_scale(DVec3::splat(2.0));
        assert!(matches!(SE3::from_matrix(&scaled), Err(PoseError::NotRigid(_))));
    }

    #[test]
    fn test_rejects_malformed_quaternion() {
        assert!(matches!(
            SE3::from_xyzw([0.0, 0.0, 0.0, 0.0], [0.0; 3]),
            Err(PoseError::DegenerateQuaternion(_))
        ));
        assert!(matches!(
            SE3::from_xyzw([0.0, 0.0, 0.0, 1.0], [f64::NAN, 0.0, 0.0]),
            Err(PoseError::NonFinite("translation"))
        ));
    }

    #[test]
    fn test_quaternion_is_normalized() {
        let t = SE3::from_xyzw([0.0, 0.0, 0.0, 2.0], [0.0; 3]).unwrap();
        assert!((t.rotation().length() - 1.0).abs() < 1e-15);
    }
}
