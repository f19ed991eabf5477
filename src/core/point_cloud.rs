//! Colored point clouds.

use glam::{DVec3, Vec3};
use rayon::prelude::*;

use super::pose::SE3;

/// A single XYZRGB point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColoredPoint {
    pub position: Vec3,
    pub color: [u8; 3],
}

impl ColoredPoint {
    pub fn new(position: Vec3, color: [u8; 3]) -> Self {
        Self { position, color }
    }

    /// Placeholder for an empty pixel in an organized grid.
    pub fn invalid() -> Self {
        Self {
            position: Vec3::splat(f32::NAN),
            color: [0, 0, 0],
        }
    }

    pub fn is_valid(&self) -> bool {
        self.position.is_finite()
    }
}

/// An unorganized list of colored points.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointCloud {
    points: Vec<ColoredPoint>,
}

impl PointCloud {
    pub fn new() -> Self {
        Self { points: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            points: Vec::with_capacity(capacity),
        }
    }

    pub fn from_points(points: Vec<ColoredPoint>) -> Self {
        Self { points }
    }

    /// Cloud of positions painted a single color.
    pub fn from_positions(positions: &[DVec3], color: [u8; 3]) -> Self {
        Self {
            points: positions
                .iter()
                .map(|p| ColoredPoint::new(p.as_vec3(), color))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[ColoredPoint] {
        &self.points
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ColoredPoint> {
        self.points.iter()
    }

    pub fn push(&mut self, point: ColoredPoint) {
        self.points.push(point);
    }

    /// Append all points of `other`, preserving their order.
    pub fn extend_from(&mut self, other: &PointCloud) {
        self.points.extend_from_slice(&other.points);
    }

    pub fn append(&mut self, mut other: PointCloud) {
        if self.points.is_empty() {
            self.points = other.points;
        } else {
            self.points.append(&mut other.points);
        }
    }

    pub fn into_points(self) -> Vec<ColoredPoint> {
        self.points
    }

    pub fn transformed(&self, transform: &SE3) -> PointCloud {
        PointCloud {
            points: self
                .points
                .iter()
                .map(|p| ColoredPoint::new(transform.transform_point_f32(p.position), p.color))
                .collect(),
        }
    }

    /// Apply `transform` to every point. Points are independent, so the pass
    /// runs on the current rayon pool and yields the same values as a
    /// sequential loop.
    pub fn transform_in_place(&mut self, transform: &SE3) {
        if transform.is_identity() {
            return;
        }
        self.points.par_iter_mut().for_each(|p| {
            p.position = transform.transform_point_f32(p.position);
        });
    }

    pub fn centroid(&self) -> Option<DVec3> {
        if self.points.is_empty() {
            return None;
        }
        let sum = self
            .points
            .iter()
            .fold(DVec3::ZERO, |acc, p| acc + p.position.as_dvec3());
        Some(sum / self.points.len() as f64)
    }

    pub fn positions_f64(&self) -> Vec<DVec3> {
        self.points.iter().map(|p| p.position.as_dvec3()).collect()
    }
}

impl FromIterator<ColoredPoint> for PointCloud {
    fn from_iter<I: IntoIterator<Item = ColoredPoint>>(iter: I) -> Self {
        Self {
            points: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a PointCloud {
    type Item = &'a ColoredPoint;
    type IntoIter = std::slice::Iter<'a, ColoredPoint>;

    fn into_iter(self) -> Self::IntoIter {
        self.points.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PointCloud {
        PointCloud::from_points(vec![
            ColoredPoint::new(Vec3::new(1.0, 0.0, 0.0), [255, 0, 0]),
            ColoredPoint::new(Vec3::new(0.0, 2.0, 0.0), [0, 255, 0]),
        ])
    }

    #[test]
    fn test_transform_in_place_matches_transformed() {
        let t = SE3::from_axis_angle(DVec3::Z, 0.4, DVec3::new(1.0, -1.0, 2.0));
        let mut cloud = sample();
        let expected = cloud.transformed(&t);
        cloud.transform_in_place(&t);
        assert_eq!(cloud, expected);
    }

    #[test]
    fn test_identity_leaves_points_untouched() {
        let mut cloud = sample();
        cloud.transform_in_place(&SE3::identity());
        assert_eq!(cloud, sample());
    }

    #[test]
    fn test_append_preserves_order() {
        let mut a = sample();
        a.append(sample());
        assert_eq!(a.len(), 4);
        assert_eq!(a.points()[2].color, [255, 0, 0]);
    }

    #[test]
    fn test_centroid() {
        let c = sample().centroid().unwrap();
        assert!((c - DVec3::new(0.5, 1.0, 0.0)).length() < 1e-9);
        assert!(PointCloud::new().centroid().is_none());
    }
}
