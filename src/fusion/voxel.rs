//! Voxel-grid downsampling.

use std::collections::HashMap;

use glam::{DVec3, Vec3};

use crate::core::{ColoredPoint, PointCloud};

/// Deterministic cloud reduction.
pub trait Downsampler: Send + Sync {
    fn downsample(&self, cloud: &PointCloud, voxel_size: f32) -> PointCloud;
}

#[derive(Debug, Default)]
struct VoxelAccumulator {
    position: DVec3,
    color: [u64; 3],
    count: u64,
}

impl VoxelAccumulator {
    fn add(&mut self, point: &ColoredPoint) {
        self.position += point.position.as_dvec3();
        for (acc, c) in self.color.iter_mut().zip(point.color) {
            *acc += u64::from(c);
        }
        self.count += 1;
    }

    fn mean(&self) -> ColoredPoint {
        let n = self.count as f64;
        let color = self.color.map(|c| ((c as f64 / n).round()) as u8);
        ColoredPoint::new((self.position / n).as_vec3(), color)
    }
}

/// Replaces the points of each occupied voxel by their centroid and mean
/// color. Output order follows the first occurrence of each voxel.
#[derive(Debug, Clone, Copy)]
pub struct VoxelGrid {
    pub min_points: u32,
}

impl Default for VoxelGrid {
    fn default() -> Self {
        Self { min_points: 1 }
    }
}

impl VoxelGrid {
    pub fn new(min_points: u32) -> Self {
        Self { min_points }
    }

    fn key(position: Vec3, inv_size: f64) -> (i64, i64, i64) {
        let p = position.as_dvec3() * inv_size;
        (p.x.floor() as i64, p.y.floor() as i64, p.z.floor() as i64)
    }
}

impl Downsampler for VoxelGrid {
    fn downsample(&self, cloud: &PointCloud, voxel_size: f32) -> PointCloud {
        if !(voxel_size > 0.0) || !voxel_size.is_finite() {
            return cloud.clone();
        }
        let inv_size = 1.0 / voxel_size as f64;

        let mut slots: HashMap<(i64, i64, i64), usize> = HashMap::new();
        let mut voxels: Vec<VoxelAccumulator> = Vec::new();
        for point in cloud.iter().filter(|p| p.is_valid()) {
            let slot = *slots
                .entry(Self::key(point.position, inv_size))
                .or_insert_with(|| {
                    voxels.push(VoxelAccumulator::default());
                    voxels.len() - 1
                });
            voxels[slot].add(point);
        }

        let min_points = u64::from(self.min_points.max(1));
        voxels
            .iter()
            .filter(|v| v.count >= min_points)
            .map(VoxelAccumulator::mean)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(x: f32, y: f32, z: f32, c: u8) -> ColoredPoint {
        ColoredPoint::new(Vec3::new(x, y, z), [c, c, c])
    }

    #[test]
    fn test_merges_points_in_same_voxel() {
        let cloud = PointCloud::from_points(vec![p(0.1, 0.1, 0.1, 10), p(0.3, 0.3, 0.3, 20), p(1.5, 0.0, 0.0, 0)]);
        let out = VoxelGrid::default().downsample(&cloud, 1.0);
        assert_eq!(out.len(), 2);
        assert!((out.points()[0].position - Vec3::splat(0.2)).length() < 1e-6);
        assert_eq!(out.points()[0].color, [15, 15, 15]);
        assert_eq!(out.points()[1].position, Vec3::new(1.5, 0.0, 0.0));
    }

    #[test]
    fn test_first_occurrence_order() {
        let cloud = PointCloud::from_points(vec![p(5.0, 0.0, 0.0, 1), p(0.0, 0.0, 0.0, 2), p(5.2, 0.0, 0.0, 3)]);
        let out = VoxelGrid::default().downsample(&cloud, 1.0);
        assert_eq!(out.points()[0].color, [2, 2, 2]);
        assert_eq!(out.points()[1].color, [2, 2, 2]);
        assert!(out.points()[0].position.x > 5.0);
    }

    #[test]
    fn test_negative_coordinates_use_floor() {
        let cloud = PointCloud::from_points(vec![p(-0.1, 0.0, 0.0, 0), p(0.1, 0.0, 0.0, 0)]);
        assert_eq!(VoxelGrid::default().downsample(&cloud, 1.0).len(), 2);
    }

    #[test]
    fn test_crowded_voxel_color_does_not_wrap() {
        let crowded = 20_000_000u64;
        let mut voxel = VoxelAccumulator {
            position: DVec3::ZERO,
            color: [255 * crowded; 3],
            count: crowded,
        };
        voxel.add(&p(0.0, 0.0, 0.0, 255));
        assert_eq!(voxel.mean().color, [255, 255, 255]);
    }

    #[test]
    fn test_min_points_drops_sparse_voxels() {
        let cloud = PointCloud::from_points(vec![p(0.1, 0.0, 0.0, 0), p(0.2, 0.0, 0.0, 0), p(3.0, 0.0, 0.0, 0)]);
        let out = VoxelGrid::new(2).downsample(&cloud, 1.0);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_deterministic() {
        let cloud: PointCloud = (0..500)
            .map(|i| p((i as f32 * 0.37).sin() * 3.0, (i as f32 * 0.11).cos(), i as f32 * 0.01, (i % 200) as u8))
            .collect();
        let grid = VoxelGrid::default();
        assert_eq!(grid.downsample(&cloud, 0.25), grid.downsample(&cloud, 0.25));
    }

    #[test]
    fn test_non_positive_size_is_passthrough() {
        let cloud = PointCloud::from_points(vec![p(0.1, 0.0, 0.0, 0), p(0.2, 0.0, 0.0, 0)]);
        assert_eq!(VoxelGrid::default().downsample(&cloud, 0.0), cloud);
    }
}
