//! Batched concurrent fusion of per-frame clouds into the accumulated cloud.

use std::sync::Arc;

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use super::builder::CloudBuilder;
use super::voxel::{Downsampler, VoxelGrid};
use super::FusionError;
use crate::core::{Frame, PointCloud, SE3};

/// Owns the accumulated cloud and the worker pool that builds per-frame
/// clouds.
///
/// Frames of a window are processed `batch_width` at a time. Within a batch
/// every frame is built, moved into world space by its vision transform and
/// optionally voxel-downsampled on its own worker; the batch results are then
/// merged in ascending frame index regardless of completion order.
pub struct FusionEngine {
    pool: ThreadPool,
    batch_width: usize,
    builder: Arc<dyn CloudBuilder>,
    frame_downsampler: Box<dyn Downsampler>,
    output_downsampler: Box<dyn Downsampler>,
    frame_voxel_size: Option<f32>,
    cycle_voxel_size: Option<f32>,
    accumulated: PointCloud,
}

impl FusionEngine {
    pub fn new(batch_width: usize, builder: Arc<dyn CloudBuilder>) -> Result<Self, FusionError> {
        let batch_width = batch_width.max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(batch_width)
            .thread_name(|i| format!("fusion-worker-{i}"))
            .build()
            .map_err(|e| FusionError::ThreadPool(e.to_string()))?;
        Ok(Self {
            pool,
            batch_width,
            builder,
            frame_downsampler: Box::new(VoxelGrid::default()),
            output_downsampler: Box::new(VoxelGrid::default()),
            frame_voxel_size: None,
            cycle_voxel_size: None,
            accumulated: PointCloud::new(),
        })
    }

    /// Voxel size applied to every frame cloud after transformation.
    pub fn with_frame_voxel_size(mut self, voxel_size: Option<f32>) -> Self {
        self.frame_voxel_size = voxel_size;
        self
    }

    /// Voxel size applied to each merged cycle cloud before it is committed.
    pub fn with_cycle_voxel_size(mut self, voxel_size: Option<f32>) -> Self {
        self.cycle_voxel_size = voxel_size;
        self
    }

    pub fn with_output_downsampler(mut self, downsampler: Box<dyn Downsampler>) -> Self {
        self.output_downsampler = downsampler;
        self
    }

    pub fn batch_width(&self) -> usize {
        self.batch_width
    }

    /// Build one frame's world-space cloud.
    pub fn fuse_frame(&self, frame: &Frame, transform: &SE3) -> Result<PointCloud, FusionError> {
        let mut cloud = self.builder.build(frame)?;
        cloud.transform_in_place(transform);
        Ok(match self.frame_voxel_size {
            Some(size) => self.frame_downsampler.downsample(&cloud, size),
            None => cloud,
        })
    }

    /// Fuse `frames` using `transforms`, indexed by frame index, and return
    /// the merged cycle cloud. The accumulated cloud is not touched.
    pub fn fuse_window(&self, frames: &[Arc<Frame>], transforms: &[SE3]) -> Result<PointCloud, FusionError> {
        let mut cycle = PointCloud::new();
        for batch in frames.chunks(self.batch_width) {
            let results = self.pool.install(|| {
                batch
                    .par_iter()
                    .map(|frame| {
                        let transform = transforms
                            .get(frame.index())
                            .ok_or(FusionError::MissingTransform { index: frame.index() })?;
                        self.fuse_frame(frame, transform)
                            .map(|cloud| (frame.index(), cloud))
                    })
                    .collect::<Result<Vec<_>, FusionError>>()
            })?;
            cycle.append(merge_in_index_order(results));
        }

        Ok(match self.cycle_voxel_size {
            Some(size) => self.output_downsampler.downsample(&cycle, size),
            None => cycle,
        })
    }

    /// Append a fused cycle cloud to the accumulated cloud.
    pub fn commit(&mut self, cycle: PointCloud) {
        self.accumulated.append(cycle);
    }

    /// Apply a drift correction to everything accumulated so far.
    pub fn apply_correction(&mut self, correction: &SE3) {
        if correction.is_identity() {
            return;
        }
        let accumulated = &mut self.accumulated;
        self.pool.install(|| accumulated.transform_in_place(correction));
    }

    /// Copy of the accumulated cloud for handing to another thread.
    pub fn snapshot(&self) -> PointCloud {
        self.accumulated.clone()
    }

    /// Accumulated cloud reduced with the output downsampler.
    pub fn downsampled(&self, voxel_size: f32) -> PointCloud {
        self.output_downsampler.downsample(&self.accumulated, voxel_size)
    }

    pub fn accumulated(&self) -> &PointCloud {
        &self.accumulated
    }

    pub fn into_accumulated(self) -> PointCloud {
        self.accumulated
    }
}

#[cfg(test)]
impl FusionEngine {
    pub(crate) fn for_tests() -> Self {
        Self::new(2, Arc::new(super::builder::GridCloudBuilder::default())).unwrap()
    }

    pub(crate) fn accumulated_mut(&mut self) -> &mut PointCloud {
        &mut self.accumulated
    }
}

/// Concatenate per-frame clouds in ascending frame index.
pub fn merge_in_index_order(mut results: Vec<(usize, PointCloud)>) -> PointCloud {
    results.sort_by_key(|(index, _)| *index);
    let total = results.iter().map(|(_, cloud)| cloud.len()).sum();
    let mut merged = PointCloud::with_capacity(total);
    for (_, cloud) in results {
        merged.append(cloud);
    }
    merged
}
