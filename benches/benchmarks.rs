//! # Benchmarks
//!
//! Performance benchmarks for rustfuse.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rustfuse::core::{Frame, SE3};
use rustfuse::fusion::{Downsampler, FusionEngine, GridCloudBuilder, VoxelGrid};
use rustfuse::registration::{KabschAligner, RigidAligner};
use rustfuse::test_utils::{create_sequence, synthetic_landmarks, TrajectoryType};

fn window(frames: usize) -> (Vec<Arc<Frame>>, Vec<SE3>) {
    let frames: Vec<Arc<Frame>> = create_sequence(frames, 160, 120, TrajectoryType::Circle)
        .into_iter()
        .map(Arc::new)
        .collect();
    let transforms = frames
        .iter()
        .map(|f| f.pose().to_se3().unwrap_or_default())
        .collect();
    (frames, transforms)
}

fn fuse_window_benchmark(c: &mut Criterion) {
    let (frames, transforms) = window(14);
    let mut group = c.benchmark_group("fuse_window_14x160x120");
    for width in [1usize, 4, 7] {
        let engine = FusionEngine::new(width, Arc::new(GridCloudBuilder::dense(1))).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(width), &width, |b, _| {
            b.iter(|| engine.fuse_window(black_box(&frames), black_box(&transforms)).unwrap())
        });
    }
    group.finish();
}

fn voxel_downsample_benchmark(c: &mut Criterion) {
    let (frames, transforms) = window(10);
    let engine = FusionEngine::new(4, Arc::new(GridCloudBuilder::dense(1))).unwrap();
    let cloud = engine.fuse_window(&frames, &transforms).unwrap();
    let grid = VoxelGrid::default();

    let mut group = c.benchmark_group("voxel_downsample");
    for size in [0.05f32, 0.2, 1.0] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| grid.downsample(black_box(&cloud), size))
        });
    }
    group.finish();
}

fn drift_alignment_benchmark(c: &mut Criterion) {
    let source = synthetic_landmarks(500);
    let drift = SE3::from_axis_angle(glam::DVec3::new(0.2, 0.1, 1.0), 0.05, glam::DVec3::new(1.0, -2.0, 0.5));
    let target: Vec<_> = source.iter().map(|p| drift.transform_point(*p)).collect();
    let aligner = KabschAligner::new();

    c.bench_function("kabsch_500", |b| {
        b.iter(|| aligner.align(black_box(&source), black_box(&target)).unwrap())
    });
}

criterion_group!(
    benches,
    fuse_window_benchmark,
    voxel_downsample_benchmark,
    drift_alignment_benchmark,
);

criterion_main!(benches);
