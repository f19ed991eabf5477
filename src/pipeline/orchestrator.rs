//! Cycle orchestrator.
//!
//! Drives the pipeline through `Init -> Running(0..n) -> Finalize -> Done`.
//! Each cycle ingests its window (reported pose, vision placement), runs one
//! drift correction over every frame placed so far, fuses the window with the
//! corrected vision transforms and hands a snapshot to the viewer.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;

use super::checkpoint::{CheckpointConfig, CheckpointError, CheckpointManager};
use super::report::{millis, CycleReport, RunReport, StageTimings};
use super::viz::{LogSink, PlyPreviewSink, VizHandoff, VizSink, VizSnapshot};
use crate::chain::{ChainError, TransformChain};
use crate::config::{
    ConfigError, EstimatorKind, FusionConfig, FusionMode, MatchFailurePolicy, SinkKind,
};
use crate::core::{Frame, PointCloud, SE3};
use crate::fusion::{CloudBuilder, FusionEngine, FusionError, GridCloudBuilder, VoxelGrid};
use crate::io::{DatasetError, FrameSource};
use crate::registration::{
    CorrespondenceEstimator, DriftCorrector, DriftError, EstimationError, IdentityEstimator,
    PlacedFrame, RigidAligner, TrackMatchEstimator,
};

/// Failure inside one pipeline stage.
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error("correspondence estimation failed: {0}")]
    Estimation(#[from] EstimationError),
    #[error(transparent)]
    Drift(#[from] DriftError),
    #[error(transparent)]
    Fusion(#[from] FusionError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

fn frame_suffix(frame: &Option<usize>) -> String {
    frame.map(|f| format!(", frame {f}")).unwrap_or_default()
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("frame source is empty")]
    NoFrames,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("cycle {cycle}{}: {source}", frame_suffix(.frame))]
    Cycle {
        cycle: usize,
        frame: Option<usize>,
        #[source]
        source: StageError,
    },
}

impl PipelineError {
    fn at(cycle: usize, frame: Option<usize>, source: impl Into<StageError>) -> Self {
        PipelineError::Cycle {
            cycle,
            frame,
            source: source.into(),
        }
    }
}

/// A contiguous window of frames `[start_idx, end_idx]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cycle {
    pub index: usize,
    pub start_idx: usize,
    pub end_idx: usize,
}

impl Cycle {
    pub fn len(&self) -> usize {
        self.end_idx + 1 - self.start_idx
    }

    pub fn frames(&self) -> std::ops::RangeInclusive<usize> {
        self.start_idx..=self.end_idx
    }
}

/// Split `frame_count` frames into cycles. Online mode uses windows of
/// `window` frames (the last may be shorter); offline mode uses one window.
pub fn plan_cycles(frame_count: usize, mode: FusionMode, window: usize) -> Vec<Cycle> {
    if frame_count == 0 {
        return Vec::new();
    }
    let width = match mode {
        FusionMode::Online => window.max(1),
        FusionMode::Offline => frame_count,
    };
    (0..frame_count)
        .step_by(width)
        .enumerate()
        .map(|(index, start_idx)| Cycle {
            index,
            start_idx,
            end_idx: (start_idx + width - 1).min(frame_count - 1),
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Init,
    Running { cycle: usize },
    Finalize,
    Done,
}

/// Mutable state of one run, owned by the orchestrator thread.
pub struct PipelineContext {
    pub chain: TransformChain,
    pub engine: FusionEngine,
    /// Most recently placed frames, oldest first.
    recent: VecDeque<Arc<Frame>>,
    last_relative: SE3,
    pub reports: Vec<CycleReport>,
}

impl PipelineContext {
    pub fn new(engine: FusionEngine) -> Self {
        Self {
            chain: TransformChain::new(),
            engine,
            recent: VecDeque::new(),
            last_relative: SE3::identity(),
            reports: Vec::new(),
        }
    }
}

/// Everything a finished run produces.
pub struct FusionOutput {
    pub accumulated: PointCloud,
    pub downsampled: PointCloud,
    pub vision_positions: PointCloud,
    pub reported_positions: PointCloud,
    pub chain: TransformChain,
    pub report: RunReport,
}

impl FusionOutput {
    /// Vision positions followed by reported positions.
    pub fn camera_positions(&self) -> PointCloud {
        self.chain.combined_position_cloud()
    }
}

pub struct FusionPipeline {
    config: FusionConfig,
    estimator: Box<dyn CorrespondenceEstimator>,
    corrector: DriftCorrector,
    builder: Arc<dyn CloudBuilder>,
    viz: Option<VizHandoff>,
    state: OrchestratorState,
}

impl FusionPipeline {
    pub fn new(config: FusionConfig) -> Result<Self, PipelineError> {
        config.validate()?;

        let estimator: Box<dyn CorrespondenceEstimator> = match config.matching.estimator {
            EstimatorKind::TrackMatch => Box::new(TrackMatchEstimator::new(config.matching.min_matches)),
            EstimatorKind::Identity => Box::new(IdentityEstimator),
        };
        let corrector = DriftCorrector::default().with_reject_worsening(config.matching.reject_worsening);
        let builder = Arc::new(GridCloudBuilder {
            mode: config.cloud.mode,
            pixel_stride: config.cloud.pixel_stride,
            range_width: config.cloud.range_width,
            max_depth: config.cloud.max_depth,
        });

        let mut pipeline = Self {
            config,
            estimator,
            corrector,
            builder,
            viz: None,
            state: OrchestratorState::Init,
        };
        if pipeline.config.viewer.enabled {
            let sink: Box<dyn VizSink> = match pipeline.config.viewer.sink {
                SinkKind::Log => Box::new(LogSink),
                SinkKind::Ply => Box::new(PlyPreviewSink::new(
                    pipeline.config.output.dir.join("preview"),
                    pipeline.config.output.format,
                )),
            };
            pipeline = pipeline.with_viz_sink(sink);
        }
        Ok(pipeline)
    }

    pub fn with_estimator(mut self, estimator: Box<dyn CorrespondenceEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    /// Replace the drift aligner, keeping the configured worsening guard.
    pub fn with_aligner(mut self, aligner: Box<dyn RigidAligner>) -> Self {
        self.corrector = DriftCorrector::new(aligner).with_reject_worsening(self.config.matching.reject_worsening);
        self
    }

    pub fn with_drift_corrector(mut self, corrector: DriftCorrector) -> Self {
        self.corrector = corrector;
        self
    }

    pub fn with_cloud_builder(mut self, builder: Arc<dyn CloudBuilder>) -> Self {
        self.builder = builder;
        self
    }

    pub fn with_viz_sink(mut self, sink: Box<dyn VizSink>) -> Self {
        self.viz = Some(VizHandoff::new(sink).with_preview_voxel_size(self.config.viewer.preview_voxel_size));
        self
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    fn build_engine(&self) -> Result<FusionEngine, FusionError> {
        let downsample = &self.config.downsample;
        let cycle_voxel = match self.config.pipeline.mode {
            FusionMode::Online => None,
            FusionMode::Offline => Some(downsample.output_voxel_size),
        };
        Ok(FusionEngine::new(self.config.pipeline.batch_width, self.builder.clone())?
            .with_frame_voxel_size((downsample.frame_voxel_size > 0.0).then_some(downsample.frame_voxel_size))
            .with_cycle_voxel_size(cycle_voxel)
            .with_output_downsampler(Box::new(VoxelGrid::new(downsample.min_points_per_voxel))))
    }

    /// Process every frame of `source`.
    pub fn run(&mut self, source: &dyn FrameSource) -> Result<FusionOutput, PipelineError> {
        let started = Instant::now();
        self.state = OrchestratorState::Init;

        let frame_count = source.len();
        if frame_count == 0 {
            return Err(PipelineError::NoFrames);
        }
        let mode = self.config.pipeline.mode;
        let cycles = plan_cycles(frame_count, mode, self.config.pipeline.window);
        log::info!(
            "Fusing {} frames in {} cycle(s): mode {:?}, window {}, batch width {}, cloud {:?} (stride {}, range {}), max depth {:?}, frame voxel {}, output voxel {}, min points per voxel {}, match window {}",
            frame_count,
            cycles.len(),
            mode,
            self.config.pipeline.window,
            self.config.pipeline.batch_width,
            self.config.cloud.mode,
            self.config.cloud.pixel_stride,
            self.config.cloud.range_width,
            self.config.cloud.max_depth,
            self.config.downsample.frame_voxel_size,
            self.config.downsample.output_voxel_size,
            self.config.downsample.min_points_per_voxel,
            self.config.matching.match_window,
        );

        let engine = self.build_engine().map_err(|e| PipelineError::at(0, None, e))?;
        let mut ctx = PipelineContext::new(engine);
        let mut checkpoints = if self.config.output.checkpoint_cycles {
            let config = CheckpointConfig {
                dir: self.config.output.dir.clone(),
                format: self.config.output.format,
            };
            Some(CheckpointManager::new(config, cycles.len()).map_err(|e| PipelineError::at(0, None, e))?)
        } else {
            None
        };

        for cycle in &cycles {
            self.state = OrchestratorState::Running { cycle: cycle.index };
            let result = self.run_cycle(&mut ctx, source, cycle, cycles.len()).and_then(|report| {
                if let Some(manager) = checkpoints.as_mut() {
                    manager
                        .save_cycle(cycle.index, ctx.engine.accumulated())
                        .map_err(|e| PipelineError::at(cycle.index, None, e))?;
                }
                Ok(report)
            });

            match result {
                Ok(report) => ctx.reports.push(report),
                Err(err) => {
                    log::error!("Fusion aborted: {err}");
                    if let (Some(manager), PipelineError::Cycle { cycle, frame, .. }) = (checkpoints.as_mut(), &err) {
                        if let Err(e) = manager.mark_failed(*cycle, *frame, err.to_string()) {
                            log::error!("Failed to record failure in run manifest: {e}");
                        }
                    }
                    if let Some(viz) = self.viz.as_mut() {
                        viz.join_in_flight();
                    }
                    return Err(err);
                }
            }
        }

        self.state = OrchestratorState::Finalize;
        let last_cycle = cycles.len() - 1;
        let downsampled = match mode {
            FusionMode::Offline => ctx.engine.snapshot(),
            FusionMode::Online => ctx.engine.downsampled(self.config.downsample.output_voxel_size),
        };

        let mut report = RunReport::new(mode, frame_count);
        if let Some(viz) = self.viz.as_mut() {
            viz.join_in_flight();
            report.viz_failures = viz.failures();
        }
        if let Some(manager) = checkpoints.as_mut() {
            manager
                .mark_complete()
                .map_err(|e| PipelineError::at(last_cycle, None, e))?;
        }

        let PipelineContext {
            chain,
            engine,
            reports,
            ..
        } = ctx;
        let accumulated = engine.into_accumulated();
        report.cycles = reports;
        report.degraded_frames = chain.degraded_frames();
        report.accumulated_points = accumulated.len();
        report.downsampled_points = downsampled.len();
        report.finish(started.elapsed());
        log::info!(
            "Fused {} frames into {} points ({} after downsampling) in {:.1} ms ({:.1} frames/s)",
            frame_count,
            report.accumulated_points,
            report.downsampled_points,
            report.elapsed_ms,
            report.frames_per_second
        );

        self.state = OrchestratorState::Done;
        Ok(FusionOutput {
            accumulated,
            downsampled,
            vision_positions: chain.vision_position_cloud(),
            reported_positions: chain.reported_position_cloud(),
            chain,
            report,
        })
    }

    fn run_cycle(
        &mut self,
        ctx: &mut PipelineContext,
        source: &dyn FrameSource,
        cycle: &Cycle,
        total_cycles: usize,
    ) -> Result<CycleReport, PipelineError> {
        let c = cycle.index;
        let mut timings = StageTimings::default();

        let t = Instant::now();
        let mut window = Vec::with_capacity(cycle.len());
        let mut degraded = Vec::new();
        for index in cycle.frames() {
            let frame = source.get_frame(index).map_err(|e| PipelineError::at(c, Some(index), e))?;
            if self.place_frame(ctx, &frame, c)? {
                degraded.push(index);
            }
            window.push(frame);
        }
        timings.ingest_ms = millis(t.elapsed());

        let t = Instant::now();
        let correction = self
            .corrector
            .correct(&mut ctx.chain, &mut ctx.engine, cycle.end_idx)
            .map_err(|e| PipelineError::at(c, None, e))?;
        timings.correction_ms = millis(t.elapsed());

        let t = Instant::now();
        let fused = ctx
            .engine
            .fuse_window(&window, ctx.chain.vision())
            .map_err(|e| PipelineError::at(c, e.index(), e))?;
        let points_added = fused.len();
        ctx.engine.commit(fused);
        timings.fusion_ms = millis(t.elapsed());

        let t = Instant::now();
        if let Some(viz) = self.viz.as_mut() {
            viz.launch(VizSnapshot {
                cycle: c,
                total_cycles,
                cloud: ctx.engine.snapshot(),
                vision_positions: ctx.chain.vision_positions().to_vec(),
                reported_positions: ctx.chain.reported_positions().to_vec(),
            });
        }
        timings.handoff_ms = millis(t.elapsed());

        let report = CycleReport {
            cycle: c,
            start_idx: cycle.start_idx,
            end_idx: cycle.end_idx,
            correction: correction.transform.to_rows(),
            correction_rejected: correction.rejected,
            rms_before: correction.rms_before,
            rms_after: correction.rms_after,
            degraded_frames: degraded,
            points_added,
            accumulated_points: ctx.engine.accumulated().len(),
            timings,
        };
        log::info!(
            "Cycle {}/{} frames [{}, {}]: +{} points ({} total), drift rms {:.4} -> {:.4}, ingest {:.1} ms, correction {:.1} ms, fusion {:.1} ms, handoff {:.1} ms",
            c + 1,
            total_cycles,
            cycle.start_idx,
            cycle.end_idx,
            report.points_added,
            report.accumulated_points,
            report.rms_before,
            report.rms_after,
            timings.ingest_ms,
            timings.correction_ms,
            timings.fusion_ms,
            timings.handoff_ms
        );
        Ok(report)
    }

    /// Append both chain entries for `frame`. Returns whether the frame was
    /// placed through the failure policy.
    fn place_frame(&mut self, ctx: &mut PipelineContext, frame: &Arc<Frame>, cycle: usize) -> Result<bool, PipelineError> {
        let index = frame.index();
        let at = |e: StageError| PipelineError::Cycle {
            cycle,
            frame: Some(index),
            source: e,
        };

        let reported = ctx.chain.append_reported(frame).map_err(|e| at(e.into()))?;

        let mut degraded = false;
        let relative = if index == 0 {
            SE3::identity()
        } else {
            let placed: Vec<PlacedFrame<'_>> = ctx
                .recent
                .iter()
                .filter_map(|f| {
                    ctx.chain.vision_at(f.index()).map(|vision| PlacedFrame {
                        frame: f.as_ref(),
                        vision: *vision,
                    })
                })
                .collect();

            match self.estimator.estimate(frame, &reported, &placed) {
                Ok(relative) => {
                    ctx.last_relative = relative;
                    relative
                }
                Err(e) => match self.config.matching.failure_policy {
                    MatchFailurePolicy::Fatal => return Err(at(e.into())),
                    MatchFailurePolicy::PropagatePrevious => {
                        log::warn!("cycle {cycle}, frame {index}: {e}; reusing previous relative transform");
                        degraded = true;
                        ctx.last_relative
                    }
                    MatchFailurePolicy::ReportedPose => {
                        log::warn!("cycle {cycle}, frame {index}: {e}; placing at reported pose");
                        degraded = true;
                        SE3::identity()
                    }
                },
            }
        };

        ctx.chain.append_vision(index, &relative).map_err(|e| at(e.into()))?;
        if degraded {
            ctx.chain.mark_degraded(index).map_err(|e| at(e.into()))?;
        }

        ctx.recent.push_back(frame.clone());
        while ctx.recent.len() > self.config.matching.match_window {
            ctx.recent.pop_front();
        }
        Ok(degraded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spans(cycles: &[Cycle]) -> Vec<(usize, usize)> {
        cycles.iter().map(|c| (c.start_idx, c.end_idx)).collect()
    }

    #[test]
    fn test_plan_online() {
        let cycles = plan_cycles(5, FusionMode::Online, 2);
        assert_eq!(spans(&cycles), vec![(0, 1), (2, 3), (4, 4)]);
        assert_eq!(cycles[2].index, 2);
        assert_eq!(cycles[2].len(), 1);
    }

    #[test]
    fn test_plan_online_exact_multiple() {
        assert_eq!(spans(&plan_cycles(6, FusionMode::Online, 3)), vec![(0, 2), (3, 5)]);
    }

    #[test]
    fn test_plan_offline_single_window() {
        assert_eq!(spans(&plan_cycles(7, FusionMode::Offline, 2)), vec![(0, 6)]);
    }

    #[test]
    fn test_plan_empty() {
        assert!(plan_cycles(0, FusionMode::Online, 4).is_empty());
    }

    #[test]
    fn test_error_display_includes_location() {
        let err = PipelineError::at(2, Some(17), StageError::from(ChainError::MissingReported { index: 17 }));
        let text = err.to_string();
        assert!(text.starts_with("cycle 2, frame 17:"));
        let err = PipelineError::at(1, None, StageError::from(FusionError::ThreadPool("x".into())));
        assert!(err.to_string().starts_with("cycle 1:"));
    }
}
