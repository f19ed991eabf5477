//! Cycle orchestration, visualization handoff, checkpointing and reports.

pub mod checkpoint;
pub mod orchestrator;
pub mod report;
pub mod viz;

pub use checkpoint::{
    load_manifest, CheckpointConfig, CheckpointError, CheckpointManager, FailureRecord, RunManifest, RunStatus,
};
pub use orchestrator::{
    plan_cycles, Cycle, FusionOutput, FusionPipeline, OrchestratorState, PipelineContext, PipelineError,
    StageError,
};
pub use report::{CycleReport, RunReport, StageTimings};
pub use viz::{ChannelSink, LogSink, PlyPreviewSink, VizError, VizHandoff, VizSink, VizSnapshot};
